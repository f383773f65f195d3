// gpu/projector.rs — Forward-projection collaborator.
//
// The solver only needs "render this volume through this view into this
// buffer". Any rasterizer that honours the contract below can be plugged
// in; `HostSplatProjector` is the reference, built on the host projector in
// `geometry` so that it is the exact adjoint of the backprojection kernel.

use crate::error::{FatalError, Result, Status};
use crate::geometry::{forward_project, ProjectionSet, ViewGeometry};
use crate::gpu::buffer::GpuBuffer;
use crate::gpu::device::GpuDevice;
use crate::gpu::image::{DeviceImage, GpuVolume};
use crate::volume::{Origin3, Volume};

/// Renders one view of a volume into a packed image buffer.
pub trait Projector {
    /// Overwrite `dst` with the `image_width × image_height` projection of
    /// `src` through `view`, row-major f32.
    fn project(&mut self, gpu: &GpuDevice, dst: &GpuBuffer, view: &ViewGeometry, src: &GpuVolume) -> Result<()>;
}

/// Reference projector: reads the volume back and splats on the host.
#[derive(Debug)]
pub struct HostSplatProjector {
    set: ProjectionSet,
    volume: Volume,
    image: Vec<f32>,
}

impl HostSplatProjector {
    pub fn new(set: &ProjectionSet) -> Self {
        HostSplatProjector {
            set: set.clone(),
            volume: Volume::new(Default::default()),
            image: vec![0.0; set.image_width() as usize * set.image_height() as usize],
        }
    }
}

impl Projector for HostSplatProjector {
    fn project(&mut self, gpu: &GpuDevice, dst: &GpuBuffer, view: &ViewGeometry, src: &GpuVolume) -> Result<()> {
        let needed = self.image.len() as u64 * 4;
        if dst.size() < needed {
            return Err(FatalError::new(
                Status::OutOfBounds,
                format!("{} holds {} bytes, one image needs {needed}", dst.label(), dst.size()),
            ));
        }

        if self.volume.extent() != src.extent() {
            self.volume = Volume::new(src.extent());
        }
        src.readback(gpu, &mut self.volume, Origin3::ZERO)?;

        forward_project(&self.volume, view, &self.set, &mut self.image);
        dst.write(gpu, 0, &self.image)
    }
}

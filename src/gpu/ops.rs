// gpu/ops.rs — The solver's volume kernels.
//
//   combine            dst = a_scale·a + b_scale·b            (volume WG)
//   backproject        Aᵗ: image array → volume                (volume WG)
//   buffer_to_slice    packed buffer → one volume z-slice      (planar WG)
//   volume_to_buffer   volume → packed buffer                  (volume WG)
//
// All four are compiled once into `VolumeKernels` and reused every
// iteration. Each call enqueues one dispatch on the shared queue; nothing
// here blocks unless kernel timing is enabled.

use crate::error::{FatalError, Result, Status};
use crate::geometry::{ProjectionSet, ViewGeometry};
use crate::gpu::buffer::GpuBuffer;
use crate::gpu::device::GpuDevice;
use crate::gpu::image::{DeviceImage, GpuVolume};
use crate::gpu::kernel::{compile_kernel, ArgKind, ImageDim, Kernel, KernelArg};
use crate::volume::Extent3;

const VOLUME_TEXTURE: ArgKind = ArgKind::Texture(ImageDim::D3);
const VOLUME_STORAGE: ArgKind = ArgKind::StorageTexture(ImageDim::D3);

// ---------------------------------------------------------------------------
// Uniform layouts (must match the WGSL structs exactly)
// ---------------------------------------------------------------------------

/// `CombineParams` in combine.wgsl: 32 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct CombineParams {
    width: u32,
    height: u32,
    depth: u32,
    _pad: u32,
    a_scale: f32,
    b_scale: f32,
    _pad1: f32,
    _pad2: f32,
}

/// `BackprojectParams` in backproject.wgsl: 32 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct BackprojectParams {
    vol_w: u32,
    vol_h: u32,
    vol_d: u32,
    view_count: u32,
    image_w: u32,
    image_h: u32,
    _pad0: u32,
    _pad1: u32,
}

/// `SliceParams` in buffer_to_slice.wgsl, also `PackParams` in
/// volume_to_buffer.wgsl: 16 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ExtentParams {
    a: u32,
    b: u32,
    c: u32,
    _pad: u32,
}

/// One view as uploaded to `views` in backproject.wgsl: three vec4 rows,
/// 48 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuView {
    pub rows: [[f32; 4]; 3],
}

impl From<&ViewGeometry> for GpuView {
    fn from(view: &ViewGeometry) -> Self {
        GpuView { rows: *view.rows() }
    }
}

/// Upload every view of `set` as a read-only storage array.
pub fn upload_views(gpu: &GpuDevice, set: &ProjectionSet) -> Result<GpuBuffer> {
    let views: Vec<GpuView> = set.views().iter().map(GpuView::from).collect();
    GpuBuffer::from_slice(gpu, &views, "projection views")
}

// ---------------------------------------------------------------------------
// VolumeKernels
// ---------------------------------------------------------------------------

/// The compiled kernels the solver needs.
#[derive(Debug)]
pub struct VolumeKernels {
    combine: Kernel,
    backproject: Kernel,
    buffer_to_slice: Kernel,
    volume_to_buffer: Kernel,
}

impl VolumeKernels {
    pub fn new(gpu: &GpuDevice) -> Result<Self> {
        let volume_wg = gpu.workgroup_size;
        let planar_wg = volume_wg.planar();

        let combine = compile_kernel(
            gpu,
            include_str!("../shaders/combine.wgsl"),
            "combine",
            &[VOLUME_TEXTURE, VOLUME_TEXTURE, VOLUME_STORAGE, ArgKind::Uniform],
            volume_wg,
        )?;
        let backproject = compile_kernel(
            gpu,
            include_str!("../shaders/backproject.wgsl"),
            "backproject",
            &[VOLUME_TEXTURE, ArgKind::Buffer { read_only: true }, VOLUME_STORAGE, ArgKind::Uniform],
            volume_wg,
        )?;
        let buffer_to_slice = compile_kernel(
            gpu,
            include_str!("../shaders/buffer_to_slice.wgsl"),
            "buffer_to_slice",
            &[ArgKind::Buffer { read_only: true }, VOLUME_STORAGE, ArgKind::Uniform],
            planar_wg,
        )?;
        let volume_to_buffer = compile_kernel(
            gpu,
            include_str!("../shaders/volume_to_buffer.wgsl"),
            "volume_to_buffer",
            &[VOLUME_TEXTURE, ArgKind::Buffer { read_only: false }, ArgKind::Uniform],
            volume_wg,
        )?;

        Ok(VolumeKernels { combine, backproject, buffer_to_slice, volume_to_buffer })
    }

    /// Enable or disable wall-time reporting on every kernel.
    pub fn set_timing(&mut self, enabled: bool) {
        for kernel in [
            &mut self.combine,
            &mut self.backproject,
            &mut self.buffer_to_slice,
            &mut self.volume_to_buffer,
        ] {
            kernel.set_timing(enabled);
        }
    }

    pub fn timing(&self) -> bool {
        self.combine.timing()
    }

    /// `dst ← dst_scale·dst + scale·src`.
    ///
    /// With `src == None` the destination is its own source. The result is
    /// written into `spare` and the two volumes are swapped, so on return
    /// `spare` holds the previous contents of `dst`.
    pub fn update(
        &self,
        gpu: &GpuDevice,
        dst: &mut GpuVolume,
        dst_scale: f32,
        src: Option<&GpuVolume>,
        scale: f32,
        spare: &mut GpuVolume,
    ) -> Result<()> {
        let extent = dst.extent();
        for (other, what) in [(src.map(|s| s.extent()), "source"), (Some(spare.extent()), "spare")] {
            if let Some(other) = other {
                if other != extent {
                    return Err(FatalError::new(
                        Status::InvalidValue,
                        format!("update {what} is {other}, destination is {extent}"),
                    ));
                }
            }
        }

        let params = CombineParams {
            width: extent.width,
            height: extent.height,
            depth: extent.depth,
            _pad: 0,
            a_scale: dst_scale,
            b_scale: scale,
            _pad1: 0.0,
            _pad2: 0.0,
        };
        let src = src.unwrap_or(&*dst);
        self.combine
            .launch()
            .bind(0, KernelArg::volume(&*dst))?
            .bind(1, KernelArg::volume(src))?
            .bind(2, KernelArg::volume(&*spare))?
            .bind(3, KernelArg::uniform(&params))?
            .dispatch(gpu, extent_array(extent))?;

        std::mem::swap(dst, spare);
        Ok(())
    }

    /// Backproject the image array into `dst` (overwritten).
    ///
    /// `views` is the buffer from [`upload_views`] for `set`.
    pub fn backproject(
        &self,
        gpu: &GpuDevice,
        images: &GpuVolume,
        set: &ProjectionSet,
        views: &GpuBuffer,
        dst: &GpuVolume,
    ) -> Result<()> {
        if images.extent() != set.image_array_extent() {
            return Err(FatalError::new(
                Status::InvalidValue,
                format!(
                    "image array is {}, projection set needs {}",
                    images.extent(),
                    set.image_array_extent()
                ),
            ));
        }
        let extent = dst.extent();
        let params = BackprojectParams {
            vol_w: extent.width,
            vol_h: extent.height,
            vol_d: extent.depth,
            view_count: set.len() as u32,
            image_w: set.image_width(),
            image_h: set.image_height(),
            _pad0: 0,
            _pad1: 0,
        };
        self.backproject
            .launch()
            .bind(0, KernelArg::volume(images))?
            .bind(1, KernelArg::buffer(views))?
            .bind(2, KernelArg::volume(dst))?
            .bind(3, KernelArg::uniform(&params))?
            .dispatch(gpu, extent_array(extent))?;
        Ok(())
    }

    /// Copy a packed `width × height` buffer into z-slice `slice` of
    /// `volume`.
    pub fn copy_buffer_to_volume_slice(
        &self,
        gpu: &GpuDevice,
        buffer: &GpuBuffer,
        volume: &GpuVolume,
        slice: u32,
    ) -> Result<()> {
        let extent = volume.extent();
        if slice >= extent.depth {
            return Err(FatalError::new(
                Status::OutOfBounds,
                format!("slice {slice} of {} ({extent})", volume.label()),
            ));
        }
        let needed = extent.width as u64 * extent.height as u64 * 4;
        if buffer.size() < needed {
            return Err(FatalError::new(
                Status::OutOfBounds,
                format!("{} holds {} bytes, slice needs {needed}", buffer.label(), buffer.size()),
            ));
        }
        let params = ExtentParams { a: extent.width, b: extent.height, c: slice, _pad: 0 };
        self.buffer_to_slice
            .launch()
            .bind(0, KernelArg::buffer(buffer))?
            .bind(1, KernelArg::volume(volume))?
            .bind(2, KernelArg::uniform(&params))?
            .dispatch(gpu, [extent.width, extent.height, 1])?;
        Ok(())
    }

    /// Pack the whole of `volume` into `buffer`.
    pub fn copy_volume_to_buffer(&self, gpu: &GpuDevice, volume: &GpuVolume, buffer: &GpuBuffer) -> Result<()> {
        let extent = volume.extent();
        let needed = extent.texel_count() as u64 * 4;
        if buffer.size() < needed {
            return Err(FatalError::new(
                Status::OutOfBounds,
                format!("{} holds {} bytes, {} needs {needed}", buffer.label(), buffer.size(), volume.label()),
            ));
        }
        let params = ExtentParams { a: extent.width, b: extent.height, c: extent.depth, _pad: 0 };
        self.volume_to_buffer
            .launch()
            .bind(0, KernelArg::volume(volume))?
            .bind(1, KernelArg::buffer(buffer))?
            .bind(2, KernelArg::uniform(&params))?
            .dispatch(gpu, extent_array(extent))?;
        Ok(())
    }
}

fn extent_array(extent: Extent3) -> [u32; 3] {
    [extent.width, extent.height, extent.depth]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

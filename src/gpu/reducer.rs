// gpu/reducer.rs — Whole-volume dot products.
//
// CG needs two inner products per iteration, ⟨p, AᵗAp⟩ and ⟨r, r⟩. The
// solver asks a `Reducer` for them and blocks on the answer; those two calls
// are the only host synchronisation points inside an iteration.
//
//   GpuReducer   per-workgroup tree reduction on the device, partials
//                summed on the host in f32
//   HostReducer  reads both volumes back and sums on the host

use crate::error::{FatalError, Result, Status};
use crate::gpu::buffer::GpuBuffer;
use crate::gpu::device::{GpuDevice, WorkgroupSize};
use crate::gpu::image::{DeviceImage, GpuVolume};
use crate::gpu::kernel::{compile_kernel, ArgKind, ImageDim, Kernel, KernelArg};
use crate::volume::dot;

/// Upper bound on workgroups per reduction. Beyond this each invocation
/// loops over more voxels instead.
const MAX_GROUPS: u32 = 1024;

/// Computes ⟨a, b⟩ over two volumes of equal extent.
pub trait Reducer {
    fn dot(&mut self, gpu: &GpuDevice, a: &GpuVolume, b: &GpuVolume) -> Result<f32>;
}

#[track_caller]
fn check_same_extent(a: &GpuVolume, b: &GpuVolume) -> Result<()> {
    if a.extent() != b.extent() {
        return Err(FatalError::new(
            Status::InvalidValue,
            format!("dot of {} ({}) and {} ({})", a.label(), a.extent(), b.label(), b.extent()),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// GpuReducer
// ---------------------------------------------------------------------------

/// `DotParams` in dot.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct DotParams {
    count: u32,
    groups: u32,
    _pad0: u32,
    _pad1: u32,
}

/// Device tree reduction.
#[derive(Debug)]
pub struct GpuReducer {
    kernel: Kernel,
    workgroup: WorkgroupSize,
    partials: GpuBuffer,
}

impl GpuReducer {
    pub fn new(gpu: &GpuDevice) -> Result<Self> {
        let workgroup = gpu.workgroup_size.linear();
        let kernel = compile_kernel(
            gpu,
            include_str!("../shaders/dot.wgsl"),
            "dot_partial",
            &[
                ArgKind::Texture(ImageDim::D3),
                ArgKind::Texture(ImageDim::D3),
                ArgKind::Buffer { read_only: false },
                ArgKind::Uniform,
            ],
            workgroup,
        )?;
        let partials = GpuBuffer::new(gpu, MAX_GROUPS as u64 * 4, "dot partials")?;
        Ok(GpuReducer { kernel, workgroup, partials })
    }

    fn groups_for(&self, count: usize) -> u32 {
        let wg = self.workgroup.total() as usize;
        count.div_ceil(wg).clamp(1, MAX_GROUPS as usize) as u32
    }
}

impl Reducer for GpuReducer {
    fn dot(&mut self, gpu: &GpuDevice, a: &GpuVolume, b: &GpuVolume) -> Result<f32> {
        check_same_extent(a, b)?;
        let count = a.extent().texel_count();
        let count_u32 = u32::try_from(count).map_err(|_| {
            FatalError::new(Status::InvalidValue, format!("{} has too many voxels to reduce", a.label()))
        })?;
        let groups = self.groups_for(count);
        let params = DotParams { count: count_u32, groups, _pad0: 0, _pad1: 0 };

        self.kernel
            .launch()
            .bind(0, KernelArg::volume(a))?
            .bind(1, KernelArg::volume(b))?
            .bind(2, KernelArg::buffer(&self.partials))?
            .bind(3, KernelArg::uniform(&params))?
            .dispatch(gpu, [groups * self.workgroup.x, 1, 1])?;

        let mut partials = vec![0.0f32; groups as usize];
        self.partials.read(gpu, 0, &mut partials)?;
        Ok(partials.iter().sum())
    }
}

// ---------------------------------------------------------------------------
// HostReducer
// ---------------------------------------------------------------------------

/// Reads both volumes back and sums on the host.
#[derive(Debug, Default)]
pub struct HostReducer;

impl Reducer for HostReducer {
    fn dot(&mut self, gpu: &GpuDevice, a: &GpuVolume, b: &GpuVolume) -> Result<f32> {
        check_same_extent(a, b)?;
        let ha = a.readback_all(gpu)?;
        if std::ptr::eq(a, b) {
            return Ok(dot(ha.as_slice(), ha.as_slice()));
        }
        let hb = b.readback_all(gpu)?;
        Ok(dot(ha.as_slice(), hb.as_slice()))
    }
}

// gpu/kernel.rs — WGSL compilation, positional argument binding, dispatch.
//
// A `Kernel` is one compiled compute entry point plus the ordered list of
// argument kinds it expects. Binding slot `i` is `@binding(i)` in
// `@group(0)`; the bind group layout is built from the signature, so a
// signature that disagrees with the shader fails at compile time with
// `BUILD_PROGRAM_FAILURE` instead of at dispatch.
//
// WORKGROUP PLACEHOLDERS
// ──────────────────────
// naga does not accept `override` expressions inside `@workgroup_size()`,
// so workgroup dimensions are baked into the source by string replacement:
//
//   {{WG_X}} {{WG_Y}} {{WG_Z}}   per-axis size
//   {{WG_SIZE}}                  x·y·z, for workgroup-shared arrays
//
// LAUNCHING
// ─────────
//   kernel.launch()
//       .bind(0, KernelArg::volume(&a))?
//       .bind(1, KernelArg::uniform(&params))?
//       .dispatch(gpu, [w, h, d])?;
//
// Binding overwrites whatever was at that index. `dispatch` refuses to run
// with an unbound slot. The global size is rounded up to whole workgroups;
// shaders bounds-check the overhang.
//
// PROGRAM CACHE
// ─────────────
// Pipelines are cached on the device, keyed by specialised source, entry
// point and signature. Every `Kernel` compiled from the same key shares one
// pipeline; only the timing flag is per `Kernel`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytemuck::Pod;
use wgpu::util::DeviceExt;

use crate::error::{FatalError, Result, Status};
use crate::gpu::buffer::GpuBuffer;
use crate::gpu::device::{GpuDevice, WorkgroupSize};
use crate::gpu::image::{DeviceImage, GpuImage2D, GpuVolume, FORMAT};

/// Number of compiler diagnostic lines kept in a build failure.
const DIAGNOSTIC_LINES: usize = 16;

/// Texture dimensionality of an image argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageDim {
    D2,
    D3,
}

impl ImageDim {
    fn view_dimension(self) -> wgpu::TextureViewDimension {
        match self {
            ImageDim::D2 => wgpu::TextureViewDimension::D2,
            ImageDim::D3 => wgpu::TextureViewDimension::D3,
        }
    }
}

/// The kind of one kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// Read through `textureLoad` (`texture_2d<f32>` / `texture_3d<f32>`).
    Texture(ImageDim),
    /// Written through `textureStore` (`texture_storage_*d<r32float, write>`).
    StorageTexture(ImageDim),
    /// `var<storage, read>` or `var<storage, read_write>`.
    Buffer { read_only: bool },
    /// `var<uniform>`; bound by value.
    Uniform,
}

impl ArgKind {
    fn layout_entry(self, binding: u32) -> wgpu::BindGroupLayoutEntry {
        let ty = match self {
            ArgKind::Texture(dim) => wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: dim.view_dimension(),
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
            },
            ArgKind::StorageTexture(dim) => wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: FORMAT,
                view_dimension: dim.view_dimension(),
            },
            ArgKind::Buffer { read_only } => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            ArgKind::Uniform => wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
        };
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty,
            count: None,
        }
    }
}

/// A value bound to one argument slot.
pub enum KernelArg<'a> {
    Image { view: &'a wgpu::TextureView, dim: ImageDim },
    Buffer(&'a wgpu::Buffer),
    Uniform(Vec<u8>),
}

impl<'a> KernelArg<'a> {
    pub fn volume(volume: &'a GpuVolume) -> Self {
        KernelArg::Image { view: volume.view(), dim: ImageDim::D3 }
    }

    pub fn image(image: &'a GpuImage2D) -> Self {
        KernelArg::Image { view: image.view(), dim: ImageDim::D2 }
    }

    pub fn buffer(buffer: &'a GpuBuffer) -> Self {
        KernelArg::Buffer(buffer.raw())
    }

    pub fn uniform<T: Pod>(value: &T) -> Self {
        KernelArg::Uniform(bytemuck::bytes_of(value).to_vec())
    }

    fn fits(&self, kind: ArgKind) -> bool {
        match (self, kind) {
            (KernelArg::Image { dim, .. }, ArgKind::Texture(want))
            | (KernelArg::Image { dim, .. }, ArgKind::StorageTexture(want)) => *dim == want,
            (KernelArg::Buffer(_), ArgKind::Buffer { .. }) => true,
            (KernelArg::Uniform(_), ArgKind::Uniform) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for KernelArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelArg::Image { dim, .. } => write!(f, "Image({dim:?})"),
            KernelArg::Buffer(_) => f.write_str("Buffer"),
            KernelArg::Uniform(bytes) => write!(f, "Uniform({} bytes)", bytes.len()),
        }
    }
}

/// A built pipeline and its bind group layout, shared through the cache.
struct Program {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    source: String,
    entry_point: String,
    signature: Vec<ArgKind>,
}

/// Per-device cache of built programs.
#[derive(Default)]
pub(crate) struct ProgramCache {
    programs: Mutex<HashMap<ProgramKey, Arc<Program>>>,
}

impl ProgramCache {
    pub(crate) fn len(&self) -> usize {
        self.programs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl fmt::Debug for ProgramCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProgramCache({} programs)", self.len())
    }
}

/// A compiled compute kernel.
pub struct Kernel {
    program: Arc<Program>,
    entry_point: String,
    signature: Vec<ArgKind>,
    workgroup: WorkgroupSize,
    timing: bool,
}

/// Replace the workgroup placeholders in `source`.
pub fn specialize(source: &str, workgroup: WorkgroupSize) -> String {
    source
        .replace("{{WG_X}}", &workgroup.x.to_string())
        .replace("{{WG_Y}}", &workgroup.y.to_string())
        .replace("{{WG_Z}}", &workgroup.z.to_string())
        .replace("{{WG_SIZE}}", &workgroup.total().to_string())
}

/// Compile `entry_point` from WGSL `source`.
///
/// A program already built on `gpu` for the same specialised source, entry
/// point and signature is reused. Failure to parse, validate, or build the
/// pipeline is `BUILD_PROGRAM_FAILURE` with the first lines of the compiler
/// output; failures are not cached.
pub fn compile_kernel(
    gpu: &GpuDevice,
    source: &str,
    entry_point: &str,
    signature: &[ArgKind],
    workgroup: WorkgroupSize,
) -> Result<Kernel> {
    let key = ProgramKey {
        source: specialize(source, workgroup),
        entry_point: entry_point.to_owned(),
        signature: signature.to_vec(),
    };
    let mut programs = gpu.programs().programs.lock().unwrap_or_else(PoisonError::into_inner);
    let program = match programs.get(&key).cloned() {
        Some(program) => {
            tracing::trace!(entry_point, workgroup = %workgroup, "kernel reused");
            program
        }
        None => {
            let program = Arc::new(build_program(gpu, &key)?);
            programs.insert(key, Arc::clone(&program));
            tracing::debug!(entry_point, workgroup = %workgroup, args = signature.len(), "kernel compiled");
            program
        }
    };
    drop(programs);

    Ok(Kernel {
        program,
        entry_point: entry_point.to_owned(),
        signature: signature.to_vec(),
        workgroup,
        timing: false,
    })
}

fn build_program(gpu: &GpuDevice, key: &ProgramKey) -> Result<Program> {
    let ProgramKey { source, entry_point, signature } = key;
    let entry_point = entry_point.as_str();
    let entries: Vec<_> = signature
        .iter()
        .enumerate()
        .map(|(i, kind)| kind.layout_entry(i as u32))
        .collect();

    let (pipeline, bgl) = gpu
        .checked(Status::BuildProgramFailure, entry_point, |d| {
            let module = d.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(entry_point),
                source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
            });
            let bgl = d.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(entry_point),
                entries: &entries,
            });
            let layout = d.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(entry_point),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
            let pipeline = d.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&layout),
                module: &module,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            (pipeline, bgl)
        })
        .map_err(|mut e| {
            e.message = first_lines(&e.message, DIAGNOSTIC_LINES);
            e
        })?;
    Ok(Program { pipeline, bgl })
}

fn first_lines(text: &str, n: usize) -> String {
    text.lines().take(n).collect::<Vec<_>>().join("\n")
}

impl Kernel {
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn signature(&self) -> &[ArgKind] {
        &self.signature
    }

    pub fn workgroup(&self) -> WorkgroupSize {
        self.workgroup
    }

    /// When enabled, every dispatch waits for completion and reports its
    /// wall time.
    pub fn set_timing(&mut self, enabled: bool) {
        self.timing = enabled;
    }

    pub fn timing(&self) -> bool {
        self.timing
    }

    /// Start binding arguments for one dispatch.
    pub fn launch<'a>(&self) -> Launch<'_, 'a> {
        Launch {
            kernel: self,
            slots: (0..self.signature.len()).map(|_| None).collect(),
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("entry_point", &self.entry_point)
            .field("signature", &self.signature)
            .field("workgroup", &self.workgroup)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

/// Arguments being collected for one dispatch of a [`Kernel`].
pub struct Launch<'k, 'a> {
    kernel: &'k Kernel,
    slots: Vec<Option<KernelArg<'a>>>,
}

impl<'k, 'a> Launch<'k, 'a> {
    /// Bind `arg` at `index`, replacing any earlier binding there.
    #[track_caller]
    pub fn bind(&mut self, index: usize, arg: KernelArg<'a>) -> Result<&mut Self> {
        let Some(&kind) = self.kernel.signature.get(index) else {
            return Err(FatalError::new(
                Status::InvalidKernelArgs,
                format!(
                    "{}: argument index {index} out of range ({} slots)",
                    self.kernel.entry_point,
                    self.kernel.signature.len()
                ),
            ));
        };
        if !arg.fits(kind) {
            return Err(FatalError::new(
                Status::InvalidKernelArgs,
                format!("{}: argument {index} expects {kind:?}, got {arg:?}", self.kernel.entry_point),
            ));
        }
        self.slots[index] = Some(arg);
        Ok(self)
    }

    /// Enqueue the kernel over `global` invocations.
    ///
    /// Returns the wall time when timing is enabled on the kernel, after
    /// waiting for completion; otherwise returns as soon as the work is
    /// submitted.
    pub fn dispatch(&self, gpu: &GpuDevice, global: [u32; 3]) -> Result<Option<Duration>> {
        let kernel = self.kernel;
        if let Some(missing) = self.slots.iter().position(Option::is_none) {
            return Err(FatalError::new(
                Status::InvalidKernelArgs,
                format!("{}: argument {missing} is not bound", kernel.entry_point),
            ));
        }

        let groups = kernel.workgroup.groups_for(global);
        let max = gpu.device.limits().max_compute_workgroups_per_dimension;
        if groups.iter().any(|&g| g > max) {
            return Err(FatalError::new(
                Status::InvalidValue,
                format!("{}: {groups:?} workgroups exceed the limit of {max}", kernel.entry_point),
            ));
        }

        // Uniforms are bound by value: each gets a fresh buffer.
        let uniforms: Vec<Option<wgpu::Buffer>> = self
            .slots
            .iter()
            .map(|slot| match slot {
                Some(KernelArg::Uniform(bytes)) => {
                    Some(gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("kernel uniform"),
                        contents: bytes,
                        usage: wgpu::BufferUsages::UNIFORM,
                    }))
                }
                _ => None,
            })
            .collect();

        let entries: Vec<wgpu::BindGroupEntry> = self
            .slots
            .iter()
            .zip(&uniforms)
            .enumerate()
            .filter_map(|(i, (slot, uniform))| {
                let resource = match (slot.as_ref()?, uniform) {
                    (KernelArg::Image { view, .. }, _) => wgpu::BindingResource::TextureView(*view),
                    (KernelArg::Buffer(buffer), _) => buffer.as_entire_binding(),
                    (KernelArg::Uniform(_), Some(buffer)) => buffer.as_entire_binding(),
                    (KernelArg::Uniform(_), None) => return None,
                };
                Some(wgpu::BindGroupEntry { binding: i as u32, resource })
            })
            .collect();

        let bind_group = gpu.checked(Status::InvalidKernelArgs, &kernel.entry_point, |d| {
            d.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&kernel.entry_point),
                layout: &kernel.program.bgl,
                entries: &entries,
            })
        })?;

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&kernel.entry_point),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&kernel.entry_point),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.program.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }

        let start = Instant::now();
        gpu.checked(Status::ValidationFailed, &kernel.entry_point, |_| {
            gpu.queue.submit(std::iter::once(encoder.finish()));
        })?;
        tracing::trace!(kernel = %kernel.entry_point, ?global, ?groups, "dispatched");

        if !kernel.timing {
            return Ok(None);
        }
        gpu.wait_idle();
        let elapsed = start.elapsed();
        tracing::debug!(kernel = %kernel.entry_point, ?elapsed, "kernel timed");
        Ok(Some(elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::test_support::run_gpu_test_in_subprocess;
    use crate::volume::Extent3;

    #[test]
    fn test_specialize_replaces_every_placeholder() {
        let src = "@workgroup_size({{WG_X}}, {{WG_Y}}, {{WG_Z}}) var<workgroup> s: array<f32, {{WG_SIZE}}>;";
        let out = specialize(src, WorkgroupSize { x: 8, y: 4, z: 2 });
        assert_eq!(out, "@workgroup_size(8, 4, 2) var<workgroup> s: array<f32, 64>;");
    }

    #[test]
    fn test_first_lines_truncates() {
        let text = (0..40).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let kept = first_lines(&text, DIAGNOSTIC_LINES);
        assert_eq!(kept.lines().count(), 16);
        assert!(kept.ends_with("line 15"));
    }

    #[test]
    fn test_arg_fits_kind() {
        let u = KernelArg::Uniform(vec![0; 16]);
        assert!(u.fits(ArgKind::Uniform));
        assert!(!u.fits(ArgKind::Buffer { read_only: true }));
    }

    const FILL: &str = r#"
@group(0) @binding(0) var dst: texture_storage_3d<r32float, write>;
@group(0) @binding(1) var<uniform> value: vec4<f32>;

@compute @workgroup_size({{WG_X}}, {{WG_Y}}, {{WG_Z}})
fn fill(@builtin(global_invocation_id) gid: vec3<u32>) {
    let dims = textureDimensions(dst);
    if (any(gid >= dims)) { return; }
    textureStore(dst, vec3<i32>(gid), vec4<f32>(value.x, 0.0, 0.0, 1.0));
}
"#;

    fn fill_signature() -> [ArgKind; 2] {
        [ArgKind::StorageTexture(ImageDim::D3), ArgKind::Uniform]
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_compile_bind_dispatch() {
        let gpu = GpuDevice::new().expect("device");
        let mut kernel = compile_kernel(&gpu, FILL, "fill", &fill_signature(), gpu.workgroup_size)
            .expect("compile");
        kernel.set_timing(true);

        let extent = Extent3::new(9, 5, 3);
        let vol = GpuVolume::filled(&gpu, extent, 0.0, "vol").unwrap();
        let mut launch = kernel.launch();
        launch.bind(1, KernelArg::uniform(&[1.0f32, 0.0, 0.0, 0.0])).unwrap();
        // Rebinding overwrites.
        launch.bind(1, KernelArg::uniform(&[2.5f32, 0.0, 0.0, 0.0])).unwrap();
        launch.bind(0, KernelArg::volume(&vol)).unwrap();
        let elapsed = launch.dispatch(&gpu, [9, 5, 3]).unwrap();
        assert!(elapsed.is_some());

        let host = vol.readback_all(&gpu).unwrap();
        assert!(host.as_slice().iter().all(|&v| v == 2.5));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_invalid_kernel_args() {
        let gpu = GpuDevice::new().expect("device");
        let kernel = compile_kernel(&gpu, FILL, "fill", &fill_signature(), gpu.workgroup_size)
            .expect("compile");
        let vol = GpuVolume::filled(&gpu, Extent3::cube(2), 0.0, "vol").unwrap();

        let mut launch = kernel.launch();
        launch.bind(0, KernelArg::volume(&vol)).unwrap();
        let err = launch.dispatch(&gpu, [2, 2, 2]).unwrap_err();
        assert_eq!(err.status, Status::InvalidKernelArgs);

        let err = launch.bind(1, KernelArg::volume(&vol)).err().unwrap();
        assert_eq!(err.status, Status::InvalidKernelArgs);
        let err = launch.bind(5, KernelArg::uniform(&0u32)).err().unwrap();
        assert_eq!(err.status, Status::InvalidKernelArgs);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_compile_failure_reports_diagnostics() {
        let gpu = GpuDevice::new().expect("device");
        let broken = "@compute @workgroup_size(1) fn main() { let x: f32 = undefined_name; }";
        let err = compile_kernel(&gpu, broken, "main", &[], gpu.workgroup_size).unwrap_err();
        assert_eq!(err.status, Status::BuildProgramFailure);
        assert!(err.message.lines().count() <= DIAGNOSTIC_LINES);
        assert_eq!(gpu.compiled_programs(), 0, "failed builds must not be cached");
        println!("{}", err.message);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_programs_built_once_per_key() {
        let gpu = GpuDevice::new().expect("device");
        let wg = gpu.workgroup_size;
        assert_eq!(gpu.compiled_programs(), 0);

        let mut first = compile_kernel(&gpu, FILL, "fill", &fill_signature(), wg).expect("compile");
        let second = compile_kernel(&gpu, FILL, "fill", &fill_signature(), wg).expect("compile");
        assert_eq!(gpu.compiled_programs(), 1);
        assert!(Arc::ptr_eq(&first.program, &second.program));

        // Timing stays per kernel.
        first.set_timing(true);
        assert!(first.timing() && !second.timing());

        // A different workgroup is a different program.
        let planar = compile_kernel(&gpu, FILL, "fill", &fill_signature(), wg.planar()).expect("compile");
        assert_eq!(gpu.compiled_programs(), 2);
        assert!(!Arc::ptr_eq(&first.program, &planar.program));

        // Cached kernels still dispatch.
        let vol = GpuVolume::filled(&gpu, Extent3::cube(3), 0.0, "vol").unwrap();
        second
            .launch()
            .bind(0, KernelArg::volume(&vol))
            .unwrap()
            .bind(1, KernelArg::uniform(&[4.0f32, 0.0, 0.0, 0.0]))
            .unwrap()
            .dispatch(&gpu, [3, 3, 3])
            .unwrap();
        assert!(vol.readback_all(&gpu).unwrap().as_slice().iter().all(|&v| v == 4.0));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_compile_bind_dispatch() {
        let out = run_gpu_test_in_subprocess("gpu::kernel::tests::inner_compile_bind_dispatch");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_invalid_kernel_args() {
        let out = run_gpu_test_in_subprocess("gpu::kernel::tests::inner_invalid_kernel_args");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_programs_built_once_per_key() {
        let out = run_gpu_test_in_subprocess("gpu::kernel::tests::inner_programs_built_once_per_key");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_compile_failure_reports_diagnostics() {
        let out = run_gpu_test_in_subprocess(
            "gpu::kernel::tests::inner_compile_failure_reports_diagnostics",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}

// gpu/device.rs — wgpu device context.
//
// Responsibilities:
//   - Enumerate adapters and select one (first enumerated, or first
//     hardware adapter when `prefer_hardware` is set).
//   - Request a device with limits matching the active `DeviceProfile`.
//   - Route asynchronous device errors to the process-wide error channel.
//   - Provide the once-guarded process context (`initialize_device`).
//   - Provide `WorkgroupSize` for volume, planar and linear kernels.
//   - Wrap device calls in error scopes so validation and allocation
//     failures come back as `FatalError` values instead of callbacks.
//
// PROCESS CONTEXT:
// `initialize_device` stores the device in a `OnceLock`. A mutex serialises
// the first initialisation so two threads racing to initialise cannot create
// two devices; every later call returns the stored context unchanged.
// Nothing here runs at load time: the context exists only after the first
// explicit call. Resource constructors take `&GpuDevice`, so tests and tools
// can also build a private device with `GpuDevice::new()`.
//
// ERROR ROUTING:
// wgpu reports most failures asynchronously through the device's
// uncaptured-error handler. We install a handler that forwards to
// `report_fatal`, and in `checked()` we push Validation + OutOfMemory error
// scopes around a call so the error is returned synchronously with a
// symbolic status instead.
//
// FIELD DROP ORDER:
// `_instance` is declared last so the `wgpu::Instance` outlives `device` and
// `queue`.

use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::config::{DeviceConfig, DeviceProfile};
use crate::error::{report_fatal, FatalError, Result, Status};
use crate::gpu::kernel::ProgramCache;
use crate::gpu::sampler::{SamplerPreset, SamplerSet};

/// A workgroup configuration for compute dispatches.
///
/// All dimensions are powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y * z).
    pub fn total(&self) -> u32 {
        self.x * self.y * self.z
    }

    /// Same invocation count laid out as a 2-D tile (z = 1).
    pub fn planar(&self) -> Self {
        let total = self.total();
        let side = 1u32 << (total.trailing_zeros() / 2);
        WorkgroupSize { x: side, y: total / side, z: 1 }
    }

    /// Same invocation count laid out along x.
    pub fn linear(&self) -> Self {
        WorkgroupSize { x: self.total(), y: 1, z: 1 }
    }

    /// Validated default for volume kernels.
    ///
    /// - `Native`: 8×8×4 = 256 invocations, the wgpu default limit.
    /// - `Portable`: 4×4×4 = 64, leaving headroom under downlevel limits.
    fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 8, y: 8, z: 4 },
            DeviceProfile::Portable => WorkgroupSize { x: 4, y: 4, z: 4 },
        }
    }

    /// Number of workgroups covering `global` invocations on each axis
    /// (ceiling division). Shaders guard the overhang with a bounds check.
    pub fn groups_for(&self, global: [u32; 3]) -> [u32; 3] {
        [
            global[0].div_ceil(self.x),
            global[1].div_ceil(self.y),
            global[2].div_ceil(self.z),
        ]
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}×{} ({} invocations)", self.x, self.y, self.z, self.total())
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The device context: adapter, device, queue, profile, samplers.
///
/// Expensive to create. Hold one for the lifetime of the process, either
/// through [`initialize_device`] or by owning one directly.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    samplers: SamplerSet,
    programs: ProgramCache,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` are
    /// dropped. Never access this field directly.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a device from the first enumerated adapter with `Native`
    /// limits.
    pub fn new() -> Result<Self> {
        Self::with_config(&DeviceConfig::default())
    }

    /// Create a device with an explicit configuration.
    pub fn with_config(config: &DeviceConfig) -> Result<Self> {
        pollster::block_on(Self::init_async(config))
    }

    async fn init_async(config: &DeviceConfig) -> Result<Self> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let all_adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        if all_adapters.is_empty() {
            return Err(FatalError::new(
                Status::DeviceNotFound,
                "no compute adapter found; check that a Vulkan, Metal or DX12 driver is installed",
            ));
        }

        for a in &all_adapters {
            let info = a.get_info();
            tracing::info!(
                name = %info.name,
                backend = ?info.backend,
                device_type = ?info.device_type,
                "compute adapter"
            );
        }

        let hardware = |a: &wgpu::Adapter| {
            !matches!(a.get_info().device_type, wgpu::DeviceType::Cpu)
        };
        let position = if config.prefer_hardware {
            all_adapters.iter().position(hardware).unwrap_or(0)
        } else {
            0
        };
        let Some(adapter) = all_adapters.into_iter().nth(position) else {
            return Err(FatalError::new(Status::DeviceNotFound, "adapter list changed during selection"));
        };

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        // Border clamping and filterable R32Float are optional: samplers fall
        // back when they are missing, kernels never need them.
        let optional = wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER
            | wgpu::Features::FLOAT32_FILTERABLE;
        let required_features = adapter.features() & optional;

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("tomo-cg"),
                    required_features,
                    required_limits: limits_for_profile(config.profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| {
                FatalError::new(Status::DeviceRequestFailed, format!("{adapter_info}: {e}"))
            })?;

        device.on_uncaptured_error(Box::new(|error| {
            report_fatal("uncaptured device error", &[&error.to_string()]);
        }));

        let samplers = SamplerSet::new(&device, required_features);
        let workgroup_size = WorkgroupSize::for_profile(config.profile);

        tracing::info!(adapter = %adapter_info, profile = %config.profile, workgroup = %workgroup_size, "device ready");

        Ok(GpuDevice {
            device,
            queue,
            profile: config.profile,
            adapter_info,
            workgroup_size,
            samplers,
            programs: ProgramCache::default(),
            _instance: instance,
        })
    }

    /// Sampler for one of the fixed presets.
    pub fn sampler(&self, preset: SamplerPreset) -> &wgpu::Sampler {
        self.samplers.get(preset)
    }

    pub(crate) fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    /// Number of distinct compute programs built on this device so far.
    pub fn compiled_programs(&self) -> usize {
        self.programs.len()
    }

    /// Whether the border-clamping preset really clamps to border.
    pub fn supports_border_clamp(&self) -> bool {
        self.samplers.border_supported()
    }

    /// Run `f` inside Validation and OutOfMemory error scopes.
    ///
    /// An allocation failure maps to `OUT_OF_RESOURCES`; a validation
    /// failure maps to `failure`. The message is prefixed with `context`.
    #[track_caller]
    pub(crate) fn checked<T>(
        &self,
        failure: Status,
        context: &str,
        f: impl FnOnce(&wgpu::Device) -> T,
    ) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());

        if let Some(e) = out_of_memory {
            return Err(FatalError::new(Status::OutOfResources, format!("{context}: {e}")));
        }
        if let Some(e) = validation {
            return Err(FatalError::new(failure, format!("{context}: {e}")));
        }
        Ok(value)
    }

    /// Block until every submitted command has finished.
    pub fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

// ============================================================
// Process context
// ============================================================

static CONTEXT: OnceLock<GpuDevice> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialise the process-wide device context, exactly once.
///
/// The first call creates the device from `config`; later calls ignore
/// their argument and return the existing context.
pub fn initialize_device(config: &DeviceConfig) -> Result<&'static GpuDevice> {
    if let Some(ctx) = CONTEXT.get() {
        return Ok(ctx);
    }
    let _guard = INIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(ctx) = CONTEXT.get() {
        tracing::debug!("device context initialised by another caller");
        return Ok(ctx);
    }
    let ctx = GpuDevice::with_config(config)?;
    Ok(CONTEXT.get_or_init(|| ctx))
}

/// The process-wide context, if [`initialize_device`] has succeeded.
pub fn device_context() -> Option<&'static GpuDevice> {
    CONTEXT.get()
}

// ============================================================
// Limits helpers
// ============================================================

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::Portable => wgpu::Limits::downlevel_defaults(),
    }
}

// ============================================================
// Tests
// ============================================================

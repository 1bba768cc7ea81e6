// gpu/device.rs -- wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate adapters and select the best non-software one.
//   - Expose a `DeviceProfile` for simulating hardware limits on a
//     development machine (e.g., cap invocations to match Raspberry Pi).
//   - Provide `WorkgroupSize`, validated against the active profile and
//     baked into the compute shader when the pipeline is created.
//   - Own the `BufferLedger` through which every device buffer this crate
//     creates is accounted for.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe on WSL2 (where the software renderer appears
// as a valid Vulkan device). We enumerate explicitly and only fall back to
// a CPU adapter when nothing else exists.
//
// DEVICE LIMITS:
// Under a non-Native profile we request *lower* limits than the hardware
// supports. wgpu validates every dispatch and buffer binding against the
// requested limits, so a matrix that would not fit on the target device is
// rejected on the laptop too.

use std::fmt;

use log::{debug, info};
use thiserror::Error;

use crate::gpu::buffer::BufferLedger;

/// Hardware profile controlling device limits and default workgroup sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Use the adapter's default limits. No artificial caps.
    Native,
    /// Simulate Raspberry Pi 4/5 (VideoCore VI/VII, V3DV Vulkan).
    /// Caps invocations per workgroup at 256 and storage bindings at 128 MiB.
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// Configuration for [`GpuDevice::with_config`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub profile: DeviceProfile,
    /// Backends to enumerate adapters from.
    ///
    /// Defaults to `Backends::PRIMARY` (Vulkan, Metal, DX12, WebGPU). GL is
    /// opt-in: a host whose only adapter is GL needs `Backends::all()` or
    /// `Backends::GL` here.
    pub backends: wgpu::Backends,
    /// Upper bound on live device bytes held by this crate's buffers.
    /// `None` means only the device limits apply.
    pub memory_budget: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            profile: DeviceProfile::Native,
            backends: wgpu::Backends::PRIMARY,
            memory_budget: None,
        }
    }
}

/// A workgroup size for 2D compute dispatches.
///
/// The product `x * y` must not exceed the profile's
/// `max_compute_invocations_per_workgroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Default for each profile.
    ///
    /// - `Native`: 16×8 = 128 invocations, 4 NVIDIA warps or 2 AMD waves.
    ///   The 16-wide x dimension walks along a row of the row-major input.
    /// - `RaspberryPi`: 8×8 = 64, well inside V3DV's 256 limit.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::RaspberryPi => WorkgroupSize { x: 8, y: 8 },
        }
    }

    /// Number of workgroups needed to cover a `w × h` grid.
    ///
    /// Ceiling division: the last workgroup in each axis may hang over the
    /// edge, so the shader must guard
    /// `if gid.x >= width || gid.y >= height { return; }`.
    pub fn dispatch_size(&self, w: u32, h: u32) -> (u32, u32) {
        (w.div_ceil(self.x), h.div_ceil(self.y))
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
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

/// The GPU context: device, queue, profile, and buffer ledger.
///
/// Create once and pass by reference to every [`crate::gpu::conv2d::GpuConv2d`]
/// call. Creation is expensive (instance + device initialization).
///
/// # Field drop order
/// Fields drop top to bottom. `_instance` is last so the `wgpu::Instance`
/// outlives `device` and `queue`; dzn (D3D12-to-Vulkan on WSL2) crashes if
/// the instance goes first.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    ledger: BufferLedger,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a device with [`DeviceConfig::default`].
    pub fn new() -> Result<Self, GpuError> {
        Self::with_config(DeviceConfig::default())
    }

    /// Create a device with an explicit hardware profile and default
    /// backends.
    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        Self::with_config(DeviceConfig { profile, ..DeviceConfig::default() })
    }

    pub fn with_config(config: DeviceConfig) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(config))
    }

    async fn init_async(config: DeviceConfig) -> Result<Self, GpuError> {
        // Validation layer in debug builds for shader error feedback.
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER lets dzn on WSL2 show up;
        // compute-only work does not depend on rendering conformance.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: config.backends,
            flags,
            ..Default::default()
        });

        // Tiered selection:
        //   1. any real or virtual GPU (discrete, integrated, virtual, other)
        //   2. last resort: a CPU/software adapter, logged so you know
        let adapters = instance.enumerate_adapters(config.backends);
        for a in &adapters {
            let info = a.get_info();
            debug!("adapter candidate: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }
        let (hardware, software): (Vec<wgpu::Adapter>, Vec<wgpu::Adapter>) = adapters
            .into_iter()
            .partition(|a| a.get_info().device_type != wgpu::DeviceType::Cpu);
        let adapter = hardware
            .into_iter()
            .next()
            .or_else(|| software.into_iter().next())
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };
        info!("selected adapter: {adapter_info}");

        // Auto-detect RPi when the caller passed Native but the adapter is V3D.
        let profile = match config.profile {
            DeviceProfile::Native if raw_info.name.to_ascii_lowercase().contains("v3d") => {
                info!("V3D adapter detected, using RaspberryPi profile");
                DeviceProfile::RaspberryPi
            }
            other => other,
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("conv2d-gpu"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits_for_profile(profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        Ok(GpuDevice {
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size: WorkgroupSize::for_profile(profile),
            ledger: BufferLedger::new(config.memory_budget),
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validating against the profile.
    ///
    /// Takes effect for pipelines created afterwards.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), GpuError> {
        self.workgroup_size = validate_workgroup_size(self.profile, x, y)?;
        Ok(())
    }

    /// Accounting for every live device buffer created through this device.
    pub fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    /// Largest single buffer the device will accept as a storage binding.
    pub fn max_buffer_bytes(&self) -> u64 {
        let limits = self.device.limits();
        limits.max_buffer_size.min(limits.max_storage_buffer_binding_size as u64)
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
// Limits helpers
// ============================================================

/// Build wgpu limits for the given profile.
fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),

        DeviceProfile::RaspberryPi => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            // RPi 4 shares 4 GiB with the CPU; 128 MiB per binding is safe.
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

fn max_invocations_for_profile(profile: DeviceProfile) -> u32 {
    limits_for_profile(profile).max_compute_invocations_per_workgroup
}

fn validate_workgroup_size(profile: DeviceProfile, x: u32, y: u32) -> Result<WorkgroupSize, GpuError> {
    let total = x.saturating_mul(y);
    let max = max_invocations_for_profile(profile);
    if x == 0 || y == 0 || total > max {
        return Err(GpuError::WorkgroupTooLarge { total, max });
    }
    Ok(WorkgroupSize { x, y })
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU device initialization and configuration.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No adapter was enumerated on the requested backends.
    #[error(
        "no suitable GPU adapter found. On WSL2: ensure Vulkan is installed \
         and `vulkaninfo` lists a real GPU"
    )]
    NoSuitableAdapter,

    /// wgpu device request failed (driver issue, unsupported limits, etc.).
    #[error("device request failed: {0}")]
    DeviceRequest(#[source] wgpu::RequestDeviceError),

    /// Requested workgroup size is zero or exceeds the profile's invocation
    /// limit.
    #[error("workgroup size {total} is outside the profile limit of 1..={max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },
}

// ============================================================
// Tests
// ============================================================

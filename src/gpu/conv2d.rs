// gpu/conv2d.rs -- GPU valid-mode 2D cross-correlation.
//
// ONE CALL, ONE DISPATCH
// ───────────────────────
// `GpuConv2d::convolve` runs the whole request synchronously:
//
//   validate dims → allocate input/kernel/output/params/readback
//     → upload input + kernel → dispatch → copy output → readback
//     → wait (the only blocking point) → destroy buffers
//
// and reports the wall-clock time of everything from the first allocation
// to the last release. Nothing survives the call except the compiled
// pipeline, which holds no per-call data and is reused across calls.
//
// OUTPUT STRATEGY: dense buffer, one slot per invocation
// ──────────────────────────────────────────────────────
// Invocation (x, y) writes only dst[y * out_w + x]. No two invocations share
// a slot and the input/kernel buffers are read-only, so the compute pass
// needs no atomics and no barriers.
//
// RELEASE ON FAILURE
// ──────────────────
// All buffers are `DeviceBuffer` locals of `run()`. When any step returns
// early with `?`, the ones already created drop (and are destroyed) before
// the error leaves the function. See gpu/buffer.rs.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::convolution::output_dims;
use crate::error::ConvError;
use crate::gpu::buffer::DeviceBuffer;
use crate::gpu::device::{GpuDevice, WorkgroupSize};
use crate::matrix::Matrix;

// ---------------------------------------------------------------------------
// Uniform params (must match WGSL struct ConvParams exactly)
// ---------------------------------------------------------------------------

/// Layout, 32 bytes (uniforms must be a multiple of 16):
///   offset  0: input_width     offset 16: output_width
///   offset  4: input_height    offset 20: output_height
///   offset  8: kernel_width    offset 24: _pad0
///   offset 12: kernel_height   offset 28: _pad1
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct ConvParams {
    input_width:   u32,
    input_height:  u32,
    kernel_width:  u32,
    kernel_height: u32,
    output_width:  u32,
    output_height: u32,
    _pad0:         u32,
    _pad1:         u32,
}

impl ConvParams {
    fn new(input: &Matrix, kernel: &Matrix, out_w: usize, out_h: usize) -> Self {
        ConvParams {
            input_width:   input.width() as u32,
            input_height:  input.height() as u32,
            kernel_width:  kernel.width() as u32,
            kernel_height: kernel.height() as u32,
            output_width:  out_w as u32,
            output_height: out_h as u32,
            _pad0: 0,
            _pad1: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Output of one [`GpuConv2d::convolve`] call.
#[derive(Debug, Clone)]
pub struct Convolution {
    /// `(W_in - W_k + 1) × (H_in - H_k + 1)` result.
    pub output: Matrix,
    /// Wall-clock time from the first device allocation to the last release.
    pub elapsed: Duration,
}

impl Convolution {
    pub fn elapsed_ms(&self) -> u128 {
        self.elapsed.as_millis()
    }
}

// ---------------------------------------------------------------------------
// GpuConv2d
// ---------------------------------------------------------------------------

/// Compiled GPU pipeline for valid cross-correlation.
///
/// Create once; call [`GpuConv2d::convolve`] as often as needed.
pub struct GpuConv2d {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    /// Workgroup size baked into `pipeline`. Dispatch sizes are derived from
    /// this, not from the device, so a later `set_workgroup_size` cannot
    /// desynchronise the two.
    workgroup_size: WorkgroupSize,
}

impl GpuConv2d {
    /// Compile `conv2d.wgsl` with the device's current workgroup size.
    pub fn new(gpu: &GpuDevice) -> Self {
        // naga does not accept `override` expressions inside
        // @workgroup_size(), so the dimensions are substituted textually.
        let workgroup_size = gpu.workgroup_size;
        let shader_src = include_str!("../shaders/conv2d.wgsl")
            .replace("{{WG_X}}", &workgroup_size.x.to_string())
            .replace("{{WG_Y}}", &workgroup_size.y.to_string());

        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label:  Some("conv2d.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("GpuConv2d BGL"),
            entries: &[
                // 0: input, 1: kernel (both read-only storage)
                storage(0, true),
                storage(1, true),
                // 2: output (storage read_write)
                storage(2, false),
                // 3: params uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout =
            gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("GpuConv2d pipeline layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });

        let pipeline =
            gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label:               Some("correlate_valid"),
                layout:              Some(&pipeline_layout),
                module:              &shader,
                entry_point:         "correlate_valid",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache:               None,
            });

        GpuConv2d { pipeline, bgl, workgroup_size }
    }

    pub fn workgroup_size(&self) -> WorkgroupSize {
        self.workgroup_size
    }

    /// Valid cross-correlation of `input` by `kernel` on the GPU.
    ///
    /// # Errors
    /// - `ConvError::Dimension` / `EmptyMatrix` before any device work.
    /// - `ConvError::Allocation` if a buffer exceeds the device limit or the
    ///   memory budget, or the driver reports out-of-memory.
    ///   `ConvError::DispatchTooLarge` (same reason code) if the output needs
    ///   more workgroups per axis than the device allows.
    /// - `ConvError::Transfer` if an upload or the readback fails.
    ///
    /// Device buffers acquired before a failure are released before the
    /// error is returned.
    pub fn convolve(
        &self,
        gpu: &GpuDevice,
        input: &Matrix,
        kernel: &Matrix,
    ) -> Result<Convolution, ConvError> {
        let (out_w, out_h) = output_dims(input, kernel)?;
        debug!(
            "conv2d: input {}×{}, kernel {}×{}, output {out_w}×{out_h}",
            input.width(), input.height(), kernel.width(), kernel.height()
        );

        let start = Instant::now();
        let result = self.run(gpu, input, kernel, out_w, out_h);
        let elapsed = start.elapsed();

        match result {
            Ok(output) => {
                debug!("conv2d: done in {elapsed:?}");
                Ok(Convolution { output, elapsed })
            }
            Err(err) => {
                warn!("conv2d: failed after {elapsed:?}: {err}");
                Err(err)
            }
        }
    }

    /// Allocation through release. Every `DeviceBuffer` is local, so all of
    /// them are destroyed by the time this returns, on success or error.
    fn run(
        &self,
        gpu: &GpuDevice,
        input: &Matrix,
        kernel: &Matrix,
        out_w: usize,
        out_h: usize,
    ) -> Result<Matrix, ConvError> {
        let (wg_x, wg_y) = self.workgroup_size.dispatch_size(out_w as u32, out_h as u32);
        let max_groups = gpu.device.limits().max_compute_workgroups_per_dimension;
        if wg_x > max_groups || wg_y > max_groups {
            return Err(ConvError::DispatchTooLarge { groups_x: wg_x, groups_y: wg_y, max: max_groups });
        }

        let out_bytes = (out_w * out_h * std::mem::size_of::<f32>()) as u64;

        let input_buf = DeviceBuffer::upload(
            gpu, "conv2d input", input.as_slice(), wgpu::BufferUsages::STORAGE,
        )?;
        let kernel_buf = DeviceBuffer::upload(
            gpu, "conv2d kernel", kernel.as_slice(), wgpu::BufferUsages::STORAGE,
        )?;
        let output_buf = DeviceBuffer::allocate(
            gpu,
            "conv2d output",
            out_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        )?;
        let params = ConvParams::new(input, kernel, out_w, out_h);
        let params_buf = DeviceBuffer::upload(
            gpu, "conv2d params", std::slice::from_ref(&params), wgpu::BufferUsages::UNIFORM,
        )?;
        let readback_buf = DeviceBuffer::allocate(
            gpu,
            "conv2d readback",
            out_bytes,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        )?;

        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label:  Some("GpuConv2d BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: input_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: kernel_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: output_buf.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
            ],
        });

        debug!("conv2d: dispatching {wg_x}×{wg_y} workgroups of {}", self.workgroup_size);
        let mut encoder = gpu.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor { label: Some("GpuConv2d dispatch") },
        );
        {
            let mut pass = encoder.begin_compute_pass(
                &wgpu::ComputePassDescriptor { label: Some("correlate_valid"), timestamp_writes: None },
            );
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(wg_x, wg_y, 1);
        }
        encoder.copy_buffer_to_buffer(output_buf.buffer(), 0, readback_buf.buffer(), 0, out_bytes);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let data: Vec<f32> = readback_buf.read(gpu)?;
        Matrix::try_from_vec(out_w, out_h, data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolution::correlate_valid;
    use crate::error::ErrorKind;
    use crate::gpu::device::{DeviceConfig, DeviceProfile};
    use crate::gpu::run_gpu_test_in_subprocess;

    fn ramp(w: usize, h: usize) -> Matrix {
        Matrix::from_fn(w, h, |x, y| (y * w + x + 1) as f32)
    }

    fn edge_kernel() -> Matrix {
        Matrix::from_vec(3, 3, vec![
            1.0, 0.0, -1.0,
            1.0, 0.0, -1.0,
            1.0, 0.0, -1.0,
        ])
    }

    /// Deterministic pseudo-random matrix in [-1, 1) (LCG, no extra deps).
    fn noise(w: usize, h: usize, seed: u32) -> Matrix {
        let mut rng = seed;
        Matrix::from_fn(w, h, |_, _| {
            rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
            (rng >> 8) as f32 / (1u32 << 23) as f32 - 1.0
        })
    }

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<ConvParams>(), 32);
        let p = ConvParams::new(&Matrix::new(5, 4), &Matrix::new(3, 2), 3, 3);
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&p));
        assert_eq!(words, &[5, 4, 3, 2, 3, 3, 0, 0]);
    }

    // ---- Inner tests (run inside the subprocess) ----------------------------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_fixed_scenario() {
        let gpu = GpuDevice::new().expect("need a GPU");
        let conv = GpuConv2d::new(&gpu);
        let result = conv.convolve(&gpu, &ramp(5, 5), &edge_kernel()).unwrap();
        assert_eq!((result.output.width(), result.output.height()), (3, 3));
        for (x, y, v) in result.output.elements() {
            assert_eq!(v, -6.0, "mismatch at ({x}, {y})");
        }
        assert!(result.elapsed > Duration::ZERO);
        assert_eq!(gpu.ledger().live_buffers(), 0);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_matches_cpu() {
        let gpu = GpuDevice::new_with_profile(DeviceProfile::RaspberryPi).expect("need a GPU");
        let conv = GpuConv2d::new(&gpu);
        // Shapes chosen so the output is not a multiple of the 8×8 workgroup.
        for (iw, ih, kw, kh) in [(37, 23, 5, 3), (64, 64, 7, 7), (9, 100, 1, 9), (13, 13, 13, 13)] {
            let input = noise(iw, ih, 7 + iw as u32);
            let kernel = noise(kw, kh, 99 + kh as u32);
            let cpu = correlate_valid(&input, &kernel).unwrap();
            // Σ|term| per element bounds the rounding difference between two
            // f32 summations (the GPU may fuse multiply-adds).
            let abs = |m: &Matrix| Matrix::from_fn(m.width(), m.height(), |x, y| m.get(x, y).abs());
            let magnitude = correlate_valid(&abs(&input), &abs(&kernel)).unwrap();
            let n = (kw * kh + 1) as f32;
            let gpu_out = conv.convolve(&gpu, &input, &kernel).unwrap().output;
            assert_eq!((gpu_out.width(), gpu_out.height()), (cpu.width(), cpu.height()));
            for ((x, y, g), (c, m)) in gpu_out.elements().zip(cpu.as_slice().iter().zip(magnitude.as_slice())) {
                let tol = 1e-5 * c.abs() + n * f32::EPSILON * m + 1e-6;
                assert!((g - c).abs() <= tol, "{iw}×{ih} * {kw}×{kh} at ({x},{y}): GPU={g} CPU={c}");
            }
        }
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_identity_and_zero_kernels() {
        let gpu = GpuDevice::new().expect("need a GPU");
        let conv = GpuConv2d::new(&gpu);
        let input = noise(31, 17, 3);

        let identity = conv.convolve(&gpu, &input, &Matrix::from_vec(1, 1, vec![1.0])).unwrap();
        assert_eq!(identity.output, input);

        let zero = conv.convolve(&gpu, &input, &Matrix::new(4, 6)).unwrap();
        assert!(zero.output.as_slice().iter().all(|&v| v == 0.0));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_no_leak_on_success_and_failure() {
        // Budget fits input (5×5) + kernel (3×3) + 8 bytes, but not the
        // 36-byte output: the third allocation fails after two succeeded.
        let budget = (25 + 9) * 4 + 8;
        let gpu = GpuDevice::with_config(DeviceConfig {
            memory_budget: Some(budget),
            ..DeviceConfig::default()
        })
        .expect("need a GPU");
        let conv = GpuConv2d::new(&gpu);

        for _ in 0..20 {
            let err = conv.convolve(&gpu, &ramp(5, 5), &edge_kernel()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::AllocationFailure);
            assert!(matches!(err, ConvError::Allocation { label: "conv2d output", .. }));
            assert_eq!(gpu.ledger().live_buffers(), 0);
            assert_eq!(gpu.ledger().live_bytes(), 0);
        }

        // Within budget the same ledger runs clean, repeatedly.
        for _ in 0..20 {
            conv.convolve(&gpu, &ramp(2, 2), &Matrix::from_vec(1, 1, vec![2.0])).unwrap();
            assert_eq!(gpu.ledger().live_buffers(), 0);
        }
        assert!(gpu.ledger().peak_bytes() <= budget);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_dimension_error_touches_nothing() {
        let gpu = GpuDevice::new().expect("need a GPU");
        let conv = GpuConv2d::new(&gpu);
        let err = conv.convolve(&gpu, &Matrix::new(3, 3), &Matrix::new(4, 2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionError);
        assert_eq!(gpu.ledger().peak_bytes(), 0);
        println!("GPU_TEST_OK");
    }

    // ---- Outer tests ---------------------------------------------------------

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_fixed_scenario() {
        let out = run_gpu_test_in_subprocess("gpu::conv2d::tests::inner_fixed_scenario");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_gpu_matches_cpu() {
        let out = run_gpu_test_in_subprocess("gpu::conv2d::tests::inner_gpu_matches_cpu");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_identity_and_zero_kernels() {
        let out = run_gpu_test_in_subprocess("gpu::conv2d::tests::inner_identity_and_zero_kernels");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_no_leak_on_success_and_failure() {
        let out = run_gpu_test_in_subprocess("gpu::conv2d::tests::inner_no_leak_on_success_and_failure");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_dimension_error_touches_nothing() {
        let out = run_gpu_test_in_subprocess("gpu::conv2d::tests::inner_dimension_error_touches_nothing");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}

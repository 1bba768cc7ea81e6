// gpu/mod.rs -- GPU acceleration layer.
//
// wgpu compute implementation of the valid cross-correlation in
// `convolution.rs`. The CPU version stays the authoritative reference;
// every GPU result is validated against it.
//
// Layering:
//
//   device.rs  adapter selection, limits, workgroup size, buffer ledger
//   buffer.rs  scoped device buffers (allocate / upload / read / destroy)
//   conv2d.rs  compiled pipeline + the one-shot `convolve` orchestration
//
// Shaders live in src/shaders/ and are embedded with `include_str!`.

pub mod buffer;
pub mod conv2d;
pub mod device;

/// Run one `#[ignore]`d inner GPU test in a child `cargo test` process and
/// return its combined stdout + stderr.
///
/// dzn (D3D12-to-Vulkan on WSL2) segfaults in its own exit handler once a
/// device has been created in the process, so the exit status is useless.
/// Inner tests print `GPU_TEST_OK` as their last line and the outer test
/// checks for that token instead.
#[cfg(test)]
pub(crate) fn run_gpu_test_in_subprocess(test_name: &str) -> String {
    let output = std::process::Command::new("cargo")
        .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    print!("{stdout}");
    eprint!("{stderr}");
    stdout + &stderr
}

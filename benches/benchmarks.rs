// benches/benchmarks.rs -- CPU reference benchmarks.
//
//   cargo bench --bench benchmarks
//
// Baseline for the GPU numbers in gpu_benchmarks.rs. Input sizes grow while
// the kernel stays fixed, then the kernel grows on a fixed input.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use conv2d_gpu::convolution::correlate_valid;
use conv2d_gpu::matrix::Matrix;

// ============================================================
// Helpers
// ============================================================

/// Smooth gradient plus a checker term, so no row or column is constant.
fn make_input(w: usize, h: usize) -> Matrix {
    Matrix::from_fn(w, h, |x, y| {
        let checker = if (x / 8 + y / 8) % 2 == 0 { 1.0 } else { -1.0 };
        (x as f32 * 0.01) + (y as f32 * 0.02) + checker
    })
}

fn box_kernel(k: usize) -> Matrix {
    Matrix::from_vec(k, k, vec![1.0 / (k * k) as f32; k * k])
}

// ============================================================
// Benchmarks
// ============================================================

fn bench_input_size(c: &mut Criterion) {
    let kernel = box_kernel(3);
    let mut group = c.benchmark_group("cpu_input_size");
    for &n in &[64usize, 256, 752] {
        let input = make_input(n, n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &input, |b, input| {
            b.iter(|| correlate_valid(input, &kernel))
        });
    }
    group.finish();
}

fn bench_kernel_size(c: &mut Criterion) {
    let input = make_input(256, 256);
    let mut group = c.benchmark_group("cpu_kernel_size");
    for &k in &[3usize, 7, 15] {
        let kernel = box_kernel(k);
        group.bench_with_input(BenchmarkId::from_parameter(k), &kernel, |b, kernel| {
            b.iter(|| correlate_valid(&input, kernel))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_input_size, bench_kernel_size);
criterion_main!(benches);

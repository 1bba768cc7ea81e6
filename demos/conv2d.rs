// demos/conv2d.rs -- run the fixed 5×5 / 3×3 scenario on the GPU.
//
// USAGE
// ─────
//   cargo run --example conv2d                # prints elapsed time only
//   cargo run --example conv2d -- --print     # also prints the 3×3 output
//   RUST_LOG=debug cargo run --example conv2d # allocation/dispatch trace
//
// Expected output with --print: three rows of "-6 -6 -6".

use conv2d_gpu::{GpuConv2d, GpuDevice, Matrix};

fn main() {
    env_logger::init();
    let print_output = std::env::args().any(|a| a == "--print");

    #[rustfmt::skip]
    let input = Matrix::from_vec(5, 5, vec![
         1.0,  2.0,  3.0,  4.0,  5.0,
         6.0,  7.0,  8.0,  9.0, 10.0,
        11.0, 12.0, 13.0, 14.0, 15.0,
        16.0, 17.0, 18.0, 19.0, 20.0,
        21.0, 22.0, 23.0, 24.0, 25.0,
    ]);
    #[rustfmt::skip]
    let kernel = Matrix::from_vec(3, 3, vec![
        1.0, 0.0, -1.0,
        1.0, 0.0, -1.0,
        1.0, 0.0, -1.0,
    ]);

    let gpu = match GpuDevice::new() {
        Ok(gpu) => gpu,
        Err(e) => {
            eprintln!("[conv2d] failed to initialise a GPU: {e}");
            std::process::exit(1);
        }
    };
    eprintln!("[conv2d] {gpu}");

    let conv = GpuConv2d::new(&gpu);
    match conv.convolve(&gpu, &input, &kernel) {
        Ok(result) => {
            if print_output {
                println!("Convolution Output:");
                print!("{}", result.output);
            }
            println!("conv2d elapsed time: {} milliseconds", result.elapsed_ms());
        }
        Err(e) => {
            eprintln!("[conv2d] {e} ({:?})", e.kind());
            std::process::exit(1);
        }
    }
}

// convolution.rs -- CPU reference for valid-mode 2D cross-correlation.
//
// This is the authoritative implementation: the GPU kernel in
// `gpu/conv2d.rs` is validated against it element for element.
//
//   out[y][x] = Σ_j Σ_i  input[y + j][x + i] * kernel[j][i]
//
// "Valid" means the kernel window is only placed where it fits entirely
// inside the input, so the output shrinks by (kernel_dim - 1) on each axis.
// "Cross-correlation" means the kernel is NOT flipped. For symmetric
// kernels the distinction does not matter; for an edge kernel like
// [1, 0, -1] it flips the sign of the response.
//
// There is no border handling because no window ever crosses the border.

use crate::error::ConvError;
use crate::matrix::Matrix;

/// Output dimensions of a valid cross-correlation of `input` by `kernel`.
///
/// # Errors
/// `ConvError::EmptyMatrix` if either matrix has a zero dimension,
/// `ConvError::Dimension` if the kernel exceeds the input on either axis.
pub fn output_dims(input: &Matrix, kernel: &Matrix) -> Result<(usize, usize), ConvError> {
    for (role, m) in [("input", input), ("kernel", kernel)] {
        if m.width() == 0 || m.height() == 0 {
            return Err(ConvError::EmptyMatrix { role, width: m.width(), height: m.height() });
        }
    }
    if kernel.width() > input.width() || kernel.height() > input.height() {
        return Err(ConvError::Dimension {
            input_w: input.width(),
            input_h: input.height(),
            kernel_w: kernel.width(),
            kernel_h: kernel.height(),
        });
    }
    Ok((
        input.width() - kernel.width() + 1,
        input.height() - kernel.height() + 1,
    ))
}

/// Valid cross-correlation on the CPU, single threaded, f32 accumulation.
///
/// Summation order is row-major over the kernel window (j outer, i inner),
/// the same order the GPU shader uses.
pub fn correlate_valid(input: &Matrix, kernel: &Matrix) -> Result<Matrix, ConvError> {
    let (out_w, out_h) = output_dims(input, kernel)?;
    let kw = kernel.width();
    let kh = kernel.height();

    let mut out = Matrix::new(out_w, out_h);
    for y in 0..out_h {
        for x in 0..out_w {
            let mut acc = 0.0f32;
            for j in 0..kh {
                // Window row and kernel row have the same length, so the zip
                // never truncates.
                let src = &input.row(y + j)[x..x + kw];
                for (&s, &k) in src.iter().zip(kernel.row(j)) {
                    acc += s * k;
                }
            }
            out.set(x, y, acc);
        }
    }
    Ok(out)
}

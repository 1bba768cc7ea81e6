// conv2d-gpu: valid-mode 2D cross-correlation on the GPU (wgpu compute)
//
// Host matrices in, host matrix out. One call allocates device buffers,
// uploads input and kernel, dispatches one shader invocation per output
// element, reads the result back, releases everything, and reports how long
// that took. `convolution` holds the CPU reference every GPU result is
// checked against.

pub mod convolution;
pub mod error;
pub mod gpu;
pub mod matrix;

pub use convolution::{correlate_valid, output_dims};
pub use error::{ConvError, ErrorKind};
pub use gpu::conv2d::{Convolution, GpuConv2d};
pub use gpu::device::{DeviceConfig, DeviceProfile, GpuDevice};
pub use matrix::Matrix;

// error.rs -- Error taxonomy for the convolution pipeline.
//
// Every failure the host side can observe funnels into `ConvError`. Callers
// that only care about *why* an operation failed match on `ConvError::kind()`
// and get one of four reason codes; callers that want detail (which buffer,
// how many bytes, what the driver said) match on the variant itself.
//
// The device kernel has no error path of its own. Anything it could do wrong
// (out-of-bounds access) is prevented by the host validating dimensions
// before dispatch.

use thiserror::Error;

use crate::gpu::device::GpuError;

/// Reason code for a failed convolution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Kernel larger than input on some axis, an empty matrix, or a data
    /// vector whose length disagrees with the declared shape.
    DimensionError,
    /// Device storage (or dispatch capacity) could not be acquired.
    AllocationFailure,
    /// A host↔device copy did not complete.
    TransferFailure,
    /// The GPU device itself could not be created or configured.
    Device,
}

/// Errors returned by [`crate::gpu::conv2d::GpuConv2d::convolve`] and the
/// CPU reference in [`crate::convolution`].
#[derive(Debug, Error)]
pub enum ConvError {
    #[error(
        "kernel {kernel_w}×{kernel_h} does not fit inside input {input_w}×{input_h}"
    )]
    Dimension {
        input_w: usize,
        input_h: usize,
        kernel_w: usize,
        kernel_h: usize,
    },

    #[error("{role} matrix is empty ({width}×{height})")]
    EmptyMatrix {
        role: &'static str,
        width: usize,
        height: usize,
    },

    #[error("data length {len} does not match {width}×{height}")]
    Shape { width: usize, height: usize, len: usize },

    #[error("failed to allocate {bytes} bytes for device buffer `{label}`: {reason}")]
    Allocation {
        label: &'static str,
        bytes: u64,
        reason: String,
    },

    #[error("dispatch of {groups_x}×{groups_y} workgroups exceeds the device limit of {max} per dimension")]
    DispatchTooLarge { groups_x: u32, groups_y: u32, max: u32 },

    #[error("transfer of device buffer `{label}` failed: {reason}")]
    Transfer { label: &'static str, reason: String },

    #[error(transparent)]
    Device(#[from] GpuError),
}

impl ConvError {
    /// Collapse the variant into its reason code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvError::Dimension { .. }
            | ConvError::EmptyMatrix { .. }
            | ConvError::Shape { .. } => ErrorKind::DimensionError,
            ConvError::Allocation { .. } | ConvError::DispatchTooLarge { .. } => {
                ErrorKind::AllocationFailure
            }
            ConvError::Transfer { .. } => ErrorKind::TransferFailure,
            ConvError::Device(_) => ErrorKind::Device,
        }
    }
}

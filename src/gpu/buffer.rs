// gpu/buffer.rs -- Scoped device buffers and the ledger that counts them.
//
// Every byte of device memory this crate touches goes through a
// `DeviceBuffer`. Creating one:
//
//   1. checks the request against the device's per-buffer limit,
//   2. reserves the bytes in the device's `BufferLedger` (which enforces the
//      optional memory budget),
//   3. creates the wgpu buffer inside an error scope, so an out-of-memory or
//      validation error is returned as `ConvError::Allocation` instead of
//      reaching wgpu's default handler (which panics).
//
// Dropping one destroys the wgpu buffer immediately and gives the
// reservation back. There is no `free()` to forget: a `?` that bails out
// half way through a pipeline drops whatever was already allocated, in
// reverse order, before the error reaches the caller.
//
// WHY DESTROY EXPLICITLY?
// ────────────────────────
// Dropping a `wgpu::Buffer` only releases the handle; the backing memory is
// reclaimed once the device notices no submission still uses it.
// `Buffer::destroy()` frees it right away, which keeps peak memory flat when
// convolutions run back to back.
//
// NEW RUST CONCEPTS
// ──────────────────
// - `impl Drop`: runs on every exit path, including early `?` returns and
//   unwinding panics.
// - `AtomicU64::fetch_update`: a compare-and-swap loop that lets the budget
//   check and the increment happen as one step without a lock.
// - `T: bytemuck::Pod`: any bit pattern is a valid `T` ("plain old data"),
//   so `&[T]` can be viewed as `&[u8]` and back without `unsafe`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::ConvError;
use crate::gpu::device::GpuDevice;

// ---------------------------------------------------------------------------
// BufferLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LedgerState {
    budget: Option<u64>,
    live_bytes: AtomicU64,
    live_buffers: AtomicUsize,
    peak_bytes: AtomicU64,
}

/// Host-side accounting of live device buffers.
///
/// Cloning is cheap and shares the same counters.
#[derive(Debug, Clone)]
pub struct BufferLedger {
    state: Arc<LedgerState>,
}

impl BufferLedger {
    pub fn new(budget: Option<u64>) -> Self {
        BufferLedger {
            state: Arc::new(LedgerState {
                budget,
                live_bytes: AtomicU64::new(0),
                live_buffers: AtomicUsize::new(0),
                peak_bytes: AtomicU64::new(0),
            }),
        }
    }

    /// Reserve `bytes` for a buffer called `label`.
    ///
    /// Fails with `ConvError::Allocation` if the reservation would push the
    /// live total past the budget. The returned guard releases the bytes
    /// when dropped.
    pub fn reserve(&self, label: &'static str, bytes: u64) -> Result<Reservation, ConvError> {
        let budget = self.state.budget;
        let prev = self
            .state
            .live_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                let next = live.checked_add(bytes)?;
                match budget {
                    Some(max) if next > max => None,
                    _ => Some(next),
                }
            })
            .map_err(|live| ConvError::Allocation {
                label,
                bytes,
                reason: format!(
                    "memory budget of {} bytes exhausted ({live} bytes live)",
                    budget.unwrap_or(u64::MAX)
                ),
            })?;

        self.state.live_buffers.fetch_add(1, Ordering::AcqRel);
        self.state.peak_bytes.fetch_max(prev + bytes, Ordering::AcqRel);
        Ok(Reservation { state: Arc::clone(&self.state), bytes })
    }

    /// Bytes currently reserved by live buffers.
    pub fn live_bytes(&self) -> u64 {
        self.state.live_bytes.load(Ordering::Acquire)
    }

    /// Number of live buffers.
    pub fn live_buffers(&self) -> usize {
        self.state.live_buffers.load(Ordering::Acquire)
    }

    /// High-water mark of `live_bytes` since the ledger was created.
    pub fn peak_bytes(&self) -> u64 {
        self.state.peak_bytes.load(Ordering::Acquire)
    }

    pub fn budget(&self) -> Option<u64> {
        self.state.budget
    }
}

/// Bytes held in a [`BufferLedger`] until dropped.
#[derive(Debug)]
pub struct Reservation {
    state: Arc<LedgerState>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.state.live_bytes.fetch_sub(self.bytes, Ordering::AcqRel);
        self.state.live_buffers.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// DeviceBuffer
// ---------------------------------------------------------------------------

/// A wgpu buffer owned for the duration of one scope.
///
/// Field order matters: `buffer` is destroyed in `Drop::drop`, then
/// `_reservation` drops and returns its bytes to the ledger.
pub struct DeviceBuffer {
    buffer: wgpu::Buffer,
    label: &'static str,
    _reservation: Reservation,
}

impl DeviceBuffer {
    /// Allocate an uninitialised (zero-filled by wgpu) buffer of `size` bytes.
    pub fn allocate(
        gpu: &GpuDevice,
        label: &'static str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> Result<Self, ConvError> {
        let max = gpu.max_buffer_bytes();
        if size > max {
            return Err(ConvError::Allocation {
                label,
                bytes: size,
                reason: format!("exceeds the device limit of {max} bytes per buffer"),
            });
        }

        let reservation = gpu.ledger().reserve(label, size)?;

        // Scopes are a stack: Validation is pushed last, so it pops first.
        gpu.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        });
        let validation = pollster::block_on(gpu.device.pop_error_scope());
        let oom = pollster::block_on(gpu.device.pop_error_scope());

        if let Some(err) = oom.or(validation) {
            warn!("allocation of `{label}` ({size} bytes) failed: {err}");
            buffer.destroy();
            return Err(ConvError::Allocation { label, bytes: size, reason: err.to_string() });
        }

        debug!("allocated `{label}`: {size} bytes ({} live)", gpu.ledger().live_bytes());
        Ok(DeviceBuffer { buffer, label, _reservation: reservation })
    }

    /// Allocate a buffer sized exactly to `data` and copy `data` into it.
    ///
    /// `COPY_DST` is added to `usage`.
    pub fn upload<T: bytemuck::Pod>(
        gpu: &GpuDevice,
        label: &'static str,
        data: &[T],
        usage: wgpu::BufferUsages,
    ) -> Result<Self, ConvError> {
        let size = std::mem::size_of_val(data) as u64;
        let buf = Self::allocate(gpu, label, size, usage | wgpu::BufferUsages::COPY_DST)?;
        buf.write(gpu, data)?;
        Ok(buf)
    }

    /// Queue a host → device copy of `data` at offset 0.
    ///
    /// The copy is staged by wgpu and executes before the next submission.
    pub fn write<T: bytemuck::Pod>(&self, gpu: &GpuDevice, data: &[T]) -> Result<(), ConvError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > self.size() {
            return Err(ConvError::Transfer {
                label: self.label,
                reason: format!("{} bytes do not fit in a {}-byte buffer", bytes.len(), self.size()),
            });
        }

        gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
        gpu.queue.write_buffer(&self.buffer, 0, bytes);
        if let Some(err) = pollster::block_on(gpu.device.pop_error_scope()) {
            warn!("upload to `{}` failed: {err}", self.label);
            return Err(ConvError::Transfer { label: self.label, reason: err.to_string() });
        }
        Ok(())
    }

    /// Map this buffer for reading and copy its contents out as `T`.
    ///
    /// The buffer must have been created with `MAP_READ`. Blocks until the
    /// device has finished all submitted work, so this is the one point at
    /// which the host waits for the GPU.
    pub fn read<T: bytemuck::Pod>(&self, gpu: &GpuDevice) -> Result<Vec<T>, ConvError> {
        let slice = self.buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        gpu.device.poll(wgpu::Maintain::Wait);

        let transfer_err = |reason: String| ConvError::Transfer { label: self.label, reason };
        rx.recv()
            .map_err(|_| transfer_err("map callback never fired".to_string()))?
            .map_err(|e| transfer_err(e.to_string()))?;

        let mapped = slice.get_mapped_range();
        let out = bytemuck::cast_slice::<u8, T>(&mapped).to_vec();
        drop(mapped);
        self.buffer.unmap();
        Ok(out)
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn as_entire_binding(&self) -> wgpu::BindingResource<'_> {
        self.buffer.as_entire_binding()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

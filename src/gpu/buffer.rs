// gpu/buffer.rs — Linear device memory.
//
// `GpuBuffer` is a storage buffer usable as a kernel argument and as the
// source or target of copies. Host access is always synchronous: writes go
// through the queue and are ordered before any later submission, reads copy
// into a transient MAP_READ buffer and block on `poll(Wait)`.
//
// ALIGNMENT
// ─────────
// wgpu requires buffer copy offsets and sizes to be multiples of
// `wgpu::COPY_BUFFER_ALIGNMENT` (4 bytes). Every element type the crate
// stores is 4 bytes wide, so this only bites callers that pass raw byte
// offsets; those are rejected with `INVALID_VALUE` before reaching the
// device.

use bytemuck::Pod;
use wgpu::util::DeviceExt;

use crate::error::{FatalError, Result, Status};
use crate::gpu::device::GpuDevice;
use crate::gpu::memory::{DeviceHandle, SizeDescriptor};

const ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

/// A linear device buffer.
#[derive(Debug)]
pub struct GpuBuffer {
    handle: DeviceHandle<wgpu::Buffer>,
    size: u64,
}

impl GpuBuffer {
    /// Allocate `size_bytes` of zero-initialized device memory.
    pub fn new(gpu: &GpuDevice, size_bytes: u64, label: &str) -> Result<Self> {
        if size_bytes == 0 {
            return Err(FatalError::new(Status::InvalidValue, format!("{label}: buffer size is zero")));
        }
        let size = align_up(size_bytes, ALIGN);
        let buffer = gpu.checked(Status::OutOfResources, label, |d| {
            d.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: usages(),
                mapped_at_creation: false,
            })
        })?;
        Ok(GpuBuffer {
            handle: DeviceHandle::new(buffer, label, SizeDescriptor::Bytes(size_bytes)),
            size: size_bytes,
        })
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn from_slice<T: Pod>(gpu: &GpuDevice, data: &[T], label: &str) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Err(FatalError::new(Status::InvalidValue, format!("{label}: buffer size is zero")));
        }
        let buffer = gpu.checked(Status::OutOfResources, label, |d| {
            d.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytes,
                usage: usages(),
            })
        })?;
        Ok(GpuBuffer {
            handle: DeviceHandle::new(buffer, label, SizeDescriptor::Bytes(bytes.len() as u64)),
            size: bytes.len() as u64,
        })
    }

    /// Size in bytes as requested at creation.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn label(&self) -> &str {
        self.handle.label()
    }

    pub fn raw(&self) -> &wgpu::Buffer {
        self.handle.get()
    }

    /// Synchronously read `out.len()` elements starting at byte `offset`.
    pub fn read<T: Pod>(&self, gpu: &GpuDevice, offset: u64, out: &mut [T]) -> Result<()> {
        let len = std::mem::size_of_val(out) as u64;
        if len == 0 {
            return Ok(());
        }
        self.check_range(offset, len, "read")?;

        let staging = staging_buffer(gpu, len, "GpuBuffer::read staging")?;
        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("GpuBuffer::read"),
        });
        encoder.copy_buffer_to_buffer(self.raw(), offset, staging.get(), 0, len);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let bytes = map_read(gpu, staging.get(), self.label())?;
        bytemuck::cast_slice_mut::<T, u8>(out).copy_from_slice(&bytes[..len as usize]);
        Ok(())
    }

    /// Read the whole buffer as `f32` values.
    pub fn read_all_f32(&self, gpu: &GpuDevice) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; (self.size / 4) as usize];
        self.read(gpu, 0, &mut out)?;
        Ok(out)
    }

    /// Write `data` starting at byte `offset`. Ordered before any command
    /// submitted afterwards.
    pub fn write<T: Pod>(&self, gpu: &GpuDevice, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.is_empty() {
            return Ok(());
        }
        self.check_range(offset, bytes.len() as u64, "write")?;
        gpu.queue.write_buffer(self.raw(), offset, bytes);
        Ok(())
    }

    /// Copy `size` bytes from `src` at `src_offset` to `dst` at `dst_offset`.
    pub fn copy_region(
        gpu: &GpuDevice,
        src: &GpuBuffer,
        dst: &GpuBuffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        src.check_range(src_offset, size, "copy source")?;
        dst.check_range(dst_offset, size, "copy target")?;

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("GpuBuffer::copy_region"),
        });
        encoder.copy_buffer_to_buffer(src.raw(), src_offset, dst.raw(), dst_offset, size);
        gpu.checked(Status::ValidationFailed, "buffer copy", |_| {
            gpu.queue.submit(std::iter::once(encoder.finish()));
        })
    }

    #[track_caller]
    fn check_range(&self, offset: u64, len: u64, what: &str) -> Result<()> {
        if offset % ALIGN != 0 || len % ALIGN != 0 {
            return Err(FatalError::new(
                Status::InvalidValue,
                format!("{}: {what} offset {offset} / length {len} not {ALIGN}-byte aligned", self.label()),
            ));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(FatalError::new(
                Status::OutOfBounds,
                format!("{}: {what} of {len} bytes at {offset} exceeds {} bytes", self.label(), self.size),
            )),
        }
    }
}

fn usages() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

/// Round `value` up to a multiple of `alignment`.
fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// A transient MAP_READ buffer for readbacks.
pub(crate) fn staging_buffer(gpu: &GpuDevice, size: u64, label: &str) -> Result<DeviceHandle<wgpu::Buffer>> {
    let size = align_up(size, ALIGN);
    let buffer = gpu.checked(Status::OutOfResources, label, |d| {
        d.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    })?;
    Ok(DeviceHandle::new(buffer, label, SizeDescriptor::Bytes(size)))
}

/// Map `buffer` for reading, block until the device is idle, and copy the
/// contents out. The buffer is unmapped before returning.
pub(crate) fn map_read(gpu: &GpuDevice, buffer: &wgpu::Buffer, what: &str) -> Result<Vec<u8>> {
    let slice = buffer.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    gpu.device.poll(wgpu::Maintain::Wait);

    match receiver.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(FatalError::new(Status::MapFailure, format!("{what}: {e}")));
        }
        Err(_) => {
            return Err(FatalError::new(Status::MapFailure, format!("{what}: map callback never fired")));
        }
    }

    let bytes = slice.get_mapped_range().to_vec();
    buffer.unmap();
    Ok(bytes)
}

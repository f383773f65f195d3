// gpu/image.rs — 2-D images and 3-D volumes resident on the device.
//
// RESPONSIBILITIES
// ─────────────────
// 1. `GpuImage2D` / `GpuVolume` — single-channel R32Float textures (D2 / D3)
//    holding image and volume data for every kernel in `gpu::ops`.
//
// 2. Synchronous upload from host data through a staging buffer, handling
//    the row-alignment problem described below.
//
// 3. Synchronous readback of an arbitrary sub-region into a host `Volume`,
//    and device-side region copies between two images of the same kind.
//
//
// THE ROW-ALIGNMENT PROBLEM
// ─────────────────────────
// `copy_buffer_to_texture` and `copy_texture_to_buffer` require
// `bytes_per_row` to be a multiple of 256. A row of `width` f32 texels is
// `4 * width` bytes, which is rarely aligned:
//
//   host rows (width=5):    [t0 t1 t2 t3 t4][t0 t1 t2 t3 t4]...
//   staging rows:           [t0 t1 t2 t3 t4 _pad to 256 B_][...]
//
// Uploads spread host rows into an aligned staging buffer; readbacks strip
// the padding again. Slices are stacked with `rows_per_image = height`.
//
// Fill values are uploaded the same way: a full host buffer of the fill
// value is synthesized and staged. Some backends have no texture clear for
// float formats, and the staging path is the one every backend supports.
//
//
// TEXTURE USAGES
// ──────────────
//   TEXTURE_BINDING  read by kernels through `textureLoad`
//   STORAGE_BINDING  written by kernels (write-only storage access)
//   COPY_SRC/DST     uploads, readbacks, region copies

use wgpu::util::DeviceExt;

use crate::error::{FatalError, Result, Status};
use crate::gpu::buffer::{map_read, staging_buffer};
use crate::gpu::device::GpuDevice;
use crate::gpu::memory::{DeviceHandle, SizeDescriptor};
use crate::volume::{check_region, Extent3, Origin3, Volume};

/// wgpu requires that the number of bytes per row in a buffer↔texture copy
/// is a multiple of this value.
const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Bytes per R32Float texel.
const TEXEL_BYTES: u32 = 4;

pub(crate) const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

/// Texture, default view and extent shared by 2-D images and volumes.
#[derive(Debug)]
pub struct ImageCore {
    handle: DeviceHandle<wgpu::Texture>,
    view: wgpu::TextureView,
    extent: Extent3,
}

impl ImageCore {
    fn upload(
        gpu: &GpuDevice,
        extent: Extent3,
        dimension: wgpu::TextureDimension,
        data: &[f32],
        label: &str,
    ) -> Result<Self> {
        if extent.is_empty() {
            return Err(FatalError::new(
                Status::InvalidValue,
                format!("{label}: extent {extent} must be non-empty"),
            ));
        }
        if data.len() != extent.texel_count() {
            return Err(FatalError::new(
                Status::InvalidValue,
                format!("{label}: {} values supplied for {extent}", data.len()),
            ));
        }

        let texture = gpu.checked(Status::OutOfResources, label, |d| {
            d.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: extent.to_wgpu(),
                mip_level_count: 1,
                sample_count: 1,
                dimension,
                format: FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = DeviceHandle::new(
            texture,
            label,
            SizeDescriptor::Texels { width: extent.width, height: extent.height, depth: extent.depth },
        );

        // Spread host rows into 256-byte aligned staging rows.
        let row_bytes = (extent.width * TEXEL_BYTES) as usize;
        let aligned_bytes_per_row = align_to(extent.width * TEXEL_BYTES, COPY_ALIGNMENT);
        let rows = extent.height as usize * extent.depth as usize;
        let mut staging = vec![0u8; aligned_bytes_per_row as usize * rows];
        let src_bytes: &[u8] = bytemuck::cast_slice(data);
        for row in 0..rows {
            let dst_start = row * aligned_bytes_per_row as usize;
            staging[dst_start..dst_start + row_bytes]
                .copy_from_slice(&src_bytes[row * row_bytes..(row + 1) * row_bytes]);
        }

        let staging_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("image upload staging"),
            contents: &staging,
            usage: wgpu::BufferUsages::COPY_SRC,
        });

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("image upload"),
        });
        encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &staging_buf,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned_bytes_per_row),
                    rows_per_image: Some(extent.height),
                },
            },
            wgpu::ImageCopyTexture {
                texture: handle.get(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            extent.to_wgpu(),
        );
        gpu.checked(Status::ValidationFailed, label, |_| {
            gpu.queue.submit(std::iter::once(encoder.finish()));
        })?;
        gpu.wait_idle();

        tracing::debug!(label, %extent, "image uploaded");
        Ok(ImageCore { handle, view, extent })
    }

    pub fn texture(&self) -> &wgpu::Texture {
        self.handle.get()
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn extent(&self) -> Extent3 {
        self.extent
    }

    pub fn label(&self) -> &str {
        self.handle.label()
    }
}

// ---------------------------------------------------------------------------
// DeviceImage
// ---------------------------------------------------------------------------

/// Operations shared by every device-resident image type.
pub trait DeviceImage {
    fn core(&self) -> &ImageCore;

    fn extent(&self) -> Extent3 {
        self.core().extent()
    }

    fn view(&self) -> &wgpu::TextureView {
        self.core().view()
    }

    fn label(&self) -> &str {
        self.core().label()
    }

    /// Synchronously copy the region at `origin` with `target`'s extent
    /// into `target`.
    ///
    /// Expensive: stalls the queue and blocks until the copy is complete.
    fn readback(&self, gpu: &GpuDevice, target: &mut Volume, origin: Origin3) -> Result<()> {
        let core = self.core();
        let size = target.extent();
        check_region(core.extent(), origin, size, core.label())?;
        if size.is_empty() {
            return Ok(());
        }

        let aligned_bytes_per_row = align_to(size.width * TEXEL_BYTES, COPY_ALIGNMENT);
        let rows = size.height as usize * size.depth as usize;
        let staging = staging_buffer(
            gpu,
            aligned_bytes_per_row as u64 * rows as u64,
            "image readback staging",
        )?;

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("image readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: core.texture(),
                mip_level: 0,
                origin: origin.to_wgpu(),
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: staging.get(),
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned_bytes_per_row),
                    rows_per_image: Some(size.height),
                },
            },
            size.to_wgpu(),
        );
        gpu.checked(Status::ValidationFailed, core.label(), |_| {
            gpu.queue.submit(std::iter::once(encoder.finish()));
        })?;

        let mapped = map_read(gpu, staging.get(), core.label())?;

        // Strip the alignment padding from each row.
        let row_bytes = (size.width * TEXEL_BYTES) as usize;
        let out: &mut [u8] = bytemuck::cast_slice_mut(target.as_mut_slice());
        for row in 0..rows {
            let src_start = row * aligned_bytes_per_row as usize;
            out[row * row_bytes..(row + 1) * row_bytes]
                .copy_from_slice(&mapped[src_start..src_start + row_bytes]);
        }
        Ok(())
    }

    /// Read the whole image into a new host volume.
    fn readback_all(&self, gpu: &GpuDevice) -> Result<Volume> {
        let mut out = Volume::new(self.extent());
        self.readback(gpu, &mut out, Origin3::ZERO)?;
        Ok(out)
    }
}

/// Copy `size` texels from `src` at `src_origin` to `dst` at `dst_origin`.
///
/// A `0×0×0` `size` copies `dst`'s full extent; any other empty `size`
/// enqueues nothing. Both regions are checked before anything is enqueued.
pub fn copy_region<I: DeviceImage>(
    gpu: &GpuDevice,
    src: &I,
    dst: &I,
    src_origin: Origin3,
    dst_origin: Origin3,
    size: Extent3,
) -> Result<()> {
    let size = if size.is_zero() { dst.extent() } else { size };
    check_region(src.extent(), src_origin, size, src.label())?;
    check_region(dst.extent(), dst_origin, size, dst.label())?;
    if size.is_empty() {
        return Ok(());
    }

    let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("image copy_region"),
    });
    encoder.copy_texture_to_texture(
        wgpu::ImageCopyTexture {
            texture: src.core().texture(),
            mip_level: 0,
            origin: src_origin.to_wgpu(),
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::ImageCopyTexture {
            texture: dst.core().texture(),
            mip_level: 0,
            origin: dst_origin.to_wgpu(),
            aspect: wgpu::TextureAspect::All,
        },
        size.to_wgpu(),
    );
    gpu.checked(Status::ValidationFailed, "image copy_region", |_| {
        gpu.queue.submit(std::iter::once(encoder.finish()));
    })
}

// ---------------------------------------------------------------------------
// GpuImage2D
// ---------------------------------------------------------------------------

/// A single-channel f32 image resident on the device as a 2-D texture.
#[derive(Debug)]
pub struct GpuImage2D {
    core: ImageCore,
}

impl GpuImage2D {
    /// Create a `width × height` image with every texel set to `value`.
    pub fn filled(gpu: &GpuDevice, width: u32, height: u32, value: f32, label: &str) -> Result<Self> {
        let extent = Extent3::new(width, height, 1);
        Self::from_data(gpu, width, height, &vec![value; extent.texel_count()], label)
    }

    /// Create an image from row-major host data; `data.len()` must equal
    /// `width * height`.
    pub fn from_data(gpu: &GpuDevice, width: u32, height: u32, data: &[f32], label: &str) -> Result<Self> {
        let core = ImageCore::upload(
            gpu,
            Extent3::new(width, height, 1),
            wgpu::TextureDimension::D2,
            data,
            label,
        )?;
        Ok(GpuImage2D { core })
    }

    pub fn width(&self) -> u32 {
        self.core.extent.width
    }

    pub fn height(&self) -> u32 {
        self.core.extent.height
    }
}

impl DeviceImage for GpuImage2D {
    fn core(&self) -> &ImageCore {
        &self.core
    }
}

// ---------------------------------------------------------------------------
// GpuVolume
// ---------------------------------------------------------------------------

/// A single-channel f32 volume resident on the device as a 3-D texture.
#[derive(Debug)]
pub struct GpuVolume {
    core: ImageCore,
}

impl GpuVolume {
    /// Create a volume with every voxel set to `value`.
    pub fn filled(gpu: &GpuDevice, extent: Extent3, value: f32, label: &str) -> Result<Self> {
        Self::from_data(gpu, extent, &vec![value; extent.texel_count()], label)
    }

    /// Create a volume from row-major host data (x fastest, then y, then z).
    pub fn from_data(gpu: &GpuDevice, extent: Extent3, data: &[f32], label: &str) -> Result<Self> {
        let core = ImageCore::upload(gpu, extent, wgpu::TextureDimension::D3, data, label)?;
        Ok(GpuVolume { core })
    }

    /// Upload a host volume.
    pub fn from_volume(gpu: &GpuDevice, volume: &Volume, label: &str) -> Result<Self> {
        Self::from_data(gpu, volume.extent(), volume.as_slice(), label)
    }

    pub fn width(&self) -> u32 {
        self.core.extent.width
    }

    pub fn height(&self) -> u32 {
        self.core.extent.height
    }

    pub fn depth(&self) -> u32 {
        self.core.extent.depth
    }
}

impl DeviceImage for GpuVolume {
    fn core(&self) -> &ImageCore {
        &self.core
    }
}

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

/// Round `value` up to the next multiple of `alignment`.
///
///   align_to(100, 256) = 256
///   align_to(256, 256) = 256
///   align_to(257, 256) = 512
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::test_support::run_gpu_test_in_subprocess;

    // ---- align_to (pure, no GPU needed) ------------------------------------

    #[test]
    fn test_align_to_already_aligned() {
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(512, 256), 512);
    }

    #[test]
    fn test_align_to_rounds_up() {
        assert_eq!(align_to(4, 256), 256);
        assert_eq!(align_to(20, 256), 256);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(641 * 4, 256), 2816);
    }

    #[test]
    fn test_align_to_zero() {
        assert_eq!(align_to(0, 256), 0);
    }

    // ---- GPU round-trip tests (subprocess-isolated) ------------------------

    fn ramp(extent: Extent3) -> Volume {
        Volume::from_fn(extent, |x, y, z| (x + 10 * y + 100 * z) as f32)
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_fill_and_ramp_readback() {
        let gpu = GpuDevice::new().expect("device");

        let filled = GpuVolume::filled(&gpu, Extent3::new(5, 3, 2), 1.5, "filled").unwrap();
        let host = filled.readback_all(&gpu).unwrap();
        assert!(host.as_slice().iter().all(|&v| v == 1.5));

        // Odd width exercises the row padding on both paths.
        let extent = Extent3::new(7, 5, 3);
        let expected = ramp(extent);
        let vol = GpuVolume::from_volume(&gpu, &expected, "ramp").unwrap();
        assert_eq!(vol.readback_all(&gpu).unwrap(), expected);

        // Sub-region readback.
        let mut part = Volume::new(Extent3::new(2, 2, 1));
        vol.readback(&gpu, &mut part, Origin3::new(3, 1, 2)).unwrap();
        assert_eq!(part.as_slice(), &[213.0, 214.0, 223.0, 224.0]);

        let mut too_big = Volume::new(Extent3::new(2, 2, 2));
        let err = vol.readback(&gpu, &mut too_big, Origin3::new(6, 0, 0)).unwrap_err();
        assert_eq!(err.status, Status::OutOfBounds);

        // An empty target is still bounds-checked.
        let mut empty = Volume::new(Extent3::new(0, 1, 1));
        vol.readback(&gpu, &mut empty, Origin3::ZERO).unwrap();
        let err = vol.readback(&gpu, &mut empty, Origin3::new(9, 0, 0)).unwrap_err();
        assert_eq!(err.status, Status::OutOfBounds);

        let img = GpuImage2D::from_data(&gpu, 3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], "img").unwrap();
        assert_eq!(img.readback_all(&gpu).unwrap().as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let err = GpuImage2D::from_data(&gpu, 3, 2, &[1.0; 5], "short").unwrap_err();
        assert_eq!(err.status, Status::InvalidValue);

        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_copy_region_leaves_outside_unchanged() {
        let gpu = GpuDevice::new().expect("device");

        let extent = Extent3::cube(4);
        let src_host = ramp(extent);
        let src = GpuVolume::from_volume(&gpu, &src_host, "src").unwrap();
        let dst = GpuVolume::filled(&gpu, extent, -1.0, "dst").unwrap();

        let (so, dor, size) = (Origin3::new(1, 1, 1), Origin3::new(0, 2, 1), Extent3::new(2, 2, 3));
        copy_region(&gpu, &src, &dst, so, dor, size).unwrap();

        let mut expected = Volume::filled(extent, -1.0);
        expected.copy_region_from(&src_host, so, dor, size).unwrap();
        assert_eq!(dst.readback_all(&gpu).unwrap(), expected);

        // A region collapsed on one axis copies nothing.
        let before = dst.readback_all(&gpu).unwrap();
        copy_region(&gpu, &src, &dst, Origin3::ZERO, Origin3::ZERO, Extent3::new(2, 0, 2)).unwrap();
        assert_eq!(dst.readback_all(&gpu).unwrap(), before);

        // 0×0×0 copies the whole target.
        copy_region(&gpu, &src, &dst, Origin3::ZERO, Origin3::ZERO, Extent3::default()).unwrap();
        assert_eq!(dst.readback_all(&gpu).unwrap(), src_host);

        let err = copy_region(&gpu, &src, &dst, Origin3::new(3, 0, 0), Origin3::ZERO, Extent3::cube(2))
            .unwrap_err();
        assert_eq!(err.status, Status::OutOfBounds);

        println!("GPU_TEST_OK");
    }

    // Outer wrappers ──────────────────────────────────────────────────────────

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_fill_and_ramp_readback() {
        let out = run_gpu_test_in_subprocess("gpu::image::tests::inner_fill_and_ramp_readback");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_copy_region_leaves_outside_unchanged() {
        let out = run_gpu_test_in_subprocess(
            "gpu::image::tests::inner_copy_region_leaves_outside_unchanged",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}

// volume.rs — Host-side 3-D float volume and region arithmetic.
//
// `Volume` is the CPU twin of `gpu::image::GpuVolume`: the same dimensions,
// the same voxel order, so a device readback can be compared against a host
// reference element for element.
//
// MEMORY LAYOUT
// ─────────────
// Row-major with x fastest, then y, then z. No stride padding: device
// readbacks strip wgpu's 256-byte row alignment before handing data back.
//
//   index(x, y, z) = (z * height + y) * width + x
//
// REGIONS
// ───────
// `Extent3` and `Origin3` are shared by host and device code. Every copy or
// readback validates its region through `check_region` before touching the
// device, so an overrun is reported as `OUT_OF_BOUNDS` with the offending
// numbers instead of surfacing as an opaque validation error.

use std::fmt;

use crate::error::{FatalError, Result, Status};

// ---------------------------------------------------------------------------
// Extent3 / Origin3
// ---------------------------------------------------------------------------

/// Size of a 3-D region in texels. A 2-D image has `depth == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent3 {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3 {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Extent3 { width, height, depth }
    }

    /// Same edge length on all three axes.
    pub const fn cube(side: u32) -> Self {
        Extent3 { width: side, height: side, depth: side }
    }

    /// Number of texels in the region.
    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }

    /// True when any axis is zero, so the region holds no texels.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }

    /// True only for `0×0×0`, the "whole target" request of region copies.
    pub fn is_zero(&self) -> bool {
        *self == Extent3::default()
    }

    pub(crate) fn to_wgpu(self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: self.depth,
        }
    }
}

impl fmt::Display for Extent3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}×{}", self.width, self.height, self.depth)
    }
}

/// Texel offset of a region's first corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Origin3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Origin3 {
    pub const ZERO: Origin3 = Origin3 { x: 0, y: 0, z: 0 };

    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Origin3 { x, y, z }
    }

    pub(crate) fn to_wgpu(self) -> wgpu::Origin3d {
        wgpu::Origin3d { x: self.x, y: self.y, z: self.z }
    }
}

impl fmt::Display for Origin3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Verify that `size` texels starting at `origin` fit inside `bounds`.
///
/// Sums are widened to u64 so that an origin near `u32::MAX` cannot wrap
/// around and pass the check.
#[track_caller]
pub fn check_region(bounds: Extent3, origin: Origin3, size: Extent3, what: &str) -> Result<()> {
    let fits = |o: u32, s: u32, b: u32| o as u64 + s as u64 <= b as u64;
    if fits(origin.x, size.width, bounds.width)
        && fits(origin.y, size.height, bounds.height)
        && fits(origin.z, size.depth, bounds.depth)
    {
        Ok(())
    } else {
        Err(FatalError::new(
            Status::OutOfBounds,
            format!("{what}: region {size} at {origin} exceeds {bounds}"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// A host-resident single-channel f32 volume.
#[derive(Clone, PartialEq)]
pub struct Volume {
    data: Vec<f32>,
    extent: Extent3,
}

impl Volume {
    /// Zero-initialized volume.
    pub fn new(extent: Extent3) -> Self {
        Self::filled(extent, 0.0)
    }

    /// Every voxel set to `value`.
    pub fn filled(extent: Extent3, value: f32) -> Self {
        Volume { data: vec![value; extent.texel_count()], extent }
    }

    /// Wrap existing voxel data.
    ///
    /// Fails with `INVALID_VALUE` when `data.len()` differs from the voxel
    /// count implied by `extent`.
    #[track_caller]
    pub fn from_vec(extent: Extent3, data: Vec<f32>) -> Result<Self> {
        if data.len() != extent.texel_count() {
            return Err(FatalError::new(
                Status::InvalidValue,
                format!(
                    "data length ({}) must equal voxel count of {extent} ({})",
                    data.len(),
                    extent.texel_count()
                ),
            ));
        }
        Ok(Volume { data, extent })
    }

    /// Build a volume by evaluating `f(x, y, z)` at every voxel.
    pub fn from_fn(extent: Extent3, mut f: impl FnMut(u32, u32, u32) -> f32) -> Self {
        let mut data = Vec::with_capacity(extent.texel_count());
        for z in 0..extent.depth {
            for y in 0..extent.height {
                for x in 0..extent.width {
                    data.push(f(x, y, z));
                }
            }
        }
        Volume { data, extent }
    }

    #[inline]
    pub fn extent(&self) -> Extent3 {
        self.extent
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.extent.height
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.extent.depth
    }

    #[inline]
    fn index(&self, x: u32, y: u32, z: u32) -> usize {
        assert!(
            x < self.extent.width && y < self.extent.height && z < self.extent.depth,
            "voxel ({x},{y},{z}) out of bounds for volume {}",
            self.extent,
        );
        (z as usize * self.extent.height as usize + y as usize) * self.extent.width as usize
            + x as usize
    }

    /// # Panics
    /// Panics if (x, y, z) is out of bounds.
    #[inline]
    pub fn get(&self, x: u32, y: u32, z: u32) -> f32 {
        self.data[self.index(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, z: u32, value: f32) {
        let idx = self.index(x, y, z);
        self.data[idx] = value;
    }

    /// One z-slice as a contiguous `width * height` slice.
    pub fn slice(&self, z: u32) -> &[f32] {
        assert!(z < self.extent.depth, "slice {z} out of bounds (depth {})", self.extent.depth);
        let len = self.extent.width as usize * self.extent.height as usize;
        let start = z as usize * len;
        &self.data[start..start + len]
    }

    pub fn slice_mut(&mut self, z: u32) -> &mut [f32] {
        assert!(z < self.extent.depth, "slice {z} out of bounds (depth {})", self.extent.depth);
        let len = self.extent.width as usize * self.extent.height as usize;
        let start = z as usize * len;
        &mut self.data[start..start + len]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Copy `size` voxels from `src` at `src_origin` into `self` at
    /// `dst_origin`. Host mirror of `gpu::image::copy_region`: a `0×0×0`
    /// `size` means the whole of `self`, any other empty `size` copies
    /// nothing once both regions are in bounds.
    pub fn copy_region_from(
        &mut self,
        src: &Volume,
        src_origin: Origin3,
        dst_origin: Origin3,
        size: Extent3,
    ) -> Result<()> {
        let size = if size.is_zero() { self.extent } else { size };
        check_region(src.extent, src_origin, size, "copy source")?;
        check_region(self.extent, dst_origin, size, "copy target")?;
        if size.is_empty() {
            return Ok(());
        }
        for z in 0..size.depth {
            for y in 0..size.height {
                for x in 0..size.width {
                    let v = src.get(src_origin.x + x, src_origin.y + y, src_origin.z + z);
                    self.set(dst_origin.x + x, dst_origin.y + y, dst_origin.z + z, v);
                }
            }
        }
        Ok(())
    }

    /// Sum of elementwise products, accumulated in f32 like the device
    /// reducers.
    pub fn dot(&self, other: &Volume) -> f32 {
        assert_eq!(self.extent, other.extent, "dot product of mismatched volumes");
        dot(&self.data, &other.data)
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f32 {
        self.dot(self).sqrt()
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Volume {{ {}, ", self.extent)?;
        let shown = self.data.len().min(8);
        write!(f, "{:?}", &self.data[..shown])?;
        if self.data.len() > shown {
            write!(f, "...")?;
        }
        write!(f, " }}")
    }
}

/// f32 dot product over two equal-length slices.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_layout_x_fastest() {
        let vol = Volume::from_fn(Extent3::new(3, 2, 2), |x, y, z| (x + 10 * y + 100 * z) as f32);
        assert_eq!(&vol.as_slice()[..4], &[0.0, 1.0, 2.0, 10.0]);
        assert_eq!(vol.get(2, 1, 1), 112.0);
        assert_eq!(vol.slice(1), &[100.0, 101.0, 102.0, 110.0, 111.0, 112.0]);
    }

    #[test]
    fn test_from_vec_length_mismatch() {
        let err = Volume::from_vec(Extent3::cube(2), vec![0.0; 7]).unwrap_err();
        assert_eq!(err.status, Status::InvalidValue);
    }

    #[test]
    fn test_check_region_exact_fit() {
        let bounds = Extent3::new(4, 4, 2);
        assert!(check_region(bounds, Origin3::new(2, 0, 1), Extent3::new(2, 4, 1), "t").is_ok());
        assert!(check_region(bounds, Origin3::ZERO, bounds, "t").is_ok());
    }

    #[test]
    fn test_check_region_overrun_each_axis() {
        let bounds = Extent3::new(4, 4, 2);
        for (origin, size) in [
            (Origin3::new(3, 0, 0), Extent3::new(2, 1, 1)),
            (Origin3::new(0, 4, 0), Extent3::new(1, 1, 1)),
            (Origin3::new(0, 0, 1), Extent3::new(1, 1, 2)),
        ] {
            let err = check_region(bounds, origin, size, "t").unwrap_err();
            assert_eq!(err.status, Status::OutOfBounds, "{origin} {size}");
        }
    }

    #[test]
    fn test_check_region_no_wraparound() {
        let err = check_region(
            Extent3::cube(4),
            Origin3::new(u32::MAX, 0, 0),
            Extent3::new(2, 1, 1),
            "t",
        )
        .unwrap_err();
        assert_eq!(err.status, Status::OutOfBounds);
    }

    #[test]
    fn test_copy_region_preserves_outside() {
        let src = Volume::filled(Extent3::cube(4), 7.0);
        let mut dst = Volume::from_fn(Extent3::cube(4), |x, y, z| (x + y + z) as f32);
        let before = dst.clone();
        dst.copy_region_from(&src, Origin3::ZERO, Origin3::new(1, 1, 1), Extent3::cube(2))
            .unwrap();
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..4 {
                    let inside = (1..3).contains(&x) && (1..3).contains(&y) && (1..3).contains(&z);
                    let expected = if inside { 7.0 } else { before.get(x, y, z) };
                    assert_eq!(dst.get(x, y, z), expected, "voxel ({x},{y},{z})");
                }
            }
        }
    }

    #[test]
    fn test_copy_region_zero_size_means_full_target() {
        let src = Volume::filled(Extent3::cube(4), 1.0);
        let mut dst = Volume::new(Extent3::cube(2));
        dst.copy_region_from(&src, Origin3::new(2, 2, 2), Origin3::ZERO, Extent3::default())
            .unwrap();
        assert!(dst.as_slice().iter().all(|&v| v == 1.0));

        let err = dst
            .copy_region_from(&src, Origin3::new(3, 3, 3), Origin3::ZERO, Extent3::default())
            .unwrap_err();
        assert_eq!(err.status, Status::OutOfBounds);
    }

    #[test]
    fn test_copy_region_collapsed_axis_copies_nothing() {
        let src = Volume::filled(Extent3::cube(4), 7.0);
        let mut dst = Volume::filled(Extent3::cube(4), -1.0);
        for size in [Extent3::new(2, 0, 2), Extent3::new(0, 3, 3), Extent3::new(4, 4, 0)] {
            dst.copy_region_from(&src, Origin3::ZERO, Origin3::ZERO, size).unwrap();
            let overwritten = dst.as_slice().iter().filter(|&&v| v != -1.0).count();
            assert_eq!(overwritten, 0, "{size} overwrote {overwritten} voxels");
        }

        let err = dst
            .copy_region_from(&src, Origin3::new(5, 0, 0), Origin3::ZERO, Extent3::new(0, 1, 1))
            .unwrap_err();
        assert_eq!(err.status, Status::OutOfBounds);
    }

    #[test]
    fn test_extent_zero_and_empty() {
        assert!(Extent3::default().is_zero());
        assert!(Extent3::new(2, 0, 2).is_empty());
        assert!(!Extent3::new(2, 0, 2).is_zero());
        assert!(!Extent3::cube(1).is_empty());
    }

    #[test]
    fn test_dot_and_norm() {
        let a = Volume::filled(Extent3::cube(2), 2.0);
        let b = Volume::filled(Extent3::cube(2), 0.5);
        assert_eq!(a.dot(&b), 8.0);
        assert_eq!(Volume::filled(Extent3::new(4, 1, 1), 1.0).norm(), 2.0);
    }
}

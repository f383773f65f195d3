// geometry.rs — Projection geometry and host reference projectors.
//
// A view is a 3×4 projective matrix M. A voxel at integer index (x, y, z)
// maps to the detector through
//
//   [u', v', w']ᵀ = M · [x, y, z, 1]ᵀ,   (u, v) = (u' / w', v' / w')
//
// and (u, v) is a continuous pixel coordinate where integer values sit on
// pixel centres. Voxels with w' ≤ 0 are behind the source and ignored.
//
// FORWARD / ADJOINT PAIR
// ──────────────────────
// Both directions use the same four bilinear taps around (u, v):
//
//   forward (splat):   image[tap] += weight · volume[voxel]
//   adjoint (gather):  volume[voxel] = Σ_views Σ_taps weight · image[tap]
//
// Taps that fall outside the detector contribute nothing in either
// direction, so the pair is exactly adjoint: ⟨A·x, y⟩ = ⟨x, Aᵗ·y⟩. CG on the
// normal equations depends on this. The device backprojection kernel
// (shaders/backproject.wgsl) reproduces `gather_taps` line for line.

use crate::error::{FatalError, Result, Status};
use crate::volume::{Extent3, Volume};

// ---------------------------------------------------------------------------
// ViewGeometry
// ---------------------------------------------------------------------------

/// One projection view: a 3×4 matrix from voxel index space to homogeneous
/// detector coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewGeometry {
    rows: [[f32; 4]; 3],
}

impl ViewGeometry {
    pub const fn from_rows(rows: [[f32; 4]; 3]) -> Self {
        ViewGeometry { rows }
    }

    /// Parallel projection along +z: voxel (x, y, z) lands on pixel (x, y).
    pub const fn parallel_z() -> Self {
        ViewGeometry::from_rows([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// One-to-one map of a volume of height `volume_height` onto a
    /// `width × (height·depth)` detector, z-slices stacked vertically.
    /// Injective, so the normal operator is positive definite.
    pub fn unrolled(volume_height: u32) -> Self {
        ViewGeometry::from_rows([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, volume_height as f32, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Parallel beam rotated by `angle` radians about the volume's z axis,
    /// as in a circular CT scan. The rotation centre maps to the detector
    /// centre column; detector rows follow z.
    pub fn parallel_beam(angle: f32, volume: Extent3, image_width: u32) -> Self {
        let (s, c) = angle.sin_cos();
        let cx = (volume.width as f32 - 1.0) * 0.5;
        let cy = (volume.height as f32 - 1.0) * 0.5;
        let cu = (image_width as f32 - 1.0) * 0.5;
        ViewGeometry::from_rows([
            [c, s, 0.0, cu - c * cx - s * cy],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// The same view with its detector shifted by (`du`, `dv`) pixels.
    pub fn shifted(self, du: f32, dv: f32) -> Self {
        let mut rows = self.rows;
        for k in 0..4 {
            rows[0][k] += du * rows[2][k];
            rows[1][k] += dv * rows[2][k];
        }
        ViewGeometry { rows }
    }

    pub fn rows(&self) -> &[[f32; 4]; 3] {
        &self.rows
    }

    /// Detector coordinate of voxel (x, y, z), or `None` behind the source.
    #[inline]
    pub fn project(&self, x: u32, y: u32, z: u32) -> Option<(f32, f32)> {
        let p = [x as f32, y as f32, z as f32, 1.0];
        let dot = |r: &[f32; 4]| r[0] * p[0] + r[1] * p[1] + r[2] * p[2] + r[3] * p[3];
        let w = dot(&self.rows[2]);
        if !(w > 0.0) {
            return None;
        }
        Some((dot(&self.rows[0]) / w, dot(&self.rows[1]) / w))
    }
}

/// The four bilinear taps around (u, v): pixel coordinates and weights in
/// the order (u0,v0), (u0+1,v0), (u0,v0+1), (u0+1,v0+1).
#[inline]
pub fn gather_taps(u: f32, v: f32) -> [(i64, i64, f32); 4] {
    let u0 = u.floor();
    let v0 = v.floor();
    let fu = u - u0;
    let fv = v - v0;
    let iu = u0 as i64;
    let iv = v0 as i64;
    [
        (iu, iv, (1.0 - fu) * (1.0 - fv)),
        (iu + 1, iv, fu * (1.0 - fv)),
        (iu, iv + 1, (1.0 - fu) * fv),
        (iu + 1, iv + 1, fu * fv),
    ]
}

// ---------------------------------------------------------------------------
// ProjectionSet
// ---------------------------------------------------------------------------

/// A fixed, non-empty set of views sharing one detector size.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionSet {
    views: Vec<ViewGeometry>,
    image_width: u32,
    image_height: u32,
}

impl ProjectionSet {
    /// Fails with `INVALID_VALUE` for an empty view list or a zero-sized
    /// detector.
    #[track_caller]
    pub fn new(views: Vec<ViewGeometry>, image_width: u32, image_height: u32) -> Result<Self> {
        if views.is_empty() {
            return Err(FatalError::new(
                Status::InvalidValue,
                "projection set must contain at least one view",
            ));
        }
        if image_width == 0 || image_height == 0 {
            return Err(FatalError::new(
                Status::InvalidValue,
                format!("detector size {image_width}×{image_height} must be non-zero"),
            ));
        }
        Ok(ProjectionSet { views, image_width, image_height })
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Always false: [`ProjectionSet::new`] rejects empty view lists.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn views(&self) -> &[ViewGeometry] {
        &self.views
    }

    pub fn image_width(&self) -> u32 {
        self.image_width
    }

    pub fn image_height(&self) -> u32 {
        self.image_height
    }

    /// Extent of the image array: one `image_width × image_height` slice per
    /// view.
    pub fn image_array_extent(&self) -> Extent3 {
        Extent3::new(self.image_width, self.image_height, self.views.len() as u32)
    }

    #[inline]
    fn pixel_index(&self, u: i64, v: i64) -> Option<usize> {
        if u < 0 || v < 0 || u >= self.image_width as i64 || v >= self.image_height as i64 {
            return None;
        }
        Some(v as usize * self.image_width as usize + u as usize)
    }
}

// ---------------------------------------------------------------------------
// Host projectors
// ---------------------------------------------------------------------------

/// Forward-project `volume` through `view` into `image` (overwritten).
///
/// `image` holds `set.image_width() * set.image_height()` pixels, row-major.
pub fn forward_project(volume: &Volume, view: &ViewGeometry, set: &ProjectionSet, image: &mut [f32]) {
    assert_eq!(
        image.len(),
        set.image_width as usize * set.image_height as usize,
        "image length must match the detector size"
    );
    image.fill(0.0);
    for z in 0..volume.depth() {
        for y in 0..volume.height() {
            for x in 0..volume.width() {
                let value = volume.get(x, y, z);
                if value == 0.0 {
                    continue;
                }
                let Some((u, v)) = view.project(x, y, z) else { continue };
                for (pu, pv, w) in gather_taps(u, v) {
                    if let Some(idx) = set.pixel_index(pu, pv) {
                        image[idx] += w * value;
                    }
                }
            }
        }
    }
}

/// Forward-project `volume` through every view into a fresh image array.
pub fn forward_project_all(volume: &Volume, set: &ProjectionSet) -> Volume {
    let mut images = Volume::new(set.image_array_extent());
    for (i, view) in set.views.iter().enumerate() {
        forward_project(volume, view, set, images.slice_mut(i as u32));
    }
    images
}

/// Backproject an image array into `out` (overwritten): the adjoint of
/// [`forward_project_all`].
pub fn back_project(images: &Volume, set: &ProjectionSet, out: &mut Volume) {
    assert_eq!(
        images.extent(),
        set.image_array_extent(),
        "image array must be image_width × image_height × views"
    );
    let extent = out.extent();
    for z in 0..extent.depth {
        for y in 0..extent.height {
            for x in 0..extent.width {
                let mut acc = 0.0f32;
                for (i, view) in set.views.iter().enumerate() {
                    let Some((u, v)) = view.project(x, y, z) else { continue };
                    let slice = images.slice(i as u32);
                    for (pu, pv, w) in gather_taps(u, v) {
                        if let Some(idx) = set.pixel_index(pu, pv) {
                            acc += w * slice[idx];
                        }
                    }
                }
                out.set(x, y, z, acc);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

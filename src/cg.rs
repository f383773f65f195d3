// cg.rs — Conjugate gradient on the normal equations, host reference.
//
// Solves AᵗA·x = Aᵗb where A is `geometry::forward_project_all` and Aᵗ is
// `geometry::back_project`. `gpu::solver::CgSolver` runs the same state
// machine on the device; this version is the reference it is validated
// against, and it also owns the scalar policy both of them share.
//
// STATE
// ─────
//   x        estimate
//   r        residual            Aᵗb − AᵗA·x
//   p        search direction
//   AtAp     AᵗA·p, scratch
//   energy   ⟨r, r⟩ as of the last completed step
//
// DEGENERATE DENOMINATORS
// ───────────────────────
// The textbook step α = ⟨r,r⟩ / ⟨p,AᵗAp⟩ is undefined once the residual has
// vanished or p has fallen into the null space of A. Both cases mean there is
// nothing left to reduce along p, so `step_length` reports convergence and
// the step is skipped without touching the state. A NaN or infinite scalar is
// a hard `NON_FINITE_VALUE` error instead.

use std::time::{Duration, Instant};

use crate::config::SolverConfig;
use crate::error::{FatalError, Result, Status};
use crate::geometry::{back_project, forward_project, forward_project_all, ProjectionSet};
use crate::volume::{Extent3, Volume};

/// Outcome of one `iterate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A step was taken. The caller decides whether to call again.
    Continue,
    /// The step was degenerate and skipped; further calls are no-ops.
    Converged,
}

/// α = `residual_energy / p_atap`, or `None` when the step is degenerate.
#[track_caller]
pub fn step_length(residual_energy: f32, p_atap: f32, floor: f32) -> Result<Option<f32>> {
    if residual_energy == 0.0 || p_atap <= floor {
        return Ok(None);
    }
    let alpha = residual_energy / p_atap;
    if !alpha.is_finite() {
        return Err(FatalError::new(
            Status::NonFiniteValue,
            format!("step length α = {residual_energy} / {p_atap} is not finite"),
        ));
    }
    Ok(Some(alpha))
}

/// β = `new_energy / old_energy`.
#[track_caller]
pub fn direction_scale(new_energy: f32, old_energy: f32) -> Result<f32> {
    let beta = new_energy / old_energy;
    if !beta.is_finite() {
        return Err(FatalError::new(
            Status::NonFiniteValue,
            format!("direction scale β = {new_energy} / {old_energy} is not finite"),
        ));
    }
    Ok(beta)
}

/// `dst = dst_scale · dst + scale · src`, elementwise.
pub fn axpby(dst: &mut [f32], dst_scale: f32, src: &[f32], scale: f32) {
    assert_eq!(dst.len(), src.len(), "axpby length mismatch");
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = dst_scale * *d + scale * s;
    }
}

/// Host CG reconstruction.
pub struct HostCg {
    set: ProjectionSet,
    x: Volume,
    r: Volume,
    p: Volume,
    at_ap: Volume,
    images: Volume,
    residual_energy: f32,
    iteration: u32,
    last_elapsed: Duration,
    degeneracy_floor: f32,
}

impl HostCg {
    /// INIT: r₀ = Aᵗb − AᵗA·x₀, p₀ = r₀, energy = ⟨r₀, r₀⟩.
    ///
    /// `measured` is the image array b (`image_width × image_height ×
    /// views`). Without `initial`, x₀ = 0.
    pub fn new(
        extent: Extent3,
        set: ProjectionSet,
        measured: &Volume,
        initial: Option<&Volume>,
        config: &SolverConfig,
    ) -> Result<Self> {
        if extent.is_empty() {
            return Err(FatalError::new(
                Status::InvalidValue,
                format!("reconstruction volume {extent} must be non-empty"),
            ));
        }
        if measured.extent() != set.image_array_extent() {
            return Err(FatalError::new(
                Status::InvalidValue,
                format!(
                    "measured image array is {}, projection set needs {}",
                    measured.extent(),
                    set.image_array_extent()
                ),
            ));
        }

        let mut r = Volume::new(extent);
        back_project(measured, &set, &mut r);

        let x = match initial {
            Some(x0) => {
                if x0.extent() != extent {
                    return Err(FatalError::new(
                        Status::InvalidValue,
                        format!("initial guess is {}, expected {extent}", x0.extent()),
                    ));
                }
                let ax0 = forward_project_all(x0, &set);
                let mut atax0 = Volume::new(extent);
                back_project(&ax0, &set, &mut atax0);
                axpby(r.as_mut_slice(), 1.0, atax0.as_slice(), -1.0);
                x0.clone()
            }
            None => Volume::new(extent),
        };

        let p = r.clone();
        let residual_energy = r.dot(&r);
        let images = Volume::new(set.image_array_extent());

        Ok(HostCg {
            set,
            x,
            r,
            p,
            at_ap: Volume::new(extent),
            images,
            residual_energy,
            iteration: 0,
            last_elapsed: Duration::ZERO,
            degeneracy_floor: config.degeneracy_floor,
        })
    }

    /// One CG step.
    pub fn iterate(&mut self) -> Result<Progress> {
        let start = Instant::now();

        for (i, view) in self.set.views().iter().enumerate() {
            forward_project(&self.p, view, &self.set, self.images.slice_mut(i as u32));
        }
        back_project(&self.images, &self.set, &mut self.at_ap);

        let p_atap = self.p.dot(&self.at_ap);
        let Some(alpha) = step_length(self.residual_energy, p_atap, self.degeneracy_floor)? else {
            return Ok(Progress::Converged);
        };

        axpby(self.x.as_mut_slice(), 1.0, self.p.as_slice(), alpha);
        axpby(self.r.as_mut_slice(), 1.0, self.at_ap.as_slice(), -alpha);

        let new_energy = self.r.dot(&self.r);
        let beta = direction_scale(new_energy, self.residual_energy)?;
        axpby(self.p.as_mut_slice(), beta, self.r.as_slice(), 1.0);

        self.residual_energy = new_energy;
        self.iteration += 1;
        self.last_elapsed = start.elapsed();
        Ok(Progress::Continue)
    }

    pub fn estimate(&self) -> &Volume {
        &self.x
    }

    pub fn residual_energy(&self) -> f32 {
        self.residual_energy
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn last_iteration_time(&self) -> Duration {
        self.last_elapsed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

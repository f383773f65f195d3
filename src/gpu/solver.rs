// gpu/solver.rs — Conjugate gradient on the normal equations, on the device.
//
// Device twin of `cg::HostCg`. Solves AᵗA·x = Aᵗb where A is the
// `Projector` collaborator and Aᵗ is the backprojection kernel in
// `gpu::ops`. Scalar policy (`step_length`, `direction_scale`) is shared
// with the host reference, so both stop on exactly the same conditions.
//
// STATE
// ─────
//   x, r, p, AtAp   volumes of the reconstruction extent
//   spare           same extent; receives every elementwise update and is
//                   swapped with the destination
//   images          image array, one slice per view; holds b during INIT
//                   and A·p afterwards
//   staging         packed buffer the projector renders one view into
//
// ONE ITERATION
// ─────────────
//   for each view:  project p → staging → images[view]
//   AtAp = Aᵗ·images
//   α = ⟨r,r⟩ / ⟨p,AtAp⟩        (reducer, blocks)
//   x += α·p
//   r −= α·AtAp
//   β = ⟨r',r'⟩ / ⟨r,r⟩          (reducer, blocks)
//   p = r + β·p
//
// Commands are enqueued in order on the one queue. The two reductions are
// the only waits, except with `SolverConfig::timing`, which makes every
// volume kernel wait for completion and log its wall time, and waits once
// more at the end so the recorded iteration time covers the whole step.

use std::time::{Duration, Instant};

use crate::cg::{direction_scale, step_length, Progress};
use crate::config::SolverConfig;
use crate::error::{FatalError, Result, Status};
use crate::geometry::ProjectionSet;
use crate::gpu::buffer::GpuBuffer;
use crate::gpu::device::GpuDevice;
use crate::gpu::image::{copy_region, DeviceImage, GpuVolume};
use crate::gpu::ops::{upload_views, VolumeKernels};
use crate::gpu::projector::Projector;
use crate::gpu::reducer::Reducer;
use crate::volume::{Extent3, Origin3, Volume};

/// Device CG reconstruction.
pub struct CgSolver<P: Projector, R: Reducer> {
    set: ProjectionSet,
    kernels: VolumeKernels,
    views: GpuBuffer,
    staging: GpuBuffer,
    images: GpuVolume,
    x: GpuVolume,
    r: GpuVolume,
    p: GpuVolume,
    at_ap: GpuVolume,
    spare: GpuVolume,
    projector: P,
    reducer: R,
    residual_energy: f32,
    iteration: u32,
    last_elapsed: Duration,
    degeneracy_floor: f32,
    timing: bool,
}

impl<P: Projector, R: Reducer> CgSolver<P, R> {
    /// INIT: r₀ = Aᵗb − AᵗA·x₀, p₀ = r₀, energy = ⟨r₀, r₀⟩.
    ///
    /// `measured` is the image array b and becomes the solver's image
    /// array. Without `initial`, x₀ = 0.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gpu: &GpuDevice,
        config: &SolverConfig,
        extent: Extent3,
        set: ProjectionSet,
        measured: GpuVolume,
        initial: Option<&GpuVolume>,
        projector: P,
        reducer: R,
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
        if let Some(x0) = initial {
            if x0.extent() != extent {
                return Err(FatalError::new(
                    Status::InvalidValue,
                    format!("initial guess is {}, expected {extent}", x0.extent()),
                ));
            }
        }

        let mut kernels = VolumeKernels::new(gpu)?;
        kernels.set_timing(config.timing);
        let views = upload_views(gpu, &set)?;
        let staging = GpuBuffer::new(
            gpu,
            set.image_width() as u64 * set.image_height() as u64 * 4,
            "projection staging",
        )?;

        let x = GpuVolume::filled(gpu, extent, 0.0, "cg x")?;
        let r = GpuVolume::filled(gpu, extent, 0.0, "cg r")?;
        let p = GpuVolume::filled(gpu, extent, 0.0, "cg p")?;
        let at_ap = GpuVolume::filled(gpu, extent, 0.0, "cg AtAp")?;
        let spare = GpuVolume::filled(gpu, extent, 0.0, "cg spare")?;

        let mut solver = CgSolver {
            set,
            kernels,
            views,
            staging,
            images: measured,
            x,
            r,
            p,
            at_ap,
            spare,
            projector,
            reducer,
            residual_energy: 0.0,
            iteration: 0,
            last_elapsed: Duration::ZERO,
            degeneracy_floor: config.degeneracy_floor,
            timing: config.timing,
        };
        solver.init(gpu, initial)?;
        Ok(solver)
    }

    fn init(&mut self, gpu: &GpuDevice, initial: Option<&GpuVolume>) -> Result<()> {
        self.kernels.backproject(gpu, &self.images, &self.set, &self.views, &self.r)?;

        if let Some(x0) = initial {
            copy_region(gpu, x0, &self.x, Origin3::ZERO, Origin3::ZERO, Extent3::default())?;
            Self::apply_normal_operator(
                gpu,
                &self.set,
                &self.kernels,
                &self.views,
                &self.staging,
                &self.images,
                &mut self.projector,
                &self.x,
                &self.at_ap,
            )?;
            self.kernels.update(gpu, &mut self.r, 1.0, Some(&self.at_ap), -1.0, &mut self.spare)?;
        }

        copy_region(gpu, &self.r, &self.p, Origin3::ZERO, Origin3::ZERO, Extent3::default())?;
        self.residual_energy = self.reducer.dot(gpu, &self.r, &self.r)?;
        if !self.residual_energy.is_finite() {
            return Err(FatalError::new(
                Status::NonFiniteValue,
                format!("initial residual energy is {}", self.residual_energy),
            ));
        }
        tracing::debug!(
            extent = %self.x.extent(),
            views = self.set.len(),
            residual_energy = self.residual_energy,
            warm_start = initial.is_some(),
            "cg initialised"
        );
        Ok(())
    }

    /// `dst = AᵗA·src`: project every view into the image array, then
    /// backproject.
    #[allow(clippy::too_many_arguments)]
    fn apply_normal_operator(
        gpu: &GpuDevice,
        set: &ProjectionSet,
        kernels: &VolumeKernels,
        views: &GpuBuffer,
        staging: &GpuBuffer,
        images: &GpuVolume,
        projector: &mut P,
        src: &GpuVolume,
        dst: &GpuVolume,
    ) -> Result<()> {
        for (i, view) in set.views().iter().enumerate() {
            projector.project(gpu, staging, view, src)?;
            kernels.copy_buffer_to_volume_slice(gpu, staging, images, i as u32)?;
        }
        kernels.backproject(gpu, images, set, views, dst)
    }

    /// One CG step.
    ///
    /// Returns `Progress::Converged` without changing any state when the
    /// step is degenerate. Never decides to stop on its own otherwise: the
    /// caller owns the iteration budget.
    pub fn iterate(&mut self, gpu: &GpuDevice) -> Result<Progress> {
        let start = Instant::now();

        Self::apply_normal_operator(
            gpu,
            &self.set,
            &self.kernels,
            &self.views,
            &self.staging,
            &self.images,
            &mut self.projector,
            &self.p,
            &self.at_ap,
        )?;

        let p_atap = self.reducer.dot(gpu, &self.p, &self.at_ap)?;
        let Some(alpha) = step_length(self.residual_energy, p_atap, self.degeneracy_floor)? else {
            tracing::warn!(
                iteration = self.iteration,
                residual_energy = self.residual_energy,
                p_atap,
                "degenerate step, treating as converged"
            );
            return Ok(Progress::Converged);
        };

        self.kernels.update(gpu, &mut self.x, 1.0, Some(&self.p), alpha, &mut self.spare)?;
        self.kernels.update(gpu, &mut self.r, 1.0, Some(&self.at_ap), -alpha, &mut self.spare)?;

        let new_energy = self.reducer.dot(gpu, &self.r, &self.r)?;
        let beta = direction_scale(new_energy, self.residual_energy)?;
        self.kernels.update(gpu, &mut self.p, beta, Some(&self.r), 1.0, &mut self.spare)?;

        self.residual_energy = new_energy;
        self.iteration += 1;
        if self.timing {
            gpu.wait_idle();
        }
        self.last_elapsed = start.elapsed();

        tracing::debug!(
            iteration = self.iteration,
            alpha,
            beta,
            p_atap,
            residual_energy = new_energy,
            elapsed = ?self.last_elapsed,
            "cg step"
        );
        Ok(Progress::Continue)
    }

    /// Current estimate x.
    pub fn estimate(&self) -> &GpuVolume {
        &self.x
    }

    /// ⟨r, r⟩ as of the last completed step.
    pub fn residual_energy(&self) -> f32 {
        self.residual_energy
    }

    /// Completed steps.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Wall time of the last completed step.
    pub fn last_iteration_time(&self) -> Duration {
        self.last_elapsed
    }

    pub fn projection_set(&self) -> &ProjectionSet {
        &self.set
    }

    /// Read x back to the host.
    pub fn read_estimate(&self, gpu: &GpuDevice) -> Result<Volume> {
        self.x.readback_all(gpu)
    }

    /// Consume the solver, keeping only x.
    pub fn into_estimate(self) -> GpuVolume {
        self.x
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cg::HostCg;
    use crate::geometry::{forward_project_all, ViewGeometry};
    use crate::gpu::memory::live_handles;
    use crate::gpu::projector::HostSplatProjector;
    use crate::gpu::reducer::{GpuReducer, HostReducer};
    use crate::gpu::test_support::run_gpu_test_in_subprocess;

    fn unrolled_pair() -> ProjectionSet {
        ProjectionSet::new(vec![ViewGeometry::unrolled(4), ViewGeometry::unrolled(4).shifted(0.5, 0.0)], 4, 16)
            .unwrap()
    }

    fn truth(extent: Extent3) -> Volume {
        Volume::from_fn(extent, |x, y, z| ((x * 3 + y * 5 + z * 7) % 11) as f32 / 11.0)
    }

    fn max_abs_diff(a: &Volume, b: &Volume) -> f32 {
        a.as_slice().iter().zip(b.as_slice()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_small_volume_converges_to_truth() {
        let gpu = GpuDevice::new().expect("device");
        let extent = Extent3::cube(4);
        let set = unrolled_pair();
        let x_true = truth(extent);
        let b = forward_project_all(&x_true, &set);

        let config = SolverConfig::default();
        let measured = GpuVolume::from_volume(&gpu, &b, "measured").unwrap();
        let mut solver = CgSolver::new(
            &gpu,
            &config,
            extent,
            set.clone(),
            measured,
            None,
            HostSplatProjector::new(&set),
            GpuReducer::new(&gpu).unwrap(),
        )
        .unwrap();
        let mut host = HostCg::new(extent, set, &b, None, &config).unwrap();

        let initial = solver.residual_energy();
        assert!((initial - host.residual_energy()).abs() <= 1e-4 * initial);
        assert!(!solver.kernels.timing());

        // The first few device iterates track the host reference.
        for _ in 0..3 {
            assert_eq!(solver.iterate(&gpu).unwrap(), Progress::Continue);
            assert_eq!(host.iterate().unwrap(), Progress::Continue);
            let diff = max_abs_diff(&solver.read_estimate(&gpu).unwrap(), host.estimate());
            assert!(diff < 1e-3, "device and host iterates diverged by {diff}");
        }

        for _ in 3..64 {
            if solver.iterate(&gpu).unwrap() == Progress::Converged
                || solver.residual_energy() <= 1e-12 * initial
            {
                break;
            }
        }
        let estimate = solver.read_estimate(&gpu).unwrap();
        let err = max_abs_diff(&estimate, &x_true);
        assert!(err < 1e-3, "reconstruction error {err} after {} iterations", solver.iteration());
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_identity_map_single_iteration_moves_toward_truth() {
        let gpu = GpuDevice::new().expect("device");
        let extent = Extent3::cube(8);
        let set = ProjectionSet::new(vec![ViewGeometry::unrolled(8)], 8, 64).unwrap();
        let x_true = truth(extent);
        let b = forward_project_all(&x_true, &set);

        let measured = GpuVolume::from_volume(&gpu, &b, "measured").unwrap();
        let mut solver = CgSolver::new(
            &gpu,
            &SolverConfig::default(),
            extent,
            set.clone(),
            measured,
            None,
            HostSplatProjector::new(&set),
            GpuReducer::new(&gpu).unwrap(),
        )
        .unwrap();

        let distance = |v: &Volume| {
            v.as_slice().iter().zip(x_true.as_slice()).map(|(a, b)| (a - b) * (a - b)).sum::<f32>().sqrt()
        };
        let before = distance(&solver.read_estimate(&gpu).unwrap());
        assert_eq!(solver.iterate(&gpu).unwrap(), Progress::Continue);

        let x1 = solver.read_estimate(&gpu).unwrap();
        assert!(x1.as_slice().iter().all(|v| !v.is_nan()));
        let after = distance(&x1);
        assert!(after < before, "‖x₁ − x*‖ = {after}, ‖x₀ − x*‖ = {before}");
        assert!(max_abs_diff(&x1, &x_true) < 1e-4);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_parallel_beam_residual_decreases() {
        let gpu = GpuDevice::new().expect("device");
        let extent = Extent3::cube(8);
        let set = ProjectionSet::new(vec![ViewGeometry::parallel_z()], 8, 8).unwrap();
        let b = forward_project_all(&Volume::filled(extent, 1.0), &set);

        let config = SolverConfig { timing: true, ..SolverConfig::default() };
        let measured = GpuVolume::from_volume(&gpu, &b, "measured").unwrap();
        let mut solver = CgSolver::new(
            &gpu,
            &config,
            extent,
            set.clone(),
            measured,
            None,
            HostSplatProjector::new(&set),
            HostReducer,
        )
        .unwrap();

        let before = solver.residual_energy();
        assert_eq!(solver.iterate(&gpu).unwrap(), Progress::Continue);
        assert_eq!(solver.iteration(), 1);
        assert!(solver.residual_energy() < before);
        assert!(solver.last_iteration_time() > Duration::ZERO);
        assert!(solver.kernels.timing(), "timing must reach the volume kernels");
        let norm = solver.read_estimate(&gpu).unwrap().norm();
        assert!(norm.is_finite() && norm > 0.0);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_exact_initial_guess_is_converged() {
        let gpu = GpuDevice::new().expect("device");
        let extent = Extent3::cube(4);
        let set = unrolled_pair();
        // Integer-valued truth keeps A·x exact in f32, so r₀ is exactly 0.
        let x_true = Volume::from_fn(extent, |x, y, z| ((x + y + z) % 3) as f32);
        let b = forward_project_all(&x_true, &set);

        let measured = GpuVolume::from_volume(&gpu, &b, "measured").unwrap();
        let x0 = GpuVolume::from_volume(&gpu, &x_true, "x0").unwrap();
        let mut solver = CgSolver::new(
            &gpu,
            &SolverConfig::default(),
            extent,
            set.clone(),
            measured,
            Some(&x0),
            HostSplatProjector::new(&set),
            HostReducer,
        )
        .unwrap();

        assert!(solver.residual_energy() <= 1e-8, "energy {}", solver.residual_energy());
        let before = solver.read_estimate(&gpu).unwrap();
        if solver.residual_energy() == 0.0 {
            assert_eq!(solver.iterate(&gpu).unwrap(), Progress::Converged);
            assert_eq!(solver.iteration(), 0);
        }
        assert!(max_abs_diff(&solver.read_estimate(&gpu).unwrap(), &before) < 1e-4);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_mismatched_measurement_rejected_and_handles_released() {
        let gpu = GpuDevice::new().expect("device");
        let baseline = live_handles();
        let set = unrolled_pair();

        let wrong = GpuVolume::filled(&gpu, Extent3::new(4, 16, 3), 0.0, "wrong").unwrap();
        let err = CgSolver::new(
            &gpu,
            &SolverConfig::default(),
            Extent3::cube(4),
            set.clone(),
            wrong,
            None,
            HostSplatProjector::new(&set),
            HostReducer,
        )
        .err()
        .expect("mismatched image array must be rejected");
        assert_eq!(err.status, Status::InvalidValue);
        assert_eq!(live_handles(), baseline);

        {
            let measured = GpuVolume::filled(&gpu, set.image_array_extent(), 1.0, "measured").unwrap();
            let mut solver = CgSolver::new(
                &gpu,
                &SolverConfig::default(),
                Extent3::cube(4),
                set.clone(),
                measured,
                None,
                HostSplatProjector::new(&set),
                GpuReducer::new(&gpu).unwrap(),
            )
            .unwrap();
            solver.iterate(&gpu).unwrap();
            assert!(live_handles() > baseline);

            // A second solver on the same device reuses every program.
            let programs = gpu.compiled_programs();
            let measured = GpuVolume::filled(&gpu, set.image_array_extent(), 1.0, "measured 2").unwrap();
            let second = CgSolver::new(
                &gpu,
                &SolverConfig::default(),
                Extent3::cube(4),
                set.clone(),
                measured,
                None,
                HostSplatProjector::new(&set),
                GpuReducer::new(&gpu).unwrap(),
            )
            .unwrap();
            assert_eq!(gpu.compiled_programs(), programs);
            drop(second);
            let estimate = solver.into_estimate();
            assert_eq!(estimate.extent(), Extent3::cube(4));
        }
        assert_eq!(live_handles(), baseline, "device handles leaked");
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_small_volume_converges_to_truth() {
        let out = run_gpu_test_in_subprocess("gpu::solver::tests::inner_small_volume_converges_to_truth");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_identity_map_single_iteration_moves_toward_truth() {
        let out = run_gpu_test_in_subprocess(
            "gpu::solver::tests::inner_identity_map_single_iteration_moves_toward_truth",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_parallel_beam_residual_decreases() {
        let out = run_gpu_test_in_subprocess("gpu::solver::tests::inner_parallel_beam_residual_decreases");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_exact_initial_guess_is_converged() {
        let out = run_gpu_test_in_subprocess("gpu::solver::tests::inner_exact_initial_guess_is_converged");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_mismatched_measurement_rejected_and_handles_released() {
        let out = run_gpu_test_in_subprocess(
            "gpu::solver::tests::inner_mismatched_measurement_rejected_and_handles_released",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}

// demos/phantom_reconstruct.rs — Reconstruct a synthetic phantom on the GPU.
//
//   cargo run --example phantom_reconstruct [config.toml] [iterations]
//   RUST_LOG=tomo_cg=debug cargo run --example phantom_reconstruct
//
// Builds a spherical phantom, simulates a parallel-beam scan with the host
// projector, uploads the measurements, and runs device CG until it
// converges or the iteration budget is spent. Prints the residual energy
// and the reconstruction error each step.

use tracing_subscriber::EnvFilter;

use tomo_cg::cg::Progress;
use tomo_cg::geometry::{forward_project_all, ProjectionSet, ViewGeometry};
use tomo_cg::gpu::device::initialize_device;
use tomo_cg::gpu::image::GpuVolume;
use tomo_cg::gpu::projector::HostSplatProjector;
use tomo_cg::gpu::reducer::GpuReducer;
use tomo_cg::gpu::solver::CgSolver;
use tomo_cg::{Extent3, ReconConfig, Result, Volume};

const SIDE: u32 = 24;
const VIEWS: usize = 12;

fn phantom(extent: Extent3) -> Volume {
    let c = (SIDE as f32 - 1.0) * 0.5;
    Volume::from_fn(extent, |x, y, z| {
        let d2 = (x as f32 - c).powi(2) + (y as f32 - c).powi(2) + (z as f32 - c).powi(2);
        match d2 {
            d if d <= (SIDE as f32 * 0.15).powi(2) => 2.0,
            d if d <= (SIDE as f32 * 0.4).powi(2) => 1.0,
            _ => 0.0,
        }
    })
}

fn run(config: &ReconConfig, iterations: u32) -> Result<()> {
    let gpu = initialize_device(&config.device)?;
    println!("{gpu}");

    let extent = Extent3::cube(SIDE);
    let image_width = SIDE + SIDE / 2;
    let views = (0..VIEWS)
        .map(|i| {
            let angle = std::f32::consts::PI * i as f32 / VIEWS as f32;
            ViewGeometry::parallel_beam(angle, extent, image_width)
        })
        .collect();
    let set = ProjectionSet::new(views, image_width, SIDE)?;

    let truth = phantom(extent);
    let b = forward_project_all(&truth, &set);
    let measured = GpuVolume::from_volume(gpu, &b, "measured")?;

    let mut solver = CgSolver::new(
        gpu,
        &config.solver,
        extent,
        set.clone(),
        measured,
        None,
        HostSplatProjector::new(&set),
        GpuReducer::new(gpu)?,
    )?;
    println!("initial residual energy {:.6e}", solver.residual_energy());

    for _ in 0..iterations {
        if solver.iterate(gpu)? == Progress::Converged {
            println!("converged after {} iterations", solver.iteration());
            break;
        }
        let estimate = solver.read_estimate(gpu)?;
        let mut err = estimate.clone();
        err.as_mut_slice()
            .iter_mut()
            .zip(truth.as_slice())
            .for_each(|(e, t)| *e -= t);
        println!(
            "iter {:3}  energy {:.6e}  rms error {:.4}  {:?}",
            solver.iteration(),
            solver.residual_energy(),
            err.norm() / (extent.texel_count() as f32).sqrt(),
            solver.last_iteration_time(),
        );
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => match ReconConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{path}: {e}");
                std::process::exit(2);
            }
        },
        None => ReconConfig::default(),
    };
    let iterations = args.next().and_then(|s| s.parse().ok()).unwrap_or(20);

    if let Err(e) = run(&config, iterations) {
        e.abort();
    }
}

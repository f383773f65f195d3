// tomo-cg: GPU conjugate-gradient tomographic reconstruction
//
// Reconstructs a 3-D density volume from a set of 2-D projection images by
// running conjugate gradient on the normal equations AᵗA·x = Aᵗb.
//
// The host modules are the reference implementation; `gpu` mirrors them on
// wgpu and is validated against them.

pub mod error;
pub mod config;
pub mod volume;
pub mod geometry;
pub mod cg;
pub mod gpu;

pub use cg::Progress;
pub use config::{DeviceConfig, DeviceProfile, ReconConfig, SolverConfig};
pub use error::{FatalError, Result, Status};
pub use geometry::{ProjectionSet, ViewGeometry};
pub use volume::{Extent3, Origin3, Volume};

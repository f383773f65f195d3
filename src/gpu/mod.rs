// gpu/mod.rs — device layer.
//
// wgpu-based resources and kernels that mirror the host reference in the
// parent crate. The host implementations (`geometry`, `cg`) remain the
// authoritative reference; every device kernel is validated against them.
//
// Layering, leaves first:
//
//   device     once-guarded context, error scopes, workgroup sizes
//   memory     single-owner native handles + live-handle audit counter
//   buffer     linear memory
//   image      2-D images and 3-D volumes (R32Float textures)
//   sampler    fixed sampler presets
//   kernel     WGSL compilation, positional binding, dispatch
//   ops        the solver's kernels: update, backprojection, transfers
//   projector  forward-projection collaborator
//   reducer    dot-product collaborator
//   solver     CG on the normal equations
//
// All commands go to the one in-order queue owned by `GpuDevice`. Only
// host-visible reads (buffer maps) block.

pub mod buffer;
pub mod device;
pub mod image;
pub mod kernel;
pub mod memory;
pub mod ops;
pub mod projector;
pub mod reducer;
pub mod sampler;
pub mod solver;

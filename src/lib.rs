//! # Ultrasound volume reconstruction
//!
//! This crate reconstructs a regular 3D scalar volume from a sequence of
//! freehand, tracked 2D ultrasound slices.
//!
//! Each slice carries its pixel data, its in-plane geometry and a tracking
//! transform. A shared binary mask marks the pixels that may contribute
//! (e.g. excluding the probe housing). Reconstruction runs in four steps:
//!  - the output grid is chosen to tightly bound every transformed slice
//!  - volume-index to slice-index matrices are composed per slice
//!  - slices are dispatched in fixed-size batches to a compute backend that
//!    splats Gaussian-weighted contributions into an accumulation buffer
//!  - the accumulated `(weight, weight × value)` pairs are normalized into
//!    voxel intensities
//!
//! Two backends implement the kernel: [`GpuBackend`] runs a wgpu compute
//! shader on a [`GpuContext`] owned by the application, [`CpuBackend`] runs
//! the same math on the host with rayon.
//!
//! # Examples
//!
//! ## Reconstructing three parallel slices on the CPU
//!
//! ```
//! # use us_reconstruction::{CpuBackend, Reconstructor, RigidTransform, Slice, ValidityMask};
//! # use glam::DVec3;
//! # use ndarray::Array2;
//! let slices: Vec<_> = (0..3)
//!     .map(|i| Slice::axis_aligned(Array2::from_elem((16, 16), 10.0), DVec3::new(0.0, 0.0, i as f64)))
//!     .collect();
//! let transforms = vec![RigidTransform::IDENTITY; slices.len()];
//! let mask = ValidityMask::all_valid(16, 16);
//!
//! let reconstructor = Reconstructor::new(CpuBackend);
//! let volume = reconstructor
//!     .reconstruct(&slices, &transforms, Some(&mask), &RigidTransform::IDENTITY, 1.0, 1, 0.5)
//!     .expect("should have reconstructed the sweep");
//! assert_eq!(volume.dim(), (3, 16, 16));
//! ```

pub mod backend;
pub mod batch;
pub mod config;
pub mod enums;
pub mod error;
pub mod extent;
pub mod kernel;
pub mod normalize;
pub mod reconstructor;
pub mod slice;
pub mod transform;
pub mod volume;

pub use backend::{ComputeBackend, CpuBackend, GpuBackend, GpuContext};
pub use config::ReconstructionConfig;
pub use error::{ReconstructionError, Result};
pub use reconstructor::{ReconstructionRequest, Reconstructor};
pub use slice::{Slice, ValidityMask};
pub use transform::RigidTransform;
pub use volume::OutputVolume;

// ─────────────────────────────────────────────────────────────────────
// Gradspace — Spatial Null Models
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Null models preserving spatial autocorrelation.
//!
//! - `rotation`: uniform random 3-D rotations and hemisphere mirroring
//! - `spin`: spin permutations on spherical surfaces
//! - `moran`: Moran spectral randomization on spatial weight graphs
//!
//! Both models split into an estimator holding configuration and an
//! immutable fitted state (`FittedSpins`, `MoranEigenvectors`) that can be
//! shared across threads and randomized against many data vectors.

pub mod moran;
pub mod rotation;
pub mod spin;

pub use moran::{MoranComponents, MoranEigenvectors, MoranRandomization};
pub use rotation::{random_rotation, reflect_x, rotate, Rotation};
pub use spin::{FittedSpins, HemisphereSpins, SpinPermutations, SpinSurrogates};

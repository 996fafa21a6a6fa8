//! Machine-level instrumentation passes for Thumb-2 functions.
//!
//! The crate splits into the editing substrate and the passes built on it:
//!
//! - [`itblock`]: instruction insertion and removal that keeps `it` block
//!   coverage intact across edits.
//! - [`liveness`]: backward per-block register liveness queries for finding
//!   free scratch registers.
//! - [`shadow_stack`]: the return-address shadow stack rewriter.
//! - [`diag`]: the non-fatal warning channel shared by the passes.

pub mod diag;
pub mod itblock;
pub mod liveness;
pub mod shadow_stack;

pub use diag::{Diag, DiagSink, StderrSink};
pub use shadow_stack::{ShadowStackConfig, ShadowStackPass};

//! The warning channel for non-fatal instrumentation conditions.
//!
//! Nothing here stops a compilation: every diagnostic has a recovery
//! already applied (skip, spill, or proceed-with-assumption). Hosts decide
//! where the lines go by supplying a [`DiagSink`].

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Diag {
    #[error("privileged function skipped: {func}")]
    PrivilegedSkipped { func: String },

    #[error("variable-sized stack objects not promoted in {func}")]
    VarSizedFrame { func: String },

    #[error("unable to find a free register in {func} for `{inst}`")]
    NoFreeReg { func: String, inst: String },
}

pub trait DiagSink {
    fn report(&mut self, diag: Diag);
}

impl DiagSink for Vec<Diag> {
    fn report(&mut self, diag: Diag) {
        self.push(diag);
    }
}

/// Writes one line per diagnostic to stderr.
#[derive(Debug, Default)]
pub struct StderrSink;

impl DiagSink for StderrSink {
    fn report(&mut self, diag: Diag) {
        eprintln!("[shadow-stack] {diag}");
    }
}

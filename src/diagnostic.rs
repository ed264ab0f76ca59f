//! Observable signals for the automatic corrections the attention module makes.
//!
//! Nothing here is an error: the call proceeds, but every silent default is
//! reported to a [`DiagnosticSink`] so callers (and tests) can tell which ones fired.

use std::sync::{Mutex, PoisonError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// A 2-D layout was repeated across all heads.
    LayoutBroadcast {
        num_heads: usize,
        row_blocks: usize,
        col_blocks: usize,
    },
    /// A boolean attention mask was rewritten as an additive one.
    MaskConverted { shape: [usize; 4] },
    /// Inputs wider than half precision were narrowed for the kernels.
    PrecisionNarrowed { from: &'static str },
}

pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: &Diagnostic);
}

/// Forwards diagnostics to `tracing`.
#[derive(Clone, Copy, Default, Debug)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, diagnostic: &Diagnostic) {
        match *diagnostic {
            Diagnostic::LayoutBroadcast {
                num_heads,
                row_blocks,
                col_blocks,
            } => tracing::warn!(
                num_heads,
                row_blocks,
                col_blocks,
                "layout has no head dimension, using the same layout across all heads"
            ),
            Diagnostic::MaskConverted { shape } => tracing::warn!(
                ?shape,
                "mask has to be additive, converting it slows things down"
            ),
            Diagnostic::PrecisionNarrowed { from } => {
                tracing::debug!(from, "narrowing inputs to f16 for block sparse kernels")
            }
        }
    }
}

/// Keeps every diagnostic it receives.
#[derive(Default, Debug)]
pub struct Recorder(Mutex<Vec<Diagnostic>>);

impl Recorder {
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn count(&self, f: impl Fn(&Diagnostic) -> bool) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|d| f(d))
            .count()
    }
}

impl DiagnosticSink for Recorder {
    fn emit(&self, diagnostic: &Diagnostic) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic.clone())
    }
}

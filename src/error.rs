//! Error taxonomy for invocations
//!
//! Everything else travels as `anyhow::Error`; these variants exist so callers
//! can tell the fatal invocation failures apart with `downcast_ref`.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("failed to start {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("no revision resolvable from {0:?}")]
    NoRevision(String),
    #[error("failed to materialize buffer: {0}")]
    TempFile(#[source] io::Error),
    #[error("unknown language {0:?}")]
    UnknownLanguage(String),
    #[error("invalid palette: {0}")]
    InvalidPalette(String),
}

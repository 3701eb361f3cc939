//! Crate-wide error type.
//!
//! Configuration mistakes and other conditions a caller can reasonably react
//! to are surfaced through [`Error`]. Conditions that indicate a broken
//! invariant (a bug, not a user mistake) remain `panic!`/`assert!` at the call
//! site, as described in the move framework's error handling design.

use thiserror::Error;

/// Errors surfaced by configuration loading and move construction.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown move kind `{0}` in configuration")]
    UnknownMoveKind(String),

    #[error("move `{mov}` is missing required key `{key}`")]
    MissingKey { mov: String, key: String },

    #[error("move `{mov}` molecule `{molecule}` has contradictory options: {reason}")]
    ContradictoryOptions {
        mov: String,
        molecule: String,
        reason: String,
    },

    #[error("unknown molecule id `{0}` referenced in move configuration")]
    UnknownMolecule(String),

    #[error("grand-canonical titration requires all coupled counter-ions to be monovalent, but `{species}` has charge {charge}")]
    MultivalentTitrationIon { species: String, charge: i32 },

    #[error("field iteration in polarisation wrapper failed to converge after {iterations} iterations (threshold {threshold})")]
    PolarisationDivergence { iterations: usize, threshold: f64 },

    #[error("failed to read configuration file `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

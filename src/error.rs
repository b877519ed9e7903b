use thiserror::Error;

use crate::profile::{EquivalenceClassId, ProgramId, VarId};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("static analysis has already been performed for this session")]
    Reanalysis,

    #[error("profile has no lowered variable data, cannot simulate variable liveness")]
    MissingLivenessData,

    #[error("inputs of operation '{operation}' reference more than one layer: {layers:?}")]
    AmbiguousLayerInput {
        operation: String,
        layers: Vec<String>,
    },

    #[error("{what} has {found} tile entries, expected {expected}")]
    TileCountMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    #[error("variable {variable} is assigned to tile {tile} but target has {num_tiles} tiles")]
    TileOutOfRange {
        variable: VarId,
        tile: usize,
        num_tiles: usize,
    },

    #[error("{what} refers to step {step} but the timeline has {num_steps} steps")]
    StepOutOfRange {
        what: String,
        step: usize,
        num_steps: usize,
    },

    #[error("unknown lowered variable {0}")]
    UnknownVariable(VarId),

    #[error("unknown equivalence class {0}")]
    UnknownEquivalenceClass(EquivalenceClassId),

    #[error("unknown program {0}")]
    UnknownProgram(ProgramId),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unable to write table: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("unable to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

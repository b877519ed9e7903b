//! Memory-driven pipeline partitioning of compiled models.
//!
//! A profile of the compiled program is turned into static tables
//! ([`analysis`]), grouped into layer-tagged operations ([`operation`]) and
//! split by the [`solver`] into stages whose peak per-tile memory, as
//! computed by [`stage::Stage`], fits the device.

pub mod analysis;
pub mod diagnostics;
pub mod error;
pub mod layers;
pub mod memory;
pub mod operation;
pub mod profile;
pub mod program;
pub mod report;
pub mod snapshot;
pub mod solver;
pub mod stage;
pub mod synthetic;

pub use analysis::{AnalysisContext, AnalysisSession, AnalysisTables};
pub use error::{AnalysisError, AnalysisResult};
pub use operation::OperationList;
pub use solver::{GreedySolver, SolveOutcome, SolverConfig, Split};
pub use stage::Stage;

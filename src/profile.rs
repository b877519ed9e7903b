//! Raw profile records as handed over by the profiling front-end.
//!
//! Decoding the binary profile/debug formats happens elsewhere; this module
//! only describes the JSON interchange document the analysis consumes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisResult;

pub type ProgramId = u64;
pub type VarId = u64;
pub type EquivalenceClassId = u64;
pub type DebugContextId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProfile {
    pub num_tiles: usize,
    /// Program executed at every liveness step, in timeline order.
    pub steps: Vec<ProgramId>,
    pub tiles: Vec<RawTile>,
    pub programs: Vec<RawProgram>,
    #[serde(default)]
    pub lowered_variables: Option<Vec<RawVariable>>,
    #[serde(default)]
    pub equivalence_classes: Vec<RawEquivalenceClass>,
    pub operations: Vec<RawOperation>,
}

impl RawProfile {
    pub fn from_file<P: AsRef<Path>>(path: P) -> AnalysisResult<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_str(&s)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> AnalysisResult<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json(&self) -> AnalysisResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTile {
    pub vertices: Vec<RawTileVertex>,
}

/// Code size of one vertex type as laid out on a particular tile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTileVertex {
    pub type_name: String,
    pub code_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    OnTileExecute,
    DoExchange,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProgram {
    pub id: ProgramId,
    pub kind: ProgramKind,
    #[serde(default)]
    pub children: Vec<ProgramId>,
    pub control_code_by_tile: Vec<u64>,
    #[serde(default)]
    pub code_bytes_by_tile: Vec<u64>,
    #[serde(default)]
    pub vertices: Vec<RawVertexCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawVertexCount {
    pub type_name: String,
    pub type_size: u64,
    pub count_by_tile: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawVariable {
    pub id: VarId,
    pub bytes: u64,
    pub tile: usize,
    pub equivalence_class: EquivalenceClassId,
}

/// Half-open `[start, end)` range of steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInterval {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEquivalenceClass {
    pub id: EquivalenceClassId,
    pub intervals: Vec<StepInterval>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDebugContext {
    pub id: DebugContextId,
    /// JSON document, the `inputs` array lists the operation's input names.
    #[serde(default)]
    pub json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOperation {
    pub name: String,
    pub debug_context: RawDebugContext,
    pub first_step_index: usize,
    pub last_step_index: usize,
    pub programs: Vec<ProgramId>,
    #[serde(default)]
    pub variables: Vec<VarId>,
}

#[derive(Deserialize)]
struct DebugContextFields {
    #[serde(default)]
    inputs: Vec<String>,
}

impl RawOperation {
    /// Input names recorded in the debug context. Malformed documents yield
    /// no inputs.
    pub fn inputs(&self) -> Vec<String> {
        if self.debug_context.json.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<DebugContextFields>(&self.debug_context.json) {
            Ok(fields) => fields.inputs,
            Err(e) => {
                log::debug!("Ignoring debug context of '{}': {e}", self.name);
                Vec::new()
            }
        }
    }
}

//! Operations and their named occurrences in execution order.

use std::collections::{BTreeSet, HashMap};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{AnalysisContext, AnalysisSession},
    error::{AnalysisError, AnalysisResult},
    layers::{order_layers, Layer, LayerNamer, LayerNote, LayerOrder, NamingConfig, NamingInput, RegexLayerNamer},
    profile::{DebugContextId, ProgramId, RawOperation, RawProfile, VarId},
};

/// Programs sharing one debug context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub debug_context: DebugContextId,
    pub program_ids: BTreeSet<ProgramId>,
    pub first_step_index: usize,
    pub last_step_index: usize,
    /// Filled in once layers are known, see [`OperationList::populate_vars`].
    pub used_vars: BTreeSet<VarId>,
    recorded_vars: BTreeSet<VarId>,
    pub is_tensor: bool,
    pub is_ever_in_layer: bool,
    pub inputs: Vec<String>,
}

impl Operation {
    fn from_raw(raw: &RawOperation) -> Self {
        Self {
            debug_context: raw.debug_context.id,
            program_ids: raw.programs.iter().copied().collect(),
            first_step_index: raw.first_step_index,
            last_step_index: raw.last_step_index,
            used_vars: BTreeSet::new(),
            recorded_vars: raw.variables.iter().copied().collect(),
            is_tensor: raw.name.starts_with("Tensor/"),
            is_ever_in_layer: false,
            inputs: raw.inputs(),
        }
    }
}

/// An occurrence of an [`Operation`] in the execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedOperation {
    /// Index of the operation in [`OperationList::operations`].
    pub uid: usize,
    pub name: String,
    pub layer: Layer,
    pub note: LayerNote,
}

impl NamedOperation {
    pub fn is_in_layer(&self) -> bool {
        self.layer.is_some()
    }
}

/// A named occurrence together with the operation it refers to.
#[derive(Debug, Clone, Copy)]
pub struct NamedRef<'a> {
    pub named: &'a NamedOperation,
    pub operation: &'a Operation,
}

impl NamedRef<'_> {
    pub fn is_in_layer(&self) -> bool {
        self.named.is_in_layer()
    }

    pub fn layer(&self) -> &Layer {
        &self.named.layer
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationList {
    operations: Vec<Operation>,
    sequence: Vec<NamedOperation>,
    layer_order: LayerOrder,
}

impl OperationList {
    /// Builds the operation model, registering every program with `ctx`, and
    /// assigns layers with `namer`.
    pub fn build(
        ctx: &mut AnalysisContext,
        profile: &RawProfile,
        namer: &dyn LayerNamer,
        layer_order: LayerOrder,
    ) -> AnalysisResult<Self> {
        log::info!("Building operation list...");
        let raw_programs: HashMap<ProgramId, _> =
            profile.programs.iter().map(|p| (p.id, p)).collect();
        let num_steps = ctx.tables().num_steps();

        let mut operations: Vec<Operation> = Vec::new();
        let mut by_context: HashMap<DebugContextId, usize> = HashMap::new();
        let mut sequence = Vec::new();

        for raw in &profile.operations {
            let uid = match by_context.get(&raw.debug_context.id) {
                Some(&uid) => uid,
                None => {
                    for id in &raw.programs {
                        let program = raw_programs
                            .get(id)
                            .ok_or(AnalysisError::UnknownProgram(*id))?;
                        ctx.register_program(program)?;
                    }
                    if !raw.programs.is_empty() && raw.last_step_index >= num_steps {
                        return Err(AnalysisError::StepOutOfRange {
                            what: format!("operation '{}'", raw.name),
                            step: raw.last_step_index,
                            num_steps,
                        });
                    }
                    for var in &raw.variables {
                        ctx.tables().lowered_var(*var)?;
                    }
                    operations.push(Operation::from_raw(raw));
                    by_context.insert(raw.debug_context.id, operations.len() - 1);
                    operations.len() - 1
                }
            };
            if operations[uid].program_ids.is_empty() {
                continue;
            }
            sequence.push(NamedOperation {
                uid,
                name: raw.name.clone(),
                layer: None,
                note: LayerNote::default(),
            });
        }
        log::info!(
            "Operations: {} unique, {} in execution order, {} programs",
            operations.len(),
            sequence.len(),
            ctx.num_programs()
        );

        let mut list = Self {
            operations,
            sequence,
            layer_order,
        };
        list.assign_layers(namer);
        list.populate_vars(false);
        Ok(list)
    }

    /// Runs the static analysis on a fresh session and builds the list with
    /// the regex namer.
    pub fn analyse(
        profile: &RawProfile,
        naming: &NamingConfig,
        threads: usize,
    ) -> AnalysisResult<(AnalysisContext, Self)> {
        let namer = RegexLayerNamer::new(naming)?;
        let mut session = AnalysisSession::new(threads);
        let ctx = session.analyse(profile)?;
        let list = Self::build(ctx, profile, &namer, naming.layer_order)?;
        let ctx = session.into_context().ok_or(AnalysisError::Reanalysis)?;
        Ok((ctx, list))
    }

    /// Reassigns every layer and recomputes layer membership.
    pub fn assign_layers(&mut self, namer: &dyn LayerNamer) {
        let assignments = {
            let inputs = self
                .sequence
                .iter()
                .map(|named| {
                    let op = &self.operations[named.uid];
                    NamingInput {
                        name: &named.name,
                        inputs: &op.inputs,
                        is_tensor: op.is_tensor,
                    }
                })
                .collect_vec();
            namer.assign(&inputs)
        };

        for op in &mut self.operations {
            op.is_ever_in_layer = false;
        }
        for (named, assignment) in self.sequence.iter_mut().zip(assignments) {
            named.layer = assignment.layer;
            named.note = assignment.note;
            if named.layer.is_some() {
                self.operations[named.uid].is_ever_in_layer = true;
            }
        }
    }

    /// Fills the used variables of layer member operations, or of every
    /// operation when `all` is set, and clears the others.
    pub fn populate_vars(&mut self, all: bool) {
        for op in &mut self.operations {
            op.used_vars = if all || op.is_ever_in_layer {
                op.recorded_vars.clone()
            } else {
                BTreeSet::new()
            };
        }
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<NamedRef<'_>> {
        self.sequence.get(index).map(|named| NamedRef {
            named,
            operation: &self.operations[named.uid],
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = NamedRef<'_>> + '_ {
        self.sequence.iter().map(|named| NamedRef {
            named,
            operation: &self.operations[named.uid],
        })
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn layer_order(&self) -> LayerOrder {
        self.layer_order
    }

    pub fn set_layer_order(&mut self, order: LayerOrder) {
        self.layer_order = order;
    }

    /// Distinct layers including `None` for operations outside any layer.
    pub fn layers(&self) -> Vec<Layer> {
        order_layers(self.sequence.iter().map(|n| &n.layer), self.layer_order)
    }
}

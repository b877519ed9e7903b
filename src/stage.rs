//! A candidate pipeline stage and its per-tile memory.
//!
//! Exchange code, control code and variable usage are memoized in the
//! [`AnalysisContext`] keyed by the sorted ids of the stage members, so the
//! many overlapping candidates tried by the solver share their results.

use std::{
    cell::OnceCell,
    collections::{BTreeMap, BTreeSet, HashMap},
};

use rayon::prelude::*;

use crate::{
    analysis::{AnalysisContext, VarUsageKey},
    memory::{MemoryBreakdown, TileBytes},
    operation::NamedRef,
    profile::{EquivalenceClassId, ProgramId, VarId},
    program::VertexType,
};

pub struct Stage<'a> {
    ctx: &'a AnalysisContext,
    program_ids: BTreeSet<ProgramId>,
    used_vars: BTreeSet<VarId>,
    first_step_index: Option<usize>,
    last_step_index: Option<usize>,
    first_step_in_layer: bool,
    vertex_counts: OnceCell<BTreeMap<VertexType, TileBytes>>,
}

impl<'a> Stage<'a> {
    pub fn new(ctx: &'a AnalysisContext) -> Self {
        Self {
            ctx,
            program_ids: BTreeSet::new(),
            used_vars: BTreeSet::new(),
            first_step_index: None,
            last_step_index: None,
            first_step_in_layer: false,
            vertex_counts: OnceCell::new(),
        }
    }

    pub fn add(&mut self, op: NamedRef<'_>) -> &mut Self {
        let in_layer = op.is_in_layer();
        self.program_ids.extend(&op.operation.program_ids);
        if in_layer {
            self.used_vars.extend(&op.operation.used_vars);
        }
        // The span starts at the first layer operation once there is one.
        if self.first_step_index.is_none() || (in_layer && !self.first_step_in_layer) {
            self.first_step_index = Some(op.operation.first_step_index);
            self.first_step_in_layer = in_layer;
        }
        // A repeated debug context carries the span of its first occurrence,
        // so the end of the span only ever moves forward.
        let last = op.operation.last_step_index;
        self.last_step_index = Some(self.last_step_index.map_or(last, |l| l.max(last)));
        self.vertex_counts.take();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.program_ids.is_empty()
    }

    pub fn program_ids(&self) -> &BTreeSet<ProgramId> {
        &self.program_ids
    }

    pub fn used_vars(&self) -> &BTreeSet<VarId> {
        &self.used_vars
    }

    pub fn first_step_index(&self) -> Option<usize> {
        self.first_step_index
    }

    pub fn last_step_index(&self) -> Option<usize> {
        self.last_step_index
    }

    fn zeros(&self) -> TileBytes {
        TileBytes::zeros(self.ctx.num_tiles())
    }

    fn programs_key(&self) -> Box<[ProgramId]> {
        self.program_ids.iter().copied().collect()
    }

    fn vertex_counts(&self) -> &BTreeMap<VertexType, TileBytes> {
        self.vertex_counts.get_or_init(|| {
            let mut counts: BTreeMap<VertexType, TileBytes> = BTreeMap::new();
            for program in self.program_ids.iter().filter_map(|id| self.ctx.program(*id)) {
                for (vertex, by_tile) in &program.vertex_count_by_tile {
                    *counts.entry(vertex.clone()).or_insert_with(|| self.zeros()) += by_tile.as_slice();
                }
            }
            counts
        })
    }

    /// Code of every vertex type present on a tile, counted once per tile
    /// however many instances there are.
    pub fn code_bytes_by_tile(&self) -> TileBytes {
        let mut present: BTreeMap<&str, TileBytes> = BTreeMap::new();
        for (vertex, counts) in self.vertex_counts() {
            *present
                .entry(vertex.name.as_str())
                .or_insert_with(|| self.zeros()) += counts;
        }
        let code_by_type = &self.ctx.tables().code_bytes_by_type;
        let mut bytes = self.zeros();
        for (name, counts) in &present {
            if let Some(code) = code_by_type.get(*name) {
                bytes.add_masked(code, counts.as_slice());
            }
        }
        bytes
    }

    pub fn vertex_state_bytes_by_tile(&self) -> TileBytes {
        let mut bytes = self.zeros();
        for (vertex, counts) in self.vertex_counts() {
            bytes.add_scaled(counts.as_slice(), vertex.size);
        }
        bytes
    }

    pub fn exchange_code_by_tile(&self) -> TileBytes {
        self.ctx.exchange_code(self.programs_key(), || {
            let mut bytes = self.zeros();
            for program in self.program_ids.iter().filter_map(|id| self.ctx.program(*id)) {
                bytes += program.exchange_code_by_tile.as_slice();
            }
            bytes
        })
    }

    pub fn control_code_by_tile(&self) -> TileBytes {
        self.ctx.control_code(self.programs_key(), || {
            let mut bytes = self.zeros();
            for program in self.program_ids.iter().filter_map(|id| self.ctx.program(*id)) {
                bytes += program.control_code_by_tile.as_slice();
            }
            bytes
        })
    }

    /// Peak bytes of simultaneously live variables on each tile over the
    /// stage's step span.
    pub fn max_vars_usage(&self) -> TileBytes {
        let (first, last) = match (self.first_step_index, self.last_step_index) {
            (Some(first), Some(last)) if first <= last => (first, last),
            _ => return self.zeros(),
        };
        let key = VarUsageKey {
            vars: self.used_vars.iter().copied().collect(),
            first_step: first,
            last_step: last,
        };
        self.ctx
            .vars_usage(key, || self.simulate_vars_usage(first, last))
    }

    fn simulate_vars_usage(&self, first: usize, last: usize) -> TileBytes {
        let tables = self.ctx.tables();
        let mut bytes_by_class: Vec<HashMap<EquivalenceClassId, u64>> =
            vec![HashMap::new(); self.ctx.num_tiles()];
        for var in self.used_vars.iter().filter_map(|id| tables.lowered_var(*id).ok()) {
            *bytes_by_class[var.tile]
                .entry(var.equivalence_class)
                .or_default() += var.bytes;
        }

        let peaks: Vec<u64> = self.ctx.pool().install(|| {
            bytes_by_class
                .par_iter()
                .map(|classes| {
                    let mut by_step = vec![0u64; last - first + 1];
                    for (class, bytes) in classes {
                        let Ok(liveness) = tables.liveness(*class) else {
                            continue;
                        };
                        for (acc, live) in by_step.iter_mut().zip(liveness.window(first, last)) {
                            if *live {
                                *acc += bytes;
                            }
                        }
                    }
                    by_step.into_iter().max().unwrap_or(0)
                })
                .collect()
        });
        peaks.into()
    }

    pub fn memory(&self) -> MemoryBreakdown {
        MemoryBreakdown::new(
            self.max_vars_usage(),
            self.code_bytes_by_tile(),
            self.vertex_state_bytes_by_tile(),
            self.exchange_code_by_tile(),
            self.control_code_by_tile(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layers::NamingConfig,
        operation::OperationList,
        solver::{GreedySolver, SolverConfig},
        synthetic::{transformer_profile, ProfileBuilder},
    };

    /// Two tiles, three layers sharing vertex type "Mul".
    fn setup() -> (AnalysisContext, OperationList) {
        let mut b = ProfileBuilder::new(2);
        b.vertex_type("Mul", &[100, 200]).vertex_type("Add", &[10, 20]);
        let always = b.equivalence_class(&[(0, 6)]);
        let early = b.equivalence_class(&[(1, 3)]);
        let late = b.equivalence_class(&[(3, 5)]);
        let embedding = b.variable(1000, 0, always);
        let w0 = b.variable(40, 0, always);
        let a0 = b.variable(30, 1, early);
        let a1 = b.variable(50, 1, late);

        b.operation("Embedding").compute("Add", 4, &[1, 0]).uses(&[embedding]);
        b.operation("Layer0/Mul")
            .compute("Mul", 8, &[2, 1])
            .control(&[5, 5])
            .uses(&[w0, a0]);
        b.operation("Layer0/Send").exchange(&[7, 0]).uses(&[a0]);
        b.operation("Layer1/Mul")
            .compute("Mul", 8, &[1, 1])
            .control(&[5, 5])
            .uses(&[a1]);
        b.operation("Layer2/Add").compute("Add", 4, &[0, 3]).uses(&[a1]);
        b.operation("Loss").exchange(&[1, 1]);
        let profile = b.build();
        OperationList::analyse(&profile, &NamingConfig::default(), 2).unwrap()
    }

    fn stage_of<'a>(ctx: &'a AnalysisContext, list: &'a OperationList, layers: &[&str]) -> Stage<'a> {
        let mut stage = Stage::new(ctx);
        for op in list.iter() {
            if op.layer().as_deref().map_or(false, |l| layers.contains(&l)) {
                stage.add(op);
            }
        }
        stage
    }

    #[test]
    fn queries_are_idempotent() {
        let (ctx, list) = setup();
        let stage = stage_of(&ctx, &list, &["0", "1"]);
        assert_eq!(stage.memory(), stage.memory());
        assert_eq!(stage.exchange_code_by_tile(), vec![7, 0].into());
        assert_eq!(stage.control_code_by_tile(), vec![10, 10].into());
        assert_eq!(stage.vertex_state_bytes_by_tile(), vec![24, 16].into());
    }

    #[test]
    fn shared_vertex_code_counted_once() {
        let (ctx, list) = setup();
        let a = stage_of(&ctx, &list, &["0"]).code_bytes_by_tile();
        let b = stage_of(&ctx, &list, &["1"]).code_bytes_by_tile();
        let both = stage_of(&ctx, &list, &["0", "1"]).code_bytes_by_tile();
        assert_eq!(a, vec![100, 200].into());
        assert_eq!(b, vec![100, 200].into());
        assert_eq!(both, vec![100, 200].into());

        let all = stage_of(&ctx, &list, &["0", "1", "2"]).code_bytes_by_tile();
        // "Add" only has instances on tile 1.
        assert_eq!(all, vec![100, 220].into());
    }

    #[test]
    fn variable_peak_follows_liveness() {
        let (ctx, list) = setup();
        let stage = stage_of(&ctx, &list, &["0", "1", "2"]);
        assert_eq!(stage.first_step_index(), Some(1));
        assert_eq!(stage.last_step_index(), Some(4));
        // Tile 1: a0 live over [1, 3), a1 over [3, 5), never together.
        assert_eq!(stage.max_vars_usage(), vec![40, 50].into());
    }

    #[test]
    fn memory_grows_with_layers() {
        let (ctx, list) = setup();
        let mut previous = TileBytes::zeros(2);
        for end in 1..=3 {
            let layers = ["0", "1", "2"];
            let total = stage_of(&ctx, &list, &layers[..end]).memory().total_mem;
            for tile in 0..2 {
                assert!(total[tile] >= previous[tile]);
            }
            previous = total;
        }
    }

    #[test]
    fn transformer_memory_grows_from_every_start() {
        let (ctx, list) =
            OperationList::analyse(&transformer_profile(), &NamingConfig::default(), 4).unwrap();
        let solver = GreedySolver::new(&ctx, &list, SolverConfig::default());
        let layers = solver.layers();
        for from in 0..layers.len() {
            let mut previous = TileBytes::zeros(ctx.num_tiles());
            for to in from..layers.len() {
                let total = solver.memory_for_layers(Some(&layers[from..=to])).total_mem;
                for tile in 0..ctx.num_tiles() {
                    assert!(total[tile] >= previous[tile], "layers {from}..={to}, tile {tile}");
                }
                previous = total;
            }
        }
    }

    #[test]
    fn repeated_context_keeps_span_open() {
        let mut b = ProfileBuilder::new(1);
        let live = b.equivalence_class(&[(0, 3)]);
        let small = b.variable(10, 0, live);
        let big = b.variable(500, 0, live);
        let shared = b
            .operation("Layer0/Shared")
            .exchange(&[1])
            .uses(&[small])
            .context_id();
        b.operation("Layer1/Big").exchange(&[2]).uses(&[big]);
        b.repeat_operation("Layer1/Shared", shared);
        let (ctx, list) = OperationList::analyse(&b.build(), &NamingConfig::default(), 1).unwrap();

        let stage = stage_of(&ctx, &list, &["1"]);
        assert_eq!(stage.first_step_index(), Some(1));
        assert_eq!(stage.last_step_index(), Some(1));
        assert_eq!(stage.max_vars_usage(), vec![510].into());

        let outcome = GreedySolver::new(&ctx, &list, SolverConfig::default()).solve(2, 100);
        assert!(!outcome.success);
    }

    #[test]
    fn first_step_locks_onto_first_layer_operation() {
        let (ctx, list) = setup();
        let mut stage = Stage::new(&ctx);
        for op in list.iter() {
            stage.add(op);
        }
        assert_eq!(stage.first_step_index(), Some(1));
        assert_eq!(stage.last_step_index(), Some(5));
        // The embedding table is used outside any layer.
        assert!(!stage.used_vars().contains(&0));
        assert_eq!(stage.max_vars_usage(), vec![40, 50].into());
    }

    #[test]
    fn adding_invalidates_vertex_counts() {
        let (ctx, list) = setup();
        let mut stage = Stage::new(&ctx);
        stage.add(list.get(1).unwrap());
        assert_eq!(stage.vertex_state_bytes_by_tile(), vec![16, 8].into());
        stage.add(list.get(4).unwrap());
        assert_eq!(stage.vertex_state_bytes_by_tile(), vec![16, 20].into());
    }

    #[test]
    fn empty_stage_has_no_memory() {
        let (ctx, _) = setup();
        let stage = Stage::new(&ctx);
        assert!(stage.is_empty());
        assert_eq!(stage.memory().total_mem, TileBytes::zeros(2));
    }
}

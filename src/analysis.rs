//! Static analysis tables and the context shared by every stage query.
//!
//! The tables are expensive to derive from a profile and never change
//! afterwards. [`AnalysisContext`] owns them together with the program cache
//! and the memoization caches of [`crate::stage::Stage`], and is handed out
//! by shared reference once built.

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AnalysisError, AnalysisResult},
    memory::TileBytes,
    profile::{EquivalenceClassId, ProgramId, RawProfile, RawProgram, StepInterval, VarId},
    program::Program,
};

pub const DEFAULT_THREADS: usize = 8;

/// Brief description of a lowered variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoweredVar {
    pub equivalence_class: EquivalenceClassId,
    pub bytes: u64,
    pub tile: usize,
}

/// Liveness bitmap of an equivalence class, one entry per step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liveness {
    live: Vec<bool>,
    intervals: Vec<StepInterval>,
}

impl Liveness {
    pub fn from_intervals(
        id: EquivalenceClassId,
        intervals: &[StepInterval],
        num_steps: usize,
    ) -> AnalysisResult<Self> {
        let mut live = vec![false; num_steps];
        for interval in intervals {
            if interval.end > num_steps {
                return Err(AnalysisError::StepOutOfRange {
                    what: format!("equivalence class {id}"),
                    step: interval.end,
                    num_steps,
                });
            }
            for step in interval.start..interval.end {
                live[step] = true;
            }
        }
        Ok(Self {
            live,
            intervals: intervals.to_vec(),
        })
    }

    pub fn is_live(&self, step: usize) -> bool {
        self.live.get(step).copied().unwrap_or(false)
    }

    /// Inclusive `[first, last]` window of the bitmap.
    pub fn window(&self, first: usize, last: usize) -> &[bool] {
        &self.live[first..=last]
    }

    /// Live intervals as recorded in the profile. Adjacent intervals are
    /// kept apart even though the bitmap joins them.
    pub fn intervals(&self) -> &[StepInterval] {
        &self.intervals
    }
}

/// Immutable tables derived once per profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTables {
    pub num_tiles: usize,
    pub step_ids: Vec<ProgramId>,
    /// Code size of every vertex type on every tile.
    pub code_bytes_by_type: BTreeMap<String, Vec<u64>>,
    pub lowered_vars: HashMap<VarId, LoweredVar>,
    pub equivalence_classes: HashMap<EquivalenceClassId, Liveness>,
}

impl AnalysisTables {
    pub fn build(profile: &RawProfile) -> AnalysisResult<Self> {
        let num_tiles = profile.num_tiles;
        let step_ids = profile.steps.clone();
        let num_steps = step_ids.len();

        log::info!("Loading vertex code size data...");
        if profile.tiles.len() != num_tiles {
            return Err(AnalysisError::TileCountMismatch {
                what: "tile table".to_string(),
                expected: num_tiles,
                found: profile.tiles.len(),
            });
        }
        let mut code_bytes_by_type: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (i, tile) in profile.tiles.iter().enumerate() {
            for vertex in &tile.vertices {
                code_bytes_by_type
                    .entry(vertex.type_name.clone())
                    .or_insert_with(|| vec![0; num_tiles])[i] = vertex.code_bytes;
            }
        }

        log::info!("Loading lowered variables data...");
        let raw_vars = profile
            .lowered_variables
            .as_ref()
            .ok_or(AnalysisError::MissingLivenessData)?;
        let raw_classes: HashMap<_, _> = profile
            .equivalence_classes
            .iter()
            .map(|class| (class.id, class))
            .collect();

        let mut lowered_vars = HashMap::with_capacity(raw_vars.len());
        let mut equivalence_classes = HashMap::new();
        for var in raw_vars {
            if var.tile >= num_tiles {
                return Err(AnalysisError::TileOutOfRange {
                    variable: var.id,
                    tile: var.tile,
                    num_tiles,
                });
            }
            lowered_vars.entry(var.id).or_insert(LoweredVar {
                equivalence_class: var.equivalence_class,
                bytes: var.bytes,
                tile: var.tile,
            });
            if !equivalence_classes.contains_key(&var.equivalence_class) {
                let class = raw_classes
                    .get(&var.equivalence_class)
                    .ok_or(AnalysisError::UnknownEquivalenceClass(var.equivalence_class))?;
                equivalence_classes.insert(
                    class.id,
                    Liveness::from_intervals(class.id, &class.intervals, num_steps)?,
                );
            }
        }
        log::info!(
            "Tiles: {num_tiles} - Steps: {num_steps} - Lowered variables: {} - Equivalence classes: {}",
            lowered_vars.len(),
            equivalence_classes.len()
        );

        Ok(Self {
            num_tiles,
            step_ids,
            code_bytes_by_type,
            lowered_vars,
            equivalence_classes,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.step_ids.len()
    }

    pub fn lowered_var(&self, id: VarId) -> AnalysisResult<&LoweredVar> {
        self.lowered_vars
            .get(&id)
            .ok_or(AnalysisError::UnknownVariable(id))
    }

    pub fn liveness(&self, id: EquivalenceClassId) -> AnalysisResult<&Liveness> {
        self.equivalence_classes
            .get(&id)
            .ok_or(AnalysisError::UnknownEquivalenceClass(id))
    }
}

/// Key of the variable usage memo: the variables plus the step window
/// they are evaluated over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct VarUsageKey {
    pub vars: Box<[VarId]>,
    pub first_step: usize,
    pub last_step: usize,
}

type Memo<K> = Mutex<HashMap<K, Arc<OnceLock<TileBytes>>>>;

#[derive(Default)]
struct MemoCaches {
    exchange_code: Memo<Box<[ProgramId]>>,
    control_code: Memo<Box<[ProgramId]>>,
    vars_usage: Memo<VarUsageKey>,
}

/// Looks up `key`, computing the value exactly once on a miss. The map lock
/// is not held while computing.
fn memoized<K: Hash + Eq>(memo: &Memo<K>, key: K, compute: impl FnOnce() -> TileBytes) -> TileBytes {
    let cell = {
        let mut guard = memo.lock().unwrap_or_else(PoisonError::into_inner);
        guard.entry(key).or_default().clone()
    };
    cell.get_or_init(compute).clone()
}

fn memo_len<K>(memo: &Memo<K>) -> usize {
    memo.lock().unwrap_or_else(PoisonError::into_inner).len()
}

pub struct AnalysisContext {
    tables: AnalysisTables,
    programs: HashMap<ProgramId, Program>,
    caches: MemoCaches,
    pool: ThreadPool,
}

impl AnalysisContext {
    pub fn new(tables: AnalysisTables, threads: usize) -> AnalysisResult<Self> {
        let pool = ThreadPoolBuilder::new().num_threads(threads).build()?;
        Ok(Self {
            tables,
            programs: HashMap::new(),
            caches: MemoCaches::default(),
            pool,
        })
    }

    pub fn tables(&self) -> &AnalysisTables {
        &self.tables
    }

    pub fn num_tiles(&self) -> usize {
        self.tables.num_tiles
    }

    pub(crate) fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Adds a program to the cache unless it is already known.
    pub fn register_program(&mut self, raw: &RawProgram) -> AnalysisResult<()> {
        if !self.programs.contains_key(&raw.id) {
            let program = Program::from_raw(raw, self.tables.num_tiles)?;
            self.programs.insert(raw.id, program);
        }
        Ok(())
    }

    pub(crate) fn insert_program(&mut self, program: Program) {
        self.programs.entry(program.id).or_insert(program);
    }

    pub fn program(&self, id: ProgramId) -> Option<&Program> {
        self.programs.get(&id)
    }

    pub fn programs(&self) -> impl Iterator<Item = &Program> {
        self.programs.values()
    }

    pub fn num_programs(&self) -> usize {
        self.programs.len()
    }

    pub(crate) fn exchange_code(
        &self,
        key: Box<[ProgramId]>,
        compute: impl FnOnce() -> TileBytes,
    ) -> TileBytes {
        memoized(&self.caches.exchange_code, key, compute)
    }

    pub(crate) fn control_code(
        &self,
        key: Box<[ProgramId]>,
        compute: impl FnOnce() -> TileBytes,
    ) -> TileBytes {
        memoized(&self.caches.control_code, key, compute)
    }

    pub(crate) fn vars_usage(
        &self,
        key: VarUsageKey,
        compute: impl FnOnce() -> TileBytes,
    ) -> TileBytes {
        memoized(&self.caches.vars_usage, key, compute)
    }

    /// Number of memoized entries as (exchange, control, variables).
    pub fn cache_sizes(&self) -> (usize, usize, usize) {
        (
            memo_len(&self.caches.exchange_code),
            memo_len(&self.caches.control_code),
            memo_len(&self.caches.vars_usage),
        )
    }
}

/// Guards that static analysis runs at most once until reset.
pub struct AnalysisSession {
    context: Option<AnalysisContext>,
    threads: usize,
}

impl Default for AnalysisSession {
    fn default() -> Self {
        Self::new(DEFAULT_THREADS)
    }
}

impl AnalysisSession {
    pub fn new(threads: usize) -> Self {
        Self {
            context: None,
            threads,
        }
    }

    pub fn analyse(&mut self, profile: &RawProfile) -> AnalysisResult<&mut AnalysisContext> {
        if self.context.is_some() {
            return Err(AnalysisError::Reanalysis);
        }
        let tables = AnalysisTables::build(profile)?;
        Ok(self.context.insert(AnalysisContext::new(tables, self.threads)?))
    }

    /// Installs previously exported tables instead of analysing a profile.
    pub fn restore(&mut self, tables: AnalysisTables) -> AnalysisResult<&mut AnalysisContext> {
        if self.context.is_some() {
            return Err(AnalysisError::Reanalysis);
        }
        Ok(self.context.insert(AnalysisContext::new(tables, self.threads)?))
    }

    pub fn reset(&mut self) {
        self.context = None;
    }

    pub fn context(&self) -> Option<&AnalysisContext> {
        self.context.as_ref()
    }

    pub fn into_context(self) -> Option<AnalysisContext> {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::ProfileBuilder;

    fn small_profile() -> RawProfile {
        let mut builder = ProfileBuilder::new(2);
        let class = builder.equivalence_class(&[(0, 2)]);
        let var = builder.variable(100, 1, class);
        builder.vertex_type("A", &[50, 60]).vertex_type("B", &[5, 6]);
        builder.operation("Layer0/Op").compute("A", 4, &[1, 1]).uses(&[var]);
        builder.operation("Layer0/Op2").compute("B", 4, &[0, 1]);
        builder.build()
    }

    #[test]
    fn tables_from_profile() {
        let tables = AnalysisTables::build(&small_profile()).unwrap();
        assert_eq!(tables.num_tiles, 2);
        assert_eq!(tables.num_steps(), 2);
        assert_eq!(tables.code_bytes_by_type["A"], vec![50, 60]);
        let var = tables.lowered_vars.values().next().unwrap();
        assert_eq!(var.bytes, 100);
        assert_eq!(var.tile, 1);
        let live = tables.liveness(var.equivalence_class).unwrap();
        assert!(live.is_live(0) && live.is_live(1));
    }

    #[test]
    fn reanalysis_fails_until_reset() {
        let profile = small_profile();
        let mut session = AnalysisSession::new(2);
        session.analyse(&profile).unwrap();
        assert!(matches!(
            session.analyse(&profile),
            Err(AnalysisError::Reanalysis)
        ));
        session.reset();
        assert!(session.analyse(&profile).is_ok());
    }

    #[test]
    fn missing_lowered_variables() {
        let mut profile = small_profile();
        profile.lowered_variables = None;
        assert!(matches!(
            AnalysisTables::build(&profile),
            Err(AnalysisError::MissingLivenessData)
        ));
    }

    #[test]
    fn variable_on_unknown_tile() {
        let mut profile = small_profile();
        profile.lowered_variables.as_mut().unwrap()[0].tile = 5;
        assert!(matches!(
            AnalysisTables::build(&profile),
            Err(AnalysisError::TileOutOfRange { tile: 5, .. })
        ));
    }

    #[test]
    fn liveness_intervals_round_trip() {
        let intervals = [
            StepInterval { start: 1, end: 3 },
            StepInterval { start: 5, end: 6 },
            StepInterval { start: 8, end: 10 },
        ];
        let live = Liveness::from_intervals(0, &intervals, 10).unwrap();
        assert_eq!(live.intervals(), &intervals);
        assert_eq!(live.window(2, 5), &[true, false, false, true]);
        assert!(Liveness::from_intervals(0, &intervals, 9).is_err());
    }

    #[test]
    fn adjacent_intervals_stay_separate() {
        let intervals = [
            StepInterval { start: 1, end: 3 },
            StepInterval { start: 3, end: 5 },
        ];
        let live = Liveness::from_intervals(0, &intervals, 6).unwrap();
        assert_eq!(live.intervals(), &intervals);
        assert_eq!(live.window(1, 5), &[true, true, true, true, false]);
    }

    #[test]
    fn memo_computes_once() {
        let tables = AnalysisTables::build(&small_profile()).unwrap();
        let ctx = AnalysisContext::new(tables, 1).unwrap();
        let key: Box<[ProgramId]> = vec![1, 2].into_boxed_slice();
        let first = ctx.control_code(key.clone(), || vec![1, 2].into());
        let second = ctx.control_code(key, || panic!("recomputed"));
        assert_eq!(first, second);
        assert_eq!(ctx.cache_sizes(), (0, 1, 0));
    }
}

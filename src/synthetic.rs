//! Builders for small, fully deterministic profiles.
//!
//! Every program added to an operation occupies the next step of the
//! timeline, so step indices follow directly from construction order.

use std::collections::BTreeMap;

use crate::profile::{
    DebugContextId, EquivalenceClassId, ProgramId, ProgramKind, RawDebugContext,
    RawEquivalenceClass, RawOperation, RawProfile, RawProgram, RawTile, RawTileVertex,
    RawVariable, RawVertexCount, StepInterval, VarId,
};

pub struct ProfileBuilder {
    num_tiles: usize,
    steps: Vec<ProgramId>,
    vertex_code: BTreeMap<String, Vec<u64>>,
    programs: Vec<RawProgram>,
    variables: Vec<RawVariable>,
    classes: Vec<RawEquivalenceClass>,
    operations: Vec<RawOperation>,
    next_context: DebugContextId,
}

impl ProfileBuilder {
    pub fn new(num_tiles: usize) -> Self {
        Self {
            num_tiles,
            steps: Vec::new(),
            vertex_code: BTreeMap::new(),
            programs: Vec::new(),
            variables: Vec::new(),
            classes: Vec::new(),
            operations: Vec::new(),
            next_context: 0,
        }
    }

    pub fn num_tiles(&self) -> usize {
        self.num_tiles
    }

    /// Step the next program will be scheduled at.
    pub fn next_step(&self) -> usize {
        self.steps.len()
    }

    /// Code size of a vertex type on every tile.
    pub fn vertex_type(&mut self, name: &str, code_bytes_by_tile: &[u64]) -> &mut Self {
        self.vertex_code
            .insert(name.to_string(), code_bytes_by_tile.to_vec());
        self
    }

    /// Registers an equivalence class live over the half-open step ranges.
    pub fn equivalence_class(&mut self, intervals: &[(usize, usize)]) -> EquivalenceClassId {
        let id = self.classes.len() as EquivalenceClassId;
        self.classes.push(RawEquivalenceClass {
            id,
            intervals: intervals
                .iter()
                .map(|&(start, end)| StepInterval { start, end })
                .collect(),
        });
        id
    }

    pub fn variable(&mut self, bytes: u64, tile: usize, class: EquivalenceClassId) -> VarId {
        let id = self.variables.len() as VarId;
        self.variables.push(RawVariable {
            id,
            bytes,
            tile,
            equivalence_class: class,
        });
        id
    }

    pub fn operation(&mut self, name: &str) -> OperationBuilder<'_> {
        let id = self.next_context;
        self.next_context += 1;
        self.push_operation(name, id)
    }

    /// Another occurrence of an already recorded debug context.
    pub fn repeat_operation(&mut self, name: &str, context: DebugContextId) -> OperationBuilder<'_> {
        self.push_operation(name, context)
    }

    fn push_operation(&mut self, name: &str, context: DebugContextId) -> OperationBuilder<'_> {
        let step = self.steps.len().saturating_sub(1);
        self.operations.push(RawOperation {
            name: name.to_string(),
            debug_context: RawDebugContext {
                id: context,
                json: String::new(),
            },
            first_step_index: step,
            last_step_index: step,
            programs: Vec::new(),
            variables: Vec::new(),
        });
        let index = self.operations.len() - 1;
        OperationBuilder {
            builder: self,
            index,
        }
    }

    pub fn build(self) -> RawProfile {
        let tiles = (0..self.num_tiles)
            .map(|tile| RawTile {
                vertices: self
                    .vertex_code
                    .iter()
                    .map(|(name, code)| RawTileVertex {
                        type_name: name.clone(),
                        code_bytes: code[tile],
                    })
                    .collect(),
            })
            .collect();
        RawProfile {
            num_tiles: self.num_tiles,
            steps: self.steps,
            tiles,
            programs: self.programs,
            lowered_variables: Some(self.variables),
            equivalence_classes: self.classes,
            operations: self.operations,
        }
    }
}

pub struct OperationBuilder<'a> {
    builder: &'a mut ProfileBuilder,
    index: usize,
}

impl OperationBuilder<'_> {
    fn op(&mut self) -> &mut RawOperation {
        &mut self.builder.operations[self.index]
    }

    fn schedule(mut self, program: RawProgram) -> Self {
        let id = program.id;
        let step = self.builder.steps.len();
        self.builder.steps.push(id);
        self.builder.programs.push(program);
        let is_first = self.op().programs.is_empty();
        let op = self.op();
        if is_first {
            op.first_step_index = step;
        }
        op.last_step_index = step;
        op.programs.push(id);
        self
    }

    fn new_program(&self, kind: ProgramKind) -> RawProgram {
        RawProgram {
            id: self.builder.programs.len() as ProgramId,
            kind,
            children: Vec::new(),
            control_code_by_tile: vec![0; self.builder.num_tiles],
            code_bytes_by_tile: Vec::new(),
            vertices: Vec::new(),
        }
    }

    /// Adds a compute program running `counts` instances of a vertex type.
    pub fn compute(self, type_name: &str, type_size: u64, counts: &[u64]) -> Self {
        let mut program = self.new_program(ProgramKind::OnTileExecute);
        program.vertices.push(RawVertexCount {
            type_name: type_name.to_string(),
            type_size,
            count_by_tile: counts.to_vec(),
        });
        self.schedule(program)
    }

    /// Adds an exchange program with the given code size per tile.
    pub fn exchange(self, code_bytes_by_tile: &[u64]) -> Self {
        let mut program = self.new_program(ProgramKind::DoExchange);
        program.code_bytes_by_tile = code_bytes_by_tile.to_vec();
        self.schedule(program)
    }

    /// Sets the control code of the most recently added program.
    pub fn control(self, control_code_by_tile: &[u64]) -> Self {
        if let Some(program) = self.builder.programs.last_mut() {
            program.control_code_by_tile = control_code_by_tile.to_vec();
        }
        self
    }

    /// Schedules an already created program again.
    pub fn reuse(mut self, program: ProgramId) -> Self {
        let step = self.builder.steps.len();
        self.builder.steps.push(program);
        let is_first = self.op().programs.is_empty();
        let op = self.op();
        if is_first {
            op.first_step_index = step;
        }
        op.last_step_index = step;
        op.programs.push(program);
        self
    }

    pub fn uses(mut self, vars: &[VarId]) -> Self {
        self.op().variables.extend_from_slice(vars);
        self
    }

    pub fn inputs(mut self, inputs: &[&str]) -> Self {
        let json = serde_json::json!({ "inputs": inputs }).to_string();
        self.op().debug_context.json = json;
        self
    }

    pub fn last_program(&self) -> Option<ProgramId> {
        self.builder.operations[self.index].programs.last().copied()
    }

    pub fn context_id(&self) -> DebugContextId {
        self.builder.operations[self.index].debug_context.id
    }
}

/// A 24 layer model with a short preamble and postamble, 450 operations and
/// four identical tiles.
///
/// Per tile, each layer costs 13000 bytes on top of its stage's fixed
/// vertex code and activation peak:
/// - 17 compute operations of 2 instances of a 8 byte vertex, 100 bytes
///   control code each, cycling through three vertex types of 2000 bytes
///   code,
/// - one exchange operation with 300 bytes of code and 100 bytes control,
/// - a 10628 byte weight live for the whole program and a 5000 byte
///   activation live only while the layer executes.
///
/// The preamble has 10 embedding operations (1000 bytes of shared vertex
/// code, 8 bytes of state, 50 bytes control each), the postamble 8 exchange
/// operations (200 bytes code, 50 bytes control each).
pub fn transformer_profile() -> RawProfile {
    const TILES: usize = 4;
    const LAYERS: usize = 24;
    const OPS_PER_LAYER: usize = 18;
    const PREAMBLE: usize = 10;
    const POSTAMBLE: usize = 8;
    const NUM_STEPS: usize = PREAMBLE + LAYERS * OPS_PER_LAYER + POSTAMBLE;

    let tiles = |v: u64| vec![v; TILES];
    let mut b = ProfileBuilder::new(TILES);
    b.vertex_type("EmbeddingLookup", &tiles(1000));
    for k in 0..3 {
        b.vertex_type(&format!("LayerVertex{k}"), &tiles(2000));
    }

    let always = b.equivalence_class(&[(0, NUM_STEPS)]);
    let embedding_class = b.equivalence_class(&[(0, PREAMBLE)]);
    let embedding_table: Vec<VarId> = (0..TILES)
        .map(|tile| b.variable(9000, tile, embedding_class))
        .collect();

    for k in 0..PREAMBLE {
        b.operation(&format!("Embedding/Lookup{k}"))
            .inputs(&["input_ids"])
            .compute("EmbeddingLookup", 8, &tiles(1))
            .control(&tiles(50))
            .uses(&embedding_table);
    }

    for layer in 0..LAYERS {
        let start = b.next_step();
        let activation_class = b.equivalence_class(&[(start, start + OPS_PER_LAYER)]);
        let weights: Vec<VarId> = (0..TILES)
            .map(|tile| b.variable(10628, tile, always))
            .collect();
        let activations: Vec<VarId> = (0..TILES)
            .map(|tile| b.variable(5000, tile, activation_class))
            .collect();
        for k in 0..OPS_PER_LAYER - 1 {
            let mut op = b
                .operation(&format!("Layer{layer}/Op{k}"))
                .compute(&format!("LayerVertex{}", k % 3), 8, &tiles(2))
                .control(&tiles(100));
            if k == 0 {
                op = op.uses(&weights);
            }
            if k == 1 {
                op.uses(&activations);
            }
        }
        b.operation(&format!("Layer{layer}/Exchange"))
            .exchange(&tiles(300))
            .control(&tiles(100));
    }

    for k in 0..POSTAMBLE {
        b.operation(&format!("Loss/Exchange{k}"))
            .exchange(&tiles(200))
            .control(&tiles(50));
    }

    // Debug contexts that never generated a program.
    for k in 0..6 {
        b.operation(&format!("Optimizer/Noop{k}"));
    }

    b.build()
}

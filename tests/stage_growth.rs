use proptest::prelude::*;
use stagefit::{
    layers::NamingConfig, profile::RawProfile, synthetic::ProfileBuilder, GreedySolver,
    OperationList, SolverConfig,
};

/// One single-step layer per entry: a variable of `bytes` on `tile` live for
/// `span` steps, optionally followed by another occurrence of an earlier
/// layer's operation under this layer's name.
#[derive(Debug, Clone)]
struct LayerSpec {
    bytes: u64,
    tile: usize,
    span: usize,
    repeat: Option<usize>,
}

const TILES: usize = 2;

fn layer_specs() -> impl Strategy<Value = Vec<LayerSpec>> {
    prop::collection::vec(
        (1u64..1000, 0..TILES, 1usize..4, prop::option::of(0usize..8)).prop_map(
            |(bytes, tile, span, repeat)| LayerSpec {
                bytes,
                tile,
                span,
                repeat,
            },
        ),
        2..8,
    )
}

fn layered_profile(specs: &[LayerSpec]) -> RawProfile {
    let num_steps = specs.len();
    let mut b = ProfileBuilder::new(TILES);
    let mut contexts = Vec::new();
    for (i, spec) in specs.iter().enumerate() {
        let class = b.equivalence_class(&[(i, (i + spec.span).min(num_steps))]);
        let var = b.variable(spec.bytes, spec.tile, class);
        let context = b
            .operation(&format!("layer{i}/Dense"))
            .exchange(&[1; TILES])
            .uses(&[var])
            .context_id();
        if let Some(j) = spec.repeat.filter(|_| i > 0) {
            b.repeat_operation(&format!("layer{i}/Shared"), contexts[j % i]);
        }
        contexts.push(context);
    }
    b.build()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn memory_grows_with_every_added_layer(specs in layer_specs()) {
        let (ctx, operations) =
            OperationList::analyse(&layered_profile(&specs), &NamingConfig::default(), 1).unwrap();
        let solver = GreedySolver::new(&ctx, &operations, SolverConfig::default());
        let layers = solver.layers();
        prop_assert_eq!(layers.len(), specs.len());

        for from in 0..layers.len() {
            let mut previous = vec![0u64; TILES];
            for to in from..layers.len() {
                let total = solver.memory_for_layers(Some(&layers[from..=to])).total_mem;
                for (tile, before) in previous.iter().enumerate() {
                    prop_assert!(total[tile] >= *before, "layers {}..={} tile {}", from, to, tile);
                }
                previous = total.as_slice().to_vec();
            }
        }
    }

    #[test]
    fn layer_counts_its_own_variable(specs in layer_specs()) {
        let (ctx, operations) =
            OperationList::analyse(&layered_profile(&specs), &NamingConfig::default(), 1).unwrap();
        let solver = GreedySolver::new(&ctx, &operations, SolverConfig::default());
        for (layer, spec) in solver.layers().iter().zip(&specs) {
            let stage = solver.stage_for_layers(Some(std::slice::from_ref(layer)));
            prop_assert!(stage.first_step_index() <= stage.last_step_index());
            prop_assert!(stage.max_vars_usage()[spec.tile] >= spec.bytes);
        }
    }
}

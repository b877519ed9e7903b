//! Pairwise variable sharing between layers.
//!
//! Neither matrix is used by the solver. They help judge where a model can
//! be cut: affinity shows variables two layers both touch, exchange shows
//! variables produced in one layer and consumed by another.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::{
    analysis::AnalysisContext,
    layers::Layer,
    operation::NamedRef,
    profile::VarId,
    stage::Stage,
};

/// A maximal run of operations of one layer. Operations outside any layer
/// stay in the block they follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBlock {
    pub layer: Layer,
    /// Half-open range of operations.
    pub op_from: usize,
    pub op_to: usize,
    /// First step and the step the next block starts at.
    pub steps: (usize, usize),
    pub vars: BTreeSet<VarId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerMatrix {
    pub labels: Vec<Layer>,
    /// `values[i][j]` in bytes.
    pub values: Vec<Vec<u64>>,
}

fn block_ends(operations: &[NamedRef<'_>]) -> Vec<usize> {
    let Some(first) = operations.first() else {
        return Vec::new();
    };
    let mut ends = Vec::new();
    let mut previous = first.layer();
    for (i, op) in operations.iter().enumerate().skip(1) {
        if op.layer().is_some() && op.layer() != previous {
            previous = op.layer();
            ends.push(i);
        }
    }
    ends.push(operations.len());
    ends
}

pub fn layer_blocks(ctx: &AnalysisContext, operations: &[NamedRef<'_>]) -> Vec<LayerBlock> {
    let mut blocks = Vec::new();
    let mut op_from = 0;
    for op_to in block_ends(operations) {
        let mut stage = Stage::new(ctx);
        for op in &operations[op_from..op_to] {
            stage.add(*op);
        }
        // Approximate: the block is taken to last until the next one starts.
        let end_step = match operations.get(op_to) {
            Some(next) => next.operation.first_step_index,
            None => operations[op_to - 1].operation.last_step_index,
        };
        let steps = (operations[op_from].operation.first_step_index, end_step);
        log::info!("Operations: [{op_from}, {op_to}) - Steps: [{}, {})", steps.0, steps.1);
        blocks.push(LayerBlock {
            layer: operations[op_from].layer().clone(),
            op_from,
            op_to,
            steps,
            vars: stage.used_vars().clone(),
        });
        op_from = op_to;
    }
    blocks
}

fn matrix(
    ctx: &AnalysisContext,
    blocks: &[LayerBlock],
    include: impl Fn(VarId, &LayerBlock, &LayerBlock) -> bool,
) -> LayerMatrix {
    let tables = ctx.tables();
    let values: Vec<Vec<u64>> = blocks
        .iter()
        .map(|a| {
            blocks
                .iter()
                .map(|b| {
                    a.vars
                        .intersection(&b.vars)
                        .filter(|id| include(**id, a, b))
                        .filter_map(|id| tables.lowered_var(*id).ok())
                        .map(|var| var.bytes)
                        .sum()
                })
                .collect()
        })
        .collect();
    LayerMatrix {
        labels: blocks.iter().map(|b| b.layer.clone()).collect(),
        values,
    }
}

/// Bytes of the variables used by both layers of every pair.
pub fn memory_affinity(ctx: &AnalysisContext, operations: &[NamedRef<'_>]) -> LayerMatrix {
    let blocks = layer_blocks(ctx, operations);
    matrix(ctx, &blocks, |_, _, _| true)
}

/// Bytes of the variables that go live in the row layer and die in the
/// column layer.
pub fn interlayer_exchange(ctx: &AnalysisContext, operations: &[NamedRef<'_>]) -> LayerMatrix {
    let blocks = layer_blocks(ctx, operations);
    let tables = ctx.tables();
    matrix(ctx, &blocks, |id, from, to| {
        let Ok(var) = tables.lowered_var(id) else {
            return false;
        };
        let Ok(liveness) = tables.liveness(var.equivalence_class) else {
            return false;
        };
        liveness.intervals().iter().any(|interval| {
            interval.start >= from.steps.0
                && interval.start <= from.steps.1
                && interval.end >= to.steps.0
                && interval.end < to.steps.1
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layers::NamingConfig, operation::OperationList, synthetic::ProfileBuilder};

    fn setup() -> (AnalysisContext, OperationList) {
        let mut b = ProfileBuilder::new(1);
        let always = b.equivalence_class(&[(0, 5)]);
        let handoff = b.equivalence_class(&[(1, 3)]);
        let weight = b.variable(100, 0, always);
        let activation = b.variable(8, 0, handoff);
        b.operation("Layer0/A").exchange(&[0]).uses(&[weight]);
        b.operation("Layer0/B").exchange(&[0]).uses(&[activation]);
        b.operation("Layer1/A").exchange(&[0]);
        b.operation("Layer1/B").exchange(&[0]).uses(&[activation]);
        b.operation("Layer2/A").exchange(&[0]).uses(&[weight]);
        OperationList::analyse(&b.build(), &NamingConfig::default(), 1).unwrap()
    }

    #[test]
    fn blocks_follow_layer_changes() {
        let (ctx, list) = setup();
        let ops: Vec<_> = list.iter().collect();
        let blocks = layer_blocks(&ctx, &ops);
        assert_eq!(blocks.len(), 3);
        assert_eq!((blocks[0].op_from, blocks[0].op_to), (0, 2));
        assert_eq!(blocks[0].steps, (0, 2));
        assert_eq!(blocks[1].steps, (2, 4));
        assert_eq!(blocks[2].steps, (4, 4));
    }

    #[test]
    fn affinity_counts_shared_variables() {
        let (ctx, list) = setup();
        let ops: Vec<_> = list.iter().collect();
        let affinity = memory_affinity(&ctx, &ops);
        assert_eq!(
            affinity.values,
            vec![vec![108, 8, 100], vec![8, 8, 0], vec![100, 0, 100]]
        );
        assert_eq!(affinity.labels[2], Some("2".to_string()));
    }

    #[test]
    fn exchange_is_directed() {
        let (ctx, list) = setup();
        let ops: Vec<_> = list.iter().collect();
        let exchange = interlayer_exchange(&ctx, &ops);
        assert_eq!(
            exchange.values,
            vec![vec![0, 8, 0], vec![0, 0, 0], vec![0, 0, 0]]
        );
    }

    #[test]
    fn exchange_ends_at_recorded_interval() {
        // Live over [1, 3) then [3, 5): the first interval hands over to
        // layer 1 even though the variable stays live past it.
        let mut b = ProfileBuilder::new(1);
        let split = b.equivalence_class(&[(1, 3), (3, 5)]);
        let carried = b.variable(16, 0, split);
        b.operation("Layer0/A").exchange(&[0]);
        b.operation("Layer0/B").exchange(&[0]).uses(&[carried]);
        b.operation("Layer1/A").exchange(&[0]).uses(&[carried]);
        b.operation("Layer1/B").exchange(&[0]);
        b.operation("Layer2/A").exchange(&[0]);
        b.operation("Layer2/B").exchange(&[0]).uses(&[carried]);
        let (ctx, list) = OperationList::analyse(&b.build(), &NamingConfig::default(), 1).unwrap();
        let ops: Vec<_> = list.iter().collect();

        let blocks = layer_blocks(&ctx, &ops);
        assert_eq!(blocks[1].steps, (2, 4));
        let exchange = interlayer_exchange(&ctx, &ops);
        assert_eq!(
            exchange.values,
            vec![vec![0, 16, 0], vec![0, 0, 0], vec![0, 0, 0]]
        );
    }

    #[test]
    fn no_operations_no_blocks() {
        let (ctx, _) = setup();
        assert!(layer_blocks(&ctx, &[]).is_empty());
    }
}

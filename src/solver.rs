//! Greedy split of the layer sequence into pipeline stages.
//!
//! Stages are grown one layer at a time until the next layer would exceed a
//! fraction of the per-tile budget. Small fractions are tried first so the
//! stages come out evenly filled, and larger minimum stage sizes are tried
//! before smaller ones. The first combination that fits in the device count
//! wins.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    analysis::AnalysisContext,
    layers::{order_layers, Layer},
    memory::{CategoryTotals, MemoryBreakdown},
    operation::{NamedRef, OperationList},
    stage::Stage,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Tried in order, the first is preferred.
    pub min_layers_per_stage: Vec<usize>,
    /// Tried in order for every minimum stage size.
    pub budget_fractions: Vec<f64>,
    /// Ignore operations outside any layer.
    pub layer_operations_only: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            min_layers_per_stage: vec![3, 2, 1],
            budget_fractions: vec![0.5, 0.6, 0.7, 0.8, 0.9, 1.0],
            layer_operations_only: false,
        }
    }
}

/// An inclusive range of layers with the memory of the stage holding them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub layer_from: Layer,
    pub layer_to: Layer,
    pub memory: MemoryBreakdown,
}

/// A split with its memory summed over tiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitTotals {
    pub layer_from: Layer,
    pub layer_to: Layer,
    pub mem: CategoryTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveOutcome {
    /// On failure, the splits of the last combination tried.
    pub splits: Vec<Split>,
    pub success: bool,
    pub min_layers: Option<usize>,
    pub proportion: Option<f64>,
}

impl SolveOutcome {
    pub fn splits_totals(&self) -> Vec<SplitTotals> {
        self.splits
            .iter()
            .map(|split| SplitTotals {
                layer_from: split.layer_from.clone(),
                layer_to: split.layer_to.clone(),
                mem: split.memory.totals(),
            })
            .collect()
    }
}

pub struct GreedySolver<'a> {
    ctx: &'a AnalysisContext,
    operations: Vec<NamedRef<'a>>,
    layers: Vec<Layer>,
    config: SolverConfig,
}

impl<'a> GreedySolver<'a> {
    pub fn new(ctx: &'a AnalysisContext, list: &'a OperationList, config: SolverConfig) -> Self {
        let operations: Vec<NamedRef<'a>> = list
            .iter()
            .filter(|op| !config.layer_operations_only || op.is_in_layer())
            .collect();
        let layers = order_layers(operations.iter().map(|op| op.layer()), list.layer_order());
        Self {
            ctx,
            operations,
            layers,
            config,
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn operations(&self) -> &[NamedRef<'a>] {
        &self.operations
    }

    /// Stage of the operations belonging to `layers`, or of every operation.
    pub fn stage_for_layers(&self, layers: Option<&[Layer]>) -> Stage<'a> {
        let mut stage = Stage::new(self.ctx);
        match layers {
            None => {
                for op in &self.operations {
                    stage.add(*op);
                }
            }
            Some(layers) => {
                let wanted: HashSet<&Layer> = layers.iter().collect();
                for op in self.operations.iter().filter(|op| wanted.contains(op.layer())) {
                    stage.add(*op);
                }
            }
        }
        stage
    }

    /// Memory of the operations in `layers`. It is usually less than the
    /// sum over the individual layers since vertex code is shared.
    pub fn memory_for_layers(&self, layers: Option<&[Layer]>) -> MemoryBreakdown {
        self.stage_for_layers(layers).memory()
    }

    pub fn single_stage_memory(&self) -> MemoryBreakdown {
        self.memory_for_layers(None)
    }

    /// Largest run of layers starting at `layer_from` that fits in
    /// `capacity`, and its memory.
    fn calculate_stage(
        &self,
        layer_from: usize,
        capacity: f64,
        min_layers: usize,
    ) -> Option<(usize, MemoryBreakdown)> {
        let min_end = layer_from + min_layers.max(1) - 1;
        let mut best = None;
        for layer_to in min_end..self.layers.len() {
            let layers = &self.layers[layer_from..=layer_to];
            let memory = self.memory_for_layers(Some(layers));
            let peak = memory.max_tile_mem();
            let names = layers.iter().map(display_layer).collect::<Vec<_>>();
            if peak as f64 > capacity {
                log::debug!("{names:?} Peak: {} KB - OVERFLOW", peak / 1024);
                break;
            }
            log::debug!("{names:?} Peak: {} KB", peak / 1024);
            best = Some((layer_to, memory));
        }
        best
    }

    fn try_partition(
        &self,
        num_devices: usize,
        capacity: f64,
        min_layers: usize,
    ) -> Result<Vec<Split>, Vec<Split>> {
        let mut splits = Vec::new();
        let mut layer_from = 0;
        while layer_from < self.layers.len() {
            if splits.len() == num_devices {
                return Err(splits);
            }
            let Some((layer_to, memory)) = self.calculate_stage(layer_from, capacity, min_layers)
            else {
                return Err(splits);
            };
            splits.push(Split {
                layer_from: self.layers[layer_from].clone(),
                layer_to: self.layers[layer_to].clone(),
                memory,
            });
            layer_from = layer_to + 1;
        }
        Ok(splits)
    }

    /// Splits the layers over at most `num_devices` stages of
    /// `mem_per_tile` bytes per tile.
    pub fn solve(&self, num_devices: usize, mem_per_tile: u64) -> SolveOutcome {
        if self.operations.is_empty() {
            return SolveOutcome {
                splits: Vec::new(),
                success: true,
                min_layers: None,
                proportion: None,
            };
        }

        let mut splits = Vec::new();
        for &min_layers in &self.config.min_layers_per_stage {
            for &proportion in &self.config.budget_fractions {
                let capacity = mem_per_tile as f64 * proportion;
                log::info!(
                    "Targeting tile capacity: {} KB ({:.0}%) - minimum layers: {min_layers}...",
                    (capacity / 1024.0) as u64,
                    proportion * 100.0
                );
                match self.try_partition(num_devices, capacity, min_layers) {
                    Ok(found) => {
                        return SolveOutcome {
                            splits: found,
                            success: true,
                            min_layers: Some(min_layers),
                            proportion: Some(proportion),
                        }
                    }
                    Err(partial) => splits = partial,
                }
            }
        }

        log::info!("No split into {num_devices} stages found");
        SolveOutcome {
            splits,
            success: false,
            min_layers: None,
            proportion: None,
        }
    }
}

pub fn display_layer(layer: &Layer) -> String {
    layer.clone().unwrap_or_else(|| "None".to_string())
}

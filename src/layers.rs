//! Heuristic assignment of operations to layers.
//!
//! Layers are recognised from operation names with a regular expression
//! whose first capture group is the layer identifier. Operations without a
//! recognisable name inherit the layer of the nearest following named
//! operation, which is a single pass over the reversed sequence.

use std::{cmp::Ordering, fmt::Display};

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, AnalysisResult};

/// Layer identifier, `None` for operations outside any layer.
pub type Layer = Option<String>;

pub const DEFAULT_LAYER_NAME_REGEX: &str = r"(?:^|/)(?:[Ll]ayer|blocks|encoder)[/_.]?(\d+)";
pub const DEFAULT_INPUTS_REGEX_LAYER_0: &str = r"(word_embeddings|Embedding_Dict)";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum LayerOrder {
    /// Sort layers by identifier.
    Natural,
    /// Order of first appearance in the program.
    #[default]
    Steps,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingConfig {
    pub layer_name_regex: String,
    pub inputs_regex_layer_0: String,
    pub layer_order: LayerOrder,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            layer_name_regex: DEFAULT_LAYER_NAME_REGEX.to_string(),
            inputs_regex_layer_0: DEFAULT_INPUTS_REGEX_LAYER_0.to_string(),
            layer_order: LayerOrder::default(),
        }
    }
}

/// How the layer of an operation was worked out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerNote {
    /// Taken from the operation's own name.
    #[default]
    Named,
    TensorFilter,
    InputsRegexLayer0,
    DeducedFromInputNames,
    AmbiguousInputLayers,
    InputLayers,
    DeducedFromFollowingOperation,
}

impl Display for LayerNote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LayerNote::Named => "",
            LayerNote::TensorFilter => "tensor_filter",
            LayerNote::InputsRegexLayer0 => "inputs_regex_layer_0",
            LayerNote::DeducedFromInputNames => "deduced_from_input_names",
            LayerNote::AmbiguousInputLayers => "ambiguous_input_layers",
            LayerNote::InputLayers => "0_input_layers",
            LayerNote::DeducedFromFollowingOperation => "deduced_from_following_operation",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LayerAssignment {
    pub layer: Layer,
    pub note: LayerNote,
}

impl LayerAssignment {
    fn new(layer: Layer, note: LayerNote) -> Self {
        Self { layer, note }
    }
}

/// What a namer gets to see of each operation.
#[derive(Debug, Clone, Copy)]
pub struct NamingInput<'a> {
    pub name: &'a str,
    pub inputs: &'a [String],
    pub is_tensor: bool,
}

pub trait LayerNamer {
    /// Returns one assignment per operation, in the same order.
    fn assign(&self, ops: &[NamingInput<'_>]) -> Vec<LayerAssignment>;
}

pub struct RegexLayerNamer {
    layer_name: Regex,
    inputs_layer_0: Regex,
}

impl RegexLayerNamer {
    pub fn new(config: &NamingConfig) -> AnalysisResult<Self> {
        Ok(Self {
            layer_name: Regex::new(&config.layer_name_regex)?,
            inputs_layer_0: Regex::new(&config.inputs_regex_layer_0)?,
        })
    }

    fn layer_from_name(&self, name: &str) -> Layer {
        self.layer_name
            .captures(name)
            .and_then(|c| c.get(1).or_else(|| c.get(0)))
            .map(|m| m.as_str().to_string())
    }

    fn deduce(
        &self,
        index: usize,
        op: &NamingInput<'_>,
        first_named: Option<usize>,
        first_layer: &Layer,
        carried: &Layer,
    ) -> LayerAssignment {
        if op.is_tensor {
            return LayerAssignment::new(None, LayerNote::TensorFilter);
        }

        if first_layer.is_some() && op.inputs.iter().any(|i| self.inputs_layer_0.is_match(i)) {
            return LayerAssignment::new(first_layer.clone(), LayerNote::InputsRegexLayer0);
        }

        let input_layers = op
            .inputs
            .iter()
            .filter_map(|input| self.layer_from_name(input))
            .unique()
            .collect_vec();
        match input_layers.len() {
            0 => {}
            1 => {
                return LayerAssignment::new(
                    input_layers.into_iter().next(),
                    LayerNote::DeducedFromInputNames,
                )
            }
            _ => {
                let warning = AnalysisError::AmbiguousLayerInput {
                    operation: op.name.to_string(),
                    layers: input_layers,
                };
                log::warn!("{warning}");
                return LayerAssignment::new(None, LayerNote::AmbiguousInputLayers);
            }
        }

        if first_named.map_or(true, |first| index < first) {
            return LayerAssignment::new(None, LayerNote::InputLayers);
        }
        LayerAssignment::new(carried.clone(), LayerNote::DeducedFromFollowingOperation)
    }
}

impl LayerNamer for RegexLayerNamer {
    fn assign(&self, ops: &[NamingInput<'_>]) -> Vec<LayerAssignment> {
        let from_names = ops
            .iter()
            .map(|op| self.layer_from_name(op.name))
            .collect_vec();
        let first_named = from_names.iter().position(Option::is_some);
        let first_layer = first_named.and_then(|i| from_names[i].clone());

        let (_, mut assignments) = ops.iter().zip(from_names).enumerate().rev().fold(
            (None, Vec::with_capacity(ops.len())),
            |(carried, mut acc): (Layer, Vec<LayerAssignment>), (index, (op, named))| {
                if named.is_some() {
                    acc.push(LayerAssignment::new(named.clone(), LayerNote::Named));
                    return (named, acc);
                }
                acc.push(self.deduce(index, op, first_named, &first_layer, &carried));
                (carried, acc)
            },
        );
        assignments.reverse();
        assignments
    }
}

fn natural_cmp(a: &Layer, b: &Layer) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        },
    }
}

/// Distinct layers in the requested order.
pub fn order_layers<'a>(layers: impl IntoIterator<Item = &'a Layer>, order: LayerOrder) -> Vec<Layer> {
    let unique = layers.into_iter().unique().cloned().collect_vec();
    match order {
        LayerOrder::Steps => unique,
        LayerOrder::Natural => unique.into_iter().sorted_by(natural_cmp).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Op {
        name: &'static str,
        inputs: Vec<String>,
        is_tensor: bool,
    }

    fn op(name: &'static str, inputs: &[&str]) -> Op {
        Op {
            name,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            is_tensor: name.starts_with("Tensor/"),
        }
    }

    fn assign(ops: &[Op]) -> Vec<(Layer, String)> {
        let namer = RegexLayerNamer::new(&NamingConfig::default()).unwrap();
        let inputs = ops
            .iter()
            .map(|o| NamingInput {
                name: o.name,
                inputs: &o.inputs,
                is_tensor: o.is_tensor,
            })
            .collect_vec();
        namer
            .assign(&inputs)
            .into_iter()
            .map(|a| (a.layer, a.note.to_string()))
            .collect()
    }

    fn expect(layer: Option<&str>, note: &str) -> (Layer, String) {
        (layer.map(str::to_string), note.to_string())
    }

    #[test]
    fn names_and_propagation() {
        let result = assign(&[
            op("Anonymous", &[]),
            op("Tensor/segments", &[]),
            op("Embedding/Gather", &["word_embeddings"]),
            op("Layer0/Attention/MatMul", &[]),
            op("Call(1255)", &["Layer0/Attention/out"]),
            op("Softmax", &[]),
            op("Layer1/FF/MatMul", &[]),
            op("Loss", &[]),
        ]);
        assert_eq!(
            result,
            vec![
                expect(None, "0_input_layers"),
                expect(None, "tensor_filter"),
                expect(Some("0"), "inputs_regex_layer_0"),
                expect(Some("0"), ""),
                expect(Some("0"), "deduced_from_input_names"),
                expect(Some("1"), "deduced_from_following_operation"),
                expect(Some("1"), ""),
                expect(None, "deduced_from_following_operation"),
            ]
        );
    }

    #[test]
    fn ambiguous_inputs_fall_back_to_no_layer() {
        let result = assign(&[
            op("Layer0/A", &[]),
            op("Add", &["Layer0/x", "Layer1/y"]),
            op("Layer1/B", &[]),
        ]);
        assert_eq!(result[1], expect(None, "ambiguous_input_layers"));
    }

    #[test]
    fn other_name_patterns() {
        let result = assign(&[
            op("model/blocks_3/conv", &[]),
            op("bert/encoder/layer_12/attention", &[]),
        ]);
        assert_eq!(result[0].0.as_deref(), Some("3"));
        assert_eq!(result[1].0.as_deref(), Some("12"));
    }

    #[test]
    fn layer_ordering() {
        let layers: Vec<Layer> = vec![
            Some("10".into()),
            None,
            Some("2".into()),
            Some("10".into()),
            Some("1".into()),
        ];
        assert_eq!(
            order_layers(&layers, LayerOrder::Steps),
            vec![Some("10".into()), None, Some("2".into()), Some("1".into())]
        );
        assert_eq!(
            order_layers(&layers, LayerOrder::Natural),
            vec![None, Some("1".into()), Some("2".into()), Some("10".into())]
        );
    }
}

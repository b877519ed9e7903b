use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{AnalysisError, AnalysisResult},
    profile::{ProgramId, ProgramKind, RawProgram},
};

/// Kernel type plus the state size of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexType {
    pub name: String,
    pub size: u64,
}

/// An atomic compiled unit with its per-tile footprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub control_code_by_tile: Vec<u64>,
    pub exchange_code_by_tile: Vec<u64>,
    #[serde(with = "vertex_counts")]
    pub vertex_count_by_tile: BTreeMap<VertexType, Vec<u64>>,
}

/// JSON maps need string keys, so the counts travel as a list of pairs.
mod vertex_counts {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::VertexType;

    pub fn serialize<S: Serializer>(
        counts: &BTreeMap<VertexType, Vec<u64>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(counts.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<VertexType, Vec<u64>>, D::Error> {
        let pairs = Vec::<(VertexType, Vec<u64>)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

fn check_tiles(what: impl FnOnce() -> String, v: &[u64], num_tiles: usize) -> AnalysisResult<()> {
    if v.len() != num_tiles {
        return Err(AnalysisError::TileCountMismatch {
            what: what(),
            expected: num_tiles,
            found: v.len(),
        });
    }
    Ok(())
}

impl Program {
    pub fn from_raw(raw: &RawProgram, num_tiles: usize) -> AnalysisResult<Self> {
        // The control code of a composite program already includes its
        // children's, only leaves are counted.
        let control_code_by_tile = if raw.children.is_empty() {
            check_tiles(
                || format!("control code of program {}", raw.id),
                &raw.control_code_by_tile,
                num_tiles,
            )?;
            raw.control_code_by_tile.clone()
        } else {
            vec![0; num_tiles]
        };

        let exchange_code_by_tile = if raw.kind == ProgramKind::DoExchange {
            check_tiles(
                || format!("exchange code of program {}", raw.id),
                &raw.code_bytes_by_tile,
                num_tiles,
            )?;
            raw.code_bytes_by_tile.clone()
        } else {
            vec![0; num_tiles]
        };

        let mut vertex_count_by_tile: BTreeMap<VertexType, Vec<u64>> = BTreeMap::new();
        if raw.kind == ProgramKind::OnTileExecute {
            for vertex in &raw.vertices {
                check_tiles(
                    || format!("vertex {} of program {}", vertex.type_name, raw.id),
                    &vertex.count_by_tile,
                    num_tiles,
                )?;
                let counts = vertex_count_by_tile
                    .entry(VertexType {
                        name: vertex.type_name.clone(),
                        size: vertex.type_size,
                    })
                    .or_insert_with(|| vec![0; num_tiles]);
                for (acc, c) in counts.iter_mut().zip(&vertex.count_by_tile) {
                    *acc += c;
                }
            }
        }

        Ok(Program {
            id: raw.id,
            control_code_by_tile,
            exchange_code_by_tile,
            vertex_count_by_tile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::RawVertexCount;

    fn raw(kind: ProgramKind, children: Vec<ProgramId>) -> RawProgram {
        RawProgram {
            id: 7,
            kind,
            children,
            control_code_by_tile: vec![10, 20],
            code_bytes_by_tile: vec![3, 4],
            vertices: vec![RawVertexCount {
                type_name: "Add".to_string(),
                type_size: 8,
                count_by_tile: vec![1, 2],
            }],
        }
    }

    #[test]
    fn exchange_only_for_exchange_programs() {
        let exchange = Program::from_raw(&raw(ProgramKind::DoExchange, vec![]), 2).unwrap();
        assert_eq!(exchange.exchange_code_by_tile, vec![3, 4]);
        assert!(exchange.vertex_count_by_tile.is_empty());

        let compute = Program::from_raw(&raw(ProgramKind::OnTileExecute, vec![]), 2).unwrap();
        assert_eq!(compute.exchange_code_by_tile, vec![0, 0]);
        assert_eq!(compute.vertex_count_by_tile.len(), 1);
        assert_eq!(compute.control_code_by_tile, vec![10, 20]);
    }

    #[test]
    fn composite_programs_have_no_control_code() {
        let seq = Program::from_raw(&raw(ProgramKind::Other, vec![1, 2]), 2).unwrap();
        assert_eq!(seq.control_code_by_tile, vec![0, 0]);
        assert!(seq.vertex_count_by_tile.is_empty());
    }

    #[test]
    fn tile_count_mismatch() {
        let err = Program::from_raw(&raw(ProgramKind::OnTileExecute, vec![]), 3).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::TileCountMismatch {
                expected: 3,
                found: 2,
                ..
            }
        ));
    }
}

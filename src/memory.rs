use std::ops::{AddAssign, Index};

use serde::{Deserialize, Serialize};

/// One byte count per tile.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileBytes(Vec<u64>);

impl TileBytes {
    pub fn zeros(num_tiles: usize) -> Self {
        TileBytes(vec![0; num_tiles])
    }

    pub fn num_tiles(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn sum(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn max(&self) -> u64 {
        self.0.iter().copied().max().unwrap_or(0)
    }

    /// Adds `value` to every tile where `mask` is non-zero.
    pub fn add_masked(&mut self, value: &[u64], mask: &[u64]) {
        for ((acc, v), m) in self.0.iter_mut().zip(value).zip(mask) {
            if *m != 0 {
                *acc += v;
            }
        }
    }

    pub fn add_scaled(&mut self, counts: &[u64], scale: u64) {
        for (acc, c) in self.0.iter_mut().zip(counts) {
            *acc += c * scale;
        }
    }
}

impl From<Vec<u64>> for TileBytes {
    fn from(v: Vec<u64>) -> Self {
        TileBytes(v)
    }
}

impl AddAssign<&[u64]> for TileBytes {
    fn add_assign(&mut self, rhs: &[u64]) {
        for (acc, v) in self.0.iter_mut().zip(rhs) {
            *acc += v;
        }
    }
}

impl AddAssign<&TileBytes> for TileBytes {
    fn add_assign(&mut self, rhs: &TileBytes) {
        *self += rhs.as_slice();
    }
}

impl Index<usize> for TileBytes {
    type Output = u64;

    fn index(&self, tile: usize) -> &u64 {
        &self.0[tile]
    }
}

/// Per-tile memory of a stage split by category.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryBreakdown {
    pub total_mem: TileBytes,
    pub variables: TileBytes,
    pub vertex_code: TileBytes,
    pub vertex_state: TileBytes,
    pub exchange_code: TileBytes,
    pub control_code: TileBytes,
}

impl MemoryBreakdown {
    pub fn new(
        variables: TileBytes,
        vertex_code: TileBytes,
        vertex_state: TileBytes,
        exchange_code: TileBytes,
        control_code: TileBytes,
    ) -> Self {
        let mut total_mem = TileBytes::zeros(variables.num_tiles());
        for category in [
            &variables,
            &vertex_code,
            &vertex_state,
            &exchange_code,
            &control_code,
        ] {
            total_mem += category;
        }
        Self {
            total_mem,
            variables,
            vertex_code,
            vertex_state,
            exchange_code,
            control_code,
        }
    }

    pub fn max_tile_mem(&self) -> u64 {
        self.total_mem.max()
    }

    pub fn totals(&self) -> CategoryTotals {
        CategoryTotals {
            total_mem: self.total_mem.sum(),
            max_tile_mem: self.max_tile_mem(),
            variables: self.variables.sum(),
            vertex_code: self.vertex_code.sum(),
            vertex_state: self.vertex_state.sum(),
            exchange_code: self.exchange_code.sum(),
            control_code: self.control_code.sum(),
        }
    }
}

/// Category byte counts summed over all tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub total_mem: u64,
    pub max_tile_mem: u64,
    pub variables: u64,
    pub vertex_code: u64,
    pub vertex_state: u64,
    pub exchange_code: u64,
    pub control_code: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakdown_totals() {
        let mem = MemoryBreakdown::new(
            vec![10, 20].into(),
            vec![1, 1].into(),
            vec![2, 0].into(),
            vec![0, 3].into(),
            vec![4, 4].into(),
        );
        assert_eq!(mem.total_mem, vec![17, 28].into());
        let totals = mem.totals();
        assert_eq!(totals.total_mem, 45);
        assert_eq!(totals.max_tile_mem, 28);
        assert_eq!(totals.variables, 30);
        assert_eq!(totals.exchange_code, 3);
    }

    #[test]
    fn masked_add_ignores_absent_tiles() {
        let mut bytes = TileBytes::zeros(3);
        bytes.add_masked(&[5, 6, 7], &[0, 2, 9]);
        bytes.add_scaled(&[1, 0, 2], 8);
        assert_eq!(bytes.as_slice(), &[8, 6, 23]);
        assert_eq!(TileBytes::zeros(0).max(), 0);
    }
}

//! Nearest-neighbor search over embedded cells.

use ndarray::Array2;
use rayon::prelude::*;

/// Exact Euclidean neighbor index over the columns of an embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct NeighborIndex {
    /// One row per cell.
    points: Vec<Vec<f64>>,
}

/// Neighbors of every cell, closest first, excluding the cell itself.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Neighbors {
    pub indices: Vec<Vec<usize>>,
    pub distances: Vec<Vec<f64>>,
}

impl Neighbors {
    pub fn num_cells(&self) -> usize {
        self.indices.len()
    }
}

impl NeighborIndex {
    /// Index the columns of a dimensions × cells embedding.
    pub fn new(embedding: &Array2<f64>) -> Self {
        NeighborIndex {
            points: embedding.columns().into_iter().map(|c| c.to_vec()).collect(),
        }
    }

    pub fn num_cells(&self) -> usize {
        self.points.len()
    }

    pub fn num_dims(&self) -> usize {
        self.points.first().map_or(0, Vec::len)
    }

    fn distance(&self, a: usize, b: usize) -> f64 {
        self.points[a]
            .iter()
            .zip(&self.points[b])
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// The `k` nearest neighbors of every cell. Ties go to the lower index.
    pub fn search(&self, k: usize) -> Neighbors {
        let n = self.num_cells();
        let k = k.min(n.saturating_sub(1));
        let (indices, distances) = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut candidates: Vec<(f64, usize)> = (0..n)
                    .filter(|&j| j != i)
                    .map(|j| (self.distance(i, j), j))
                    .collect();
                candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                candidates.truncate(k);
                candidates.into_iter().map(|(d, j)| (j, d)).unzip::<_, _, Vec<_>, Vec<_>>()
            })
            .unzip();
        Neighbors { indices, distances }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_search_on_a_line() {
        let index = NeighborIndex::new(&array![[0.0, 1.0, 3.0, 7.0]]);
        assert_eq!(index.num_cells(), 4);
        assert_eq!(index.num_dims(), 1);
        let nn = index.search(2);
        assert_eq!(nn.indices, vec![vec![1, 2], vec![0, 2], vec![1, 0], vec![2, 1]]);
        assert_eq!(nn.distances[3], vec![4.0, 6.0]);
        assert_eq!(index.search(10).indices[0].len(), 3);
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let index = NeighborIndex::new(&array![[0.0, -1.0, 1.0]]);
        assert_eq!(index.search(1).indices[0], vec![1]);
    }
}

//! SNN graph construction and community detection

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use crate::kmeans::relabel_by_size;
use crate::nn::Neighbors;

const TOLERANCE: f64 = 1e-10;
const MAX_LEVELS: usize = 100;
const MAX_PASSES: usize = 1000;

/// Edge weighting of the shared nearest neighbor graph.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// `k` minus half the smallest rank sum of a shared neighbor.
    #[default]
    Rank,
    /// Number of shared neighbors.
    Number,
    /// Jaccard index of the neighbor sets.
    Jaccard,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    Multilevel,
    /// Multilevel with a connectivity refinement before each aggregation.
    Leiden,
}

/// Undirected weighted graph as symmetric adjacency lists. Self loops are
/// stored once with their full weight.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Graph {
    adjacency: Vec<Vec<(usize, f64)>>,
}

impl Graph {
    fn from_edges(num_nodes: usize, edges: &BTreeMap<(usize, usize), f64>) -> Self {
        let mut adjacency = vec![Vec::new(); num_nodes];
        for (&(a, b), &w) in edges {
            adjacency[a].push((b, w));
            if a != b {
                adjacency[b].push((a, w));
            }
        }
        Graph { adjacency }
    }

    pub fn num_nodes(&self) -> usize {
        self.adjacency.len()
    }

    pub fn num_edges(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum::<usize>() / 2
    }

    fn degree(&self, node: usize) -> f64 {
        self.adjacency[node]
            .iter()
            .map(|&(j, w)| if j == node { 2.0 * w } else { w })
            .sum()
    }
}

/// Connect cells that share nearest neighbors.
pub(crate) fn build_snn_graph(neighbors: &Neighbors, scheme: Scheme) -> Graph {
    let n = neighbors.num_cells();
    let k = neighbors.indices.iter().map(Vec::len).max().unwrap_or(0);
    // each cell is its own neighbor of rank 0
    let sets: Vec<Vec<(usize, usize)>> = (0..n)
        .map(|i| {
            std::iter::once((i, 0))
                .chain(neighbors.indices[i].iter().enumerate().map(|(r, &j)| (j, r + 1)))
                .collect()
        })
        .collect();
    let mut holders: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n];
    for (i, set) in sets.iter().enumerate() {
        for &(s, rank) in set {
            holders[s].push((i, rank));
        }
    }

    let mut edges = BTreeMap::new();
    for (i, set) in sets.iter().enumerate() {
        let mut shared: HashMap<usize, (usize, usize)> = HashMap::new();
        for &(s, ri) in set {
            for &(j, rj) in &holders[s] {
                if j <= i {
                    continue;
                }
                let entry = shared.entry(j).or_insert((0, usize::MAX));
                entry.0 += 1;
                entry.1 = entry.1.min(ri + rj);
            }
        }
        for (j, (count, min_rank)) in shared {
            let weight = match scheme {
                Scheme::Rank => k as f64 - min_rank as f64 / 2.0,
                Scheme::Number => count as f64,
                Scheme::Jaccard => count as f64 / (2.0 * (k + 1) as f64 - count as f64),
            };
            if weight > 0.0 {
                edges.insert((i, j), weight);
            }
        }
    }
    Graph::from_edges(n, &edges)
}

fn modularity(graph: &Graph, membership: &[usize], resolution: f64) -> f64 {
    let m2: f64 = (0..graph.num_nodes()).map(|i| graph.degree(i)).sum();
    if m2 <= 0.0 {
        return 0.0;
    }
    let num = membership.iter().max().map_or(0, |&m| m + 1);
    let mut internal = vec![0.0; num];
    let mut totals = vec![0.0; num];
    for i in 0..graph.num_nodes() {
        totals[membership[i]] += graph.degree(i);
        for &(j, w) in &graph.adjacency[i] {
            if membership[i] == membership[j] {
                internal[membership[i]] += if i == j { 2.0 * w } else { w };
            }
        }
    }
    internal
        .iter()
        .zip(&totals)
        .map(|(&inside, &tot)| inside / m2 - resolution * (tot / m2).powi(2))
        .sum()
}

/// Move single nodes between communities while modularity improves.
/// Returns true if anything moved.
fn local_moving(graph: &Graph, membership: &mut [usize], resolution: f64) -> bool {
    let n = graph.num_nodes();
    let degrees: Vec<f64> = (0..n).map(|i| graph.degree(i)).collect();
    let m2: f64 = degrees.iter().sum();
    if m2 <= 0.0 {
        return false;
    }
    let mut totals = vec![0.0; n];
    for i in 0..n {
        totals[membership[i]] += degrees[i];
    }
    let mut any = false;
    for _ in 0..MAX_PASSES {
        let mut moved = false;
        for i in 0..n {
            let current = membership[i];
            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            for &(j, w) in &graph.adjacency[i] {
                if j != i {
                    *links.entry(membership[j]).or_default() += w;
                }
            }
            totals[current] -= degrees[i];
            let gain = |c: usize, link: f64| link - resolution * degrees[i] * totals[c] / m2;
            let mut best = current;
            let mut best_gain = gain(current, links.get(&current).copied().unwrap_or(0.0));
            for (&c, &link) in &links {
                let g = gain(c, link);
                if g > best_gain + TOLERANCE {
                    best = c;
                    best_gain = g;
                }
            }
            totals[best] += degrees[i];
            if best != current {
                membership[i] = best;
                moved = true;
                any = true;
            }
        }
        if !moved {
            break;
        }
    }
    any
}

/// Split every community into its connected components.
fn refine(graph: &Graph, membership: &[usize]) -> Vec<usize> {
    let n = graph.num_nodes();
    let mut refined = vec![usize::MAX; n];
    let mut next = 0;
    for start in 0..n {
        if refined[start] != usize::MAX {
            continue;
        }
        refined[start] = next;
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for &(j, w) in &graph.adjacency[node] {
                if w > 0.0 && refined[j] == usize::MAX && membership[j] == membership[start] {
                    refined[j] = next;
                    queue.push_back(j);
                }
            }
        }
        next += 1;
    }
    refined
}

fn compact(labels: &[usize]) -> (Vec<usize>, usize) {
    let mut map: HashMap<usize, usize> = HashMap::new();
    let out = labels
        .iter()
        .map(|&l| {
            let next = map.len();
            *map.entry(l).or_insert(next)
        })
        .collect();
    (out, map.len())
}

fn aggregate(graph: &Graph, membership: &[usize], num: usize) -> Graph {
    let mut edges: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for i in 0..graph.num_nodes() {
        for &(j, w) in &graph.adjacency[i] {
            let (a, b) = (membership[i], membership[j]);
            if i == j {
                *edges.entry((a, a)).or_default() += w;
            } else if i < j {
                let key = if a <= b { (a, b) } else { (b, a) };
                *edges.entry(key).or_default() += w;
            }
        }
    }
    Graph::from_edges(num, &edges)
}

/// Multi-level modularity optimization. Labels are ordered by decreasing
/// community size.
pub(crate) fn cluster_graph(graph: &Graph, resolution: f64, algorithm: Algorithm) -> Vec<usize> {
    let n = graph.num_nodes();
    let now = Instant::now();
    let mut assignment: Vec<usize> = (0..n).collect();
    let mut level_graph = graph.clone();
    let mut membership: Vec<usize> = (0..n).collect();

    for level in 0..MAX_LEVELS {
        let moved = local_moving(&level_graph, &mut membership, resolution);
        let (communities, num_communities) = compact(&membership);
        let (nodes, num_nodes) = match algorithm {
            Algorithm::Multilevel => (communities.clone(), num_communities),
            Algorithm::Leiden => compact(&refine(&level_graph, &communities)),
        };
        for a in assignment.iter_mut() {
            *a = nodes[*a];
        }
        info!(
            "{algorithm:?} level {level}: {num_communities} communities, modularity {:.6}",
            modularity(&level_graph, &communities, resolution)
        );
        // community of each aggregated node
        let mut start = vec![0; num_nodes];
        for (i, &node) in nodes.iter().enumerate() {
            start[node] = communities[i];
        }
        if !moved || num_nodes == level_graph.num_nodes() {
            for a in assignment.iter_mut() {
                *a = start[*a];
            }
            break;
        }
        level_graph = aggregate(&level_graph, &nodes, num_nodes);
        membership = match algorithm {
            Algorithm::Multilevel => (0..num_nodes).collect(),
            Algorithm::Leiden => start,
        };
    }
    info!("clustered {n} nodes in {:.3}s", now.elapsed().as_secs_f64());
    relabel_by_size(&compact(&assignment).0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::NeighborIndex;
    use ndarray::Array2;
    use pretty_assertions::assert_eq;

    fn two_cliques() -> Graph {
        let mut edges = BTreeMap::new();
        for base in [0, 5] {
            for i in 0..5 {
                for j in i + 1..5 {
                    edges.insert((base + i, base + j), 1.0);
                }
            }
        }
        edges.insert((4, 5), 0.1);
        Graph::from_edges(10, &edges)
    }

    #[test]
    fn test_two_cliques() {
        for algorithm in [Algorithm::Multilevel, Algorithm::Leiden] {
            let labels = cluster_graph(&two_cliques(), 1.0, algorithm);
            assert_eq!(labels, vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1]);
        }
    }

    #[test]
    fn test_low_resolution_merges() {
        let labels = cluster_graph(&two_cliques(), 0.001, Algorithm::Multilevel);
        assert!(labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_snn_schemes() {
        let values: Vec<f64> = vec![0.0, 0.1, 0.2, 10.0, 10.1, 10.2];
        let index = NeighborIndex::new(&Array2::from_shape_vec((1, 6), values).unwrap());
        let nn = index.search(2);
        for scheme in [Scheme::Rank, Scheme::Number, Scheme::Jaccard] {
            let graph = build_snn_graph(&nn, scheme);
            assert_eq!(graph.num_nodes(), 6);
            // the two triplets share no neighbors
            assert!(graph.adjacency[0].iter().all(|&(j, _)| j < 3));
            assert!(graph.num_edges() >= 6);
        }
        let labels = cluster_graph(&build_snn_graph(&nn, Scheme::Rank), 1.0, Algorithm::Leiden);
        assert_eq!(labels, vec![0, 0, 0, 1, 1, 1]);
    }
}

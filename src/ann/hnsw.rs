//! HNSW graph construction and the shared beam search.
//!
//! The graph is built fully deterministically: node levels come from a
//! SplitMix64 stream seeded by the persisted `seed`, every heap ordering
//! breaks distance ties by ascending id, and neighbor selection is the
//! plain closest-M rule.  Identical inputs, seed, and parameters therefore
//! produce an identical graph — and, downstream, a byte-identical `.ann`
//! file.
//!
//! The beam search is generic over two closures (distance and neighbor
//! access) so the in-memory builder and the mmap-backed reader run the
//! exact same traversal.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::cmp::Reverse;

use crate::embed::Matrix;

/// Node levels are capped so a pathological RNG streak cannot produce an
/// absurd layer count.
const MAX_LEVEL: u8 = 31;

/// A scored node; ordered by distance, ties by ascending id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub dist: f32,
    pub id: u32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deterministic 64-bit generator (SplitMix64).  Kept in-crate so the
/// on-disk graph never depends on an external RNG's version-to-version
/// stream stability.
pub(crate) struct SplitMix64(u64);

impl SplitMix64 {
    pub fn new(seed: u64) -> SplitMix64 {
        SplitMix64(seed)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform draw in `(0, 1]`.
    fn next_unit(&mut self) -> f64 {
        (((self.next_u64() >> 11) + 1) as f64) / ((1u64 << 53) as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    pub m: u16,
    pub ef_construction: u16,
    pub seed: u64,
}

/// In-memory layered graph, the builder's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HnswGraph {
    pub params: HnswParams,
    pub entry_point: u32,
    pub max_level: u8,
    /// Top layer of each node.
    pub levels: Vec<u8>,
    /// `links[node][layer]` = neighbor ids.
    pub links: Vec<Vec<Vec<u32>>>,
}

impl HnswGraph {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Build the graph over L2-normalized `vectors`.
pub fn build(vectors: &Matrix, params: HnswParams) -> HnswGraph {
    let n = vectors.rows();
    let m = params.m.max(1) as usize;
    let ml = 1.0 / (m as f64).ln().max(f64::MIN_POSITIVE);
    let mut rng = SplitMix64::new(params.seed);

    let mut graph = HnswGraph {
        params,
        entry_point: 0,
        max_level: 0,
        levels: Vec::with_capacity(n),
        links: Vec::with_capacity(n),
    };

    for i in 0..n as u32 {
        let level = gen_level(&mut rng, ml);
        graph.levels.push(level);
        graph.links.push(vec![Vec::new(); level as usize + 1]);

        if i == 0 {
            graph.entry_point = 0;
            graph.max_level = level;
            continue;
        }

        let q = vectors.row(i as usize);
        let dist = |id: u32| cosine_distance(vectors.row(id as usize), q);
        let mut cur = graph.entry_point;

        // Greedy descent through layers above the node's own top layer.
        for layer in ((level as usize + 1)..=(graph.max_level as usize)).rev() {
            cur = greedy_closest(&dist, |v, l| graph.links[v as usize][l].iter().copied(), cur, layer);
        }

        // Link into every layer the node participates in.
        for layer in (0..=(level.min(graph.max_level) as usize)).rev() {
            let found = search_layer(
                &dist,
                &|v: u32, l: usize| graph.links[v as usize][l].iter().copied(),
                &[Candidate { dist: dist(cur), id: cur }],
                params.ef_construction.max(1) as usize,
                layer,
            );
            cur = found[0].id;

            let selected: Vec<u32> = found.iter().take(m).map(|c| c.id).collect();
            graph.links[i as usize][layer] = selected.clone();

            let cap = max_connections(m, layer);
            for nb in selected {
                graph.links[nb as usize][layer].push(i);
                if graph.links[nb as usize][layer].len() > cap {
                    prune(vectors, &mut graph.links[nb as usize][layer], nb, cap);
                }
            }
        }

        if level > graph.max_level {
            graph.max_level = level;
            graph.entry_point = i;
        }
    }

    graph
}

fn gen_level(rng: &mut SplitMix64, ml: f64) -> u8 {
    let level = (-rng.next_unit().ln() * ml).floor() as u64;
    level.min(MAX_LEVEL as u64) as u8
}

fn max_connections(m: usize, layer: usize) -> usize {
    if layer == 0 {
        m * 2
    } else {
        m
    }
}

/// Keep the `cap` closest neighbors of `node` (ties by id).
fn prune(vectors: &Matrix, list: &mut Vec<u32>, node: u32, cap: usize) {
    let anchor = vectors.row(node as usize);
    list.sort_by(|a, b| {
        Candidate { dist: cosine_distance(vectors.row(*a as usize), anchor), id: *a }.cmp(
            &Candidate { dist: cosine_distance(vectors.row(*b as usize), anchor), id: *b },
        )
    });
    list.dedup();
    list.truncate(cap);
}

/// `1 - cosine` on already-normalized vectors.
pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    1.0 - dot
}

/// Hill-climb to the locally closest node on one layer.
pub(crate) fn greedy_closest<D, N, I>(dist: &D, neighbors: N, start: u32, layer: usize) -> u32
where
    D: Fn(u32) -> f32,
    N: Fn(u32, usize) -> I,
    I: Iterator<Item = u32>,
{
    let mut cur = start;
    let mut cur_dist = dist(cur);
    loop {
        let mut improved = false;
        for nb in neighbors(cur, layer) {
            let d = dist(nb);
            if d < cur_dist {
                cur = nb;
                cur_dist = d;
                improved = true;
            }
        }
        if !improved {
            return cur;
        }
    }
}

/// Beam search on one layer; returns up to `ef` candidates sorted by
/// `(distance, id)`.
pub(crate) fn search_layer<D, N, I>(
    dist: &D,
    neighbors: &N,
    entries: &[Candidate],
    ef: usize,
    layer: usize,
) -> Vec<Candidate>
where
    D: Fn(u32) -> f32,
    N: Fn(u32, usize) -> I,
    I: Iterator<Item = u32>,
{
    let mut visited: HashSet<u32> = entries.iter().map(|c| c.id).collect();
    // Min-heap of nodes still to expand.
    let mut frontier: BinaryHeap<Reverse<Candidate>> =
        entries.iter().map(|c| Reverse(*c)).collect();
    // Max-heap of the best `ef` found so far.
    let mut best: BinaryHeap<Candidate> = entries.iter().copied().collect();

    while let Some(Reverse(cur)) = frontier.pop() {
        if best.len() >= ef {
            if let Some(worst) = best.peek() {
                if cur.dist > worst.dist {
                    break;
                }
            }
        }
        for nb in neighbors(cur.id, layer) {
            if !visited.insert(nb) {
                continue;
            }
            let d = dist(nb);
            let candidate = Candidate { dist: d, id: nb };
            if best.len() < ef || candidate < *best.peek().expect("best is non-empty") {
                frontier.push(Reverse(candidate));
                best.push(candidate);
                if best.len() > ef {
                    best.pop();
                }
            }
        }
    }

    let mut out = best.into_vec();
    out.sort();
    out
}

/// Full query traversal: greedy descent to layer 1, beam at layer 0.
pub(crate) fn search_graph<D, N, I>(
    dist: &D,
    neighbors: &N,
    entry_point: u32,
    max_level: u8,
    ef: usize,
    top_k: usize,
) -> Vec<(u32, f32)>
where
    D: Fn(u32) -> f32,
    N: Fn(u32, usize) -> I,
    I: Iterator<Item = u32>,
{
    let mut cur = entry_point;
    for layer in (1..=max_level as usize).rev() {
        cur = greedy_closest(dist, |v, l| neighbors(v, l), cur, layer);
    }
    let found = search_layer(
        dist,
        neighbors,
        &[Candidate { dist: dist(cur), id: cur }],
        ef.max(top_k).max(1),
        0,
    );
    found
        .into_iter()
        .take(top_k)
        .map(|c| (c.id, c.dist))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::normalize;

    fn test_vectors(n: usize, dim: usize, seed: u64) -> Matrix {
        let mut rng = SplitMix64::new(seed);
        let mut m = Matrix::with_dim(dim);
        for _ in 0..n {
            let mut row: Vec<f32> = (0..dim)
                .map(|_| (rng.next_u64() as f64 / u64::MAX as f64) as f32 - 0.5)
                .collect();
            normalize(&mut row);
            m.push_row(&row);
        }
        m
    }

    fn params() -> HnswParams {
        HnswParams { m: 8, ef_construction: 64, seed: 42 }
    }

    #[test]
    fn construction_is_deterministic() {
        let vectors = test_vectors(120, 16, 7);
        let a = build(&vectors, params());
        let b = build(&vectors, params());
        assert_eq!(a, b);
    }

    #[test]
    fn every_vector_finds_itself() {
        let vectors = test_vectors(80, 16, 3);
        let graph = build(&vectors, params());
        for i in 0..vectors.rows() as u32 {
            let q = vectors.row(i as usize);
            let dist = |id: u32| cosine_distance(vectors.row(id as usize), q);
            let hits = search_graph(
                &dist,
                &|v: u32, l: usize| graph.links[v as usize][l].iter().copied(),
                graph.entry_point,
                graph.max_level,
                64,
                1,
            );
            assert_eq!(hits[0].0, i);
            assert!(hits[0].1.abs() < 1e-5);
        }
    }

    #[test]
    fn results_are_ordered_by_distance_then_id() {
        let vectors = test_vectors(60, 8, 11);
        let graph = build(&vectors, params());
        let q = vectors.row(0);
        let dist = |id: u32| cosine_distance(vectors.row(id as usize), q);
        let hits = search_graph(
            &dist,
            &|v: u32, l: usize| graph.links[v as usize][l].iter().copied(),
            graph.entry_point,
            graph.max_level,
            60,
            10,
        );
        for pair in hits.windows(2) {
            assert!(
                pair[0].1 < pair[1].1 || (pair[0].1 == pair[1].1 && pair[0].0 < pair[1].0)
            );
        }
    }

    #[test]
    fn layer0_degree_is_bounded() {
        let vectors = test_vectors(200, 8, 5);
        let graph = build(&vectors, params());
        for node in &graph.links {
            assert!(node[0].len() <= 2 * params().m as usize);
            for layer in node.iter().skip(1) {
                assert!(layer.len() <= params().m as usize + 1);
            }
        }
    }

    #[test]
    fn empty_input_builds_an_empty_graph() {
        let graph = build(&Matrix::with_dim(8), params());
        assert!(graph.is_empty());
    }
}

use crate::*;
use kmeans::{EuclideanDistance, KMeans, KMeansConfig};
use ndarray::Array2;
use std::collections::VecDeque;

/// Source of starting partitions for the refiner.
///
/// `None` means the strategy produced nothing for this `num_parts`; callers
/// skip it and carry on with the other strategies.
pub trait InitialPartitioner: Send + Sync {
    fn name(&self) -> &str;
    fn partition(&self, hgraph: &Hypergraph, num_parts: usize, seed: u64) -> Option<Vec<usize>>;
}

// --------------------------------------------------------------------------------
// ### Random k-way cuts
// --------------------------------------------------------------------------------

const KWAY_REBALANCE_ITERATIONS: usize = 50;

/// Seeded random assignment followed by a size rebalancing sweep.
#[derive(Debug, Clone, new)]
pub struct RandomKWay {
    /// Part sizes may reach `ceil(target * ub_factor)` before vertices are moved out.
    pub ub_factor: float,
}

impl RandomKWay {
    /// Per-part target sizes and the size each part may reach before it is drained.
    pub fn size_limits(&self, num_vertices: usize, num_parts: usize) -> (Vec<usize>, Vec<usize>) {
        let ideal = num_vertices / num_parts;
        let remainder = num_vertices % num_parts;
        let targets = (0..num_parts)
            .map(|p| ideal + usize::from(p < remainder))
            .collect_vec();
        let factor = self.ub_factor.max(1.0);
        let upper = targets.iter().map(|&t| (t.float() * factor).ceil().usize()).collect();
        (targets, upper)
    }
}

impl InitialPartitioner for RandomKWay {
    fn name(&self) -> &str {
        "kway"
    }

    fn partition(&self, hgraph: &Hypergraph, num_parts: usize, seed: u64) -> Option<Vec<usize>> {
        let n = hgraph.num_vertices();
        if n == 0 {
            return None;
        }
        let k = num_parts.max(1);
        let mut rng = seeded_rng(seed);
        let (targets, upper) = self.size_limits(n, k);
        let mut partition = (0..n).map(|_| rng.random_range(0..k)).collect_vec();
        let mut sizes = vec![0usize; k];
        partition.iter().for_each(|&p| sizes[p] += 1);

        for _ in 0..KWAY_REBALANCE_ITERATIONS {
            let over = (0..k).filter(|&p| sizes[p] > upper[p]).collect_vec();
            if over.is_empty() {
                break;
            }
            let under = (0..k).filter(|&p| sizes[p] < targets[p]).collect_vec();
            for from in over {
                let mut movable = (0..n).filter(|&v| partition[v] == from).collect_vec();
                movable.shuffle(&mut rng);
                for v in movable {
                    if sizes[from] <= upper[from] {
                        break;
                    }
                    if let Some(&to) = under.iter().find(|&&p| sizes[p] < targets[p]) {
                        partition[v] = to;
                        sizes[from] -= 1;
                        sizes[to] += 1;
                    }
                }
            }
        }
        Some(partition)
    }
}

// --------------------------------------------------------------------------------
// ### Crossbar expansion
// --------------------------------------------------------------------------------

/// BFS growth of parts around the highest-degree vertices.
#[derive(Debug, Clone, new)]
pub struct CrossbarExpansion {
    /// Degree quantile a vertex must reach to seed a part.
    pub quantile: float,
    /// Share of a vertex's discovered connections that must point at one
    /// part before it joins that part.
    pub majority: float,
}

/// Vertices expanded per part before the next part gets its turn.
const EXPANSION_BATCH: usize = 5;

impl CrossbarExpansion {
    /// Vertices whose neighbour count reaches the configured degree quantile.
    pub fn find_crossbars(&self, hgraph: &Hypergraph) -> Vec<usize> {
        let n = hgraph.num_vertices();
        if n == 0 {
            return Vec::new();
        }
        let degrees = (0..n).map(|v| hgraph.neighbors(v).len()).collect_vec();
        let sorted = degrees.iter().copied().sorted_unstable().collect_vec();
        let index = (self.quantile.clamp(0.0, 1.0) * n.float()).usize().min(n - 1);
        let threshold = sorted[index];
        (0..n).filter(|&v| degrees[v] >= threshold).collect()
    }

    /// Grows one part from each of the `num_parts` best connected crossbars.
    /// Returns an empty assignment when there are fewer crossbars than parts.
    pub fn expand(&self, hgraph: &Hypergraph, crossbars: &[usize], num_parts: usize) -> Vec<usize> {
        if crossbars.len() < num_parts || num_parts == 0 {
            warn!(
                "Not enough crossbars ({}) for {} partitions",
                crossbars.len(),
                num_parts
            );
            return Vec::new();
        }
        let n = hgraph.num_vertices();
        let neighbors = (0..n).map(|v| hgraph.neighbors(v)).collect_vec();
        let mut assignment: Vec<Option<usize>> = vec![None; n];
        let mut edge_counts: Vec<Dict<usize, usize>> = vec![Dict::new(); n];
        let mut queues: Vec<VecDeque<usize>> = vec![VecDeque::new(); num_parts];

        let seeds = crossbars
            .iter()
            .copied()
            .sorted_by_key(|&c| (Reverse(neighbors[c].len()), c))
            .take(num_parts);
        for (p, c) in seeds.enumerate() {
            assignment[c] = Some(p);
            queues[p].push_back(c);
        }

        let mut active = true;
        while active {
            active = false;
            for p in 0..num_parts {
                for _ in 0..EXPANSION_BATCH {
                    let Some(current) = queues[p].pop_front() else {
                        break;
                    };
                    active = true;
                    for &u in &neighbors[current] {
                        if assignment[u].is_some() {
                            continue;
                        }
                        *edge_counts[u].entry(p).or_insert(0) += 1;
                        if self.joins(&edge_counts[u], p) {
                            assignment[u] = Some(p);
                            queues[p].push_back(u);
                        }
                    }
                }
            }
        }
        assign_remaining(&neighbors, assignment, num_parts)
    }

    /// `part` holds a strict majority of the connections seen so far.
    fn joins(&self, counts: &Dict<usize, usize>, part: usize) -> bool {
        let total: usize = counts.values().sum();
        let best = counts
            .iter()
            .max_by_key(|&(&p, &c)| (c, Reverse(p)))
            .map(|(&p, &c)| (p, c));
        matches!(best, Some((p, c)) if p == part && c.float() > self.majority * total.float())
    }
}

/// Hands unassigned vertices to the part most of their neighbours are in,
/// and whatever stays isolated to the smallest part.
fn assign_remaining(neighbors: &[Vec<usize>], mut assignment: Vec<Option<usize>>, num_parts: usize) -> Vec<usize> {
    let n = assignment.len();
    loop {
        let mut changed = false;
        for v in 0..n {
            if assignment[v].is_some() {
                continue;
            }
            let mut counts = vec![0usize; num_parts];
            for &u in &neighbors[v] {
                if let Some(p) = assignment[u] {
                    counts[p] += 1;
                }
            }
            if let Some((p, _)) = counts
                .iter()
                .enumerate()
                .filter(|&(_, &c)| c > 0)
                .max_by_key(|&(p, &c)| (c, Reverse(p)))
            {
                assignment[v] = Some(p);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    let mut sizes = vec![0usize; num_parts];
    assignment.iter().flatten().for_each(|&p| sizes[p] += 1);
    assignment
        .into_iter()
        .map(|a| {
            a.unwrap_or_else(|| {
                let p = (0..num_parts).min_by_key(|&p| (sizes[p], p)).unwrap_or(0);
                sizes[p] += 1;
                p
            })
        })
        .collect()
}

impl InitialPartitioner for CrossbarExpansion {
    fn name(&self) -> &str {
        "crossbar"
    }

    fn partition(&self, hgraph: &Hypergraph, num_parts: usize, _seed: u64) -> Option<Vec<usize>> {
        let crossbars = self.find_crossbars(hgraph);
        let result = self.expand(hgraph, &crossbars, num_parts);
        (!result.is_empty()).then_some(result)
    }
}

// --------------------------------------------------------------------------------
// ### Spectral clustering
// --------------------------------------------------------------------------------

/// Hyperedges larger than this are left out of the clique expansion.
const MAX_CLIQUE_EDGE: usize = 64;

/// Embeds the vertices with the leading eigenvectors of the normalised
/// clique-expanded adjacency and clusters the rows with k-means.
#[derive(Debug, Clone)]
pub struct SpectralClustering {
    pub power_iterations: usize,
    pub kmeans_iterations: usize,
    /// Lloyd restarts; the run with the smallest distance sum wins.
    pub kmeans_inits: usize,
}

impl Default for SpectralClustering {
    fn default() -> Self {
        SpectralClustering {
            power_iterations: 200,
            kmeans_iterations: 100,
            kmeans_inits: 5,
        }
    }
}

impl SpectralClustering {
    fn adjacency(hgraph: &Hypergraph) -> Vec<Vec<(usize, float)>> {
        let n = hgraph.num_vertices();
        let mut adj: Vec<Dict<usize, float>> = vec![Dict::new(); n];
        for e in 0..hgraph.num_hyperedges() {
            let pins = hgraph.vertices(e);
            if pins.len() > MAX_CLIQUE_EDGE {
                continue;
            }
            let w = hgraph.hyperedge_weight(e)[0] / (pins.len() - 1).float();
            for (i, &a) in pins.iter().enumerate() {
                for &b in &pins[i + 1..] {
                    *adj[a].entry(b).or_insert(0.0) += w;
                    *adj[b].entry(a).or_insert(0.0) += w;
                }
            }
        }
        adj.into_iter()
            .map(|row| row.into_iter().sorted_unstable_by_key(|&(u, _)| u).collect())
            .collect()
    }

    /// Orthogonal iteration on `(I + D^-1/2 A D^-1/2) / 2`. Row `v` of the
    /// `n x dims` result is the unit-length coordinate of vertex `v`.
    pub fn embed(&self, hgraph: &Hypergraph, dims: usize, rng: &mut StdRng) -> Array2<float> {
        let n = hgraph.num_vertices();
        let adj = Self::adjacency(hgraph);
        let inv_sqrt_deg = adj
            .iter()
            .map(|row| {
                let d: float = row.iter().map(|&(_, w)| w).sum();
                if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 }
            })
            .collect_vec();
        let mut basis = Array2::from_shape_fn((n, dims), |_| rng.random_range(-1.0..1.0));
        orthonormalize(&mut basis);
        for _ in 0..self.power_iterations {
            basis = Array2::from_shape_fn((n, dims), |(i, c)| {
                let ax: float = adj[i]
                    .iter()
                    .map(|&(j, w)| w * inv_sqrt_deg[j] * basis[[j, c]])
                    .sum();
                0.5 * (basis[[i, c]] + inv_sqrt_deg[i] * ax)
            });
            orthonormalize(&mut basis);
        }
        for mut row in basis.rows_mut() {
            let norm = row.iter().map(|x| x * x).sum::<float>().sqrt();
            if norm > 0.0 {
                row.mapv_inplace(|x| x / norm);
            }
        }
        basis
    }

    /// Lloyd's k-means with k-means++ seeding over the embedding rows.
    pub fn cluster(&self, embedding: &Array2<float>, k: usize, seed: u64) -> Vec<usize> {
        use rand08::SeedableRng as _;
        let (n, dims) = embedding.dim();
        if n == 0 || k == 0 {
            return Vec::new();
        }
        let rows = embedding
            .rows()
            .into_iter()
            .map(|row| row.iter().map(|&x| OrderedFloat(x)).collect_vec())
            .collect_vec();
        if rows.iter().unique().count() < k {
            let mut ids: Dict<&Vec<OrderedFloat<float>>, usize> = Dict::new();
            let labels = rows
                .iter()
                .map(|row| {
                    let next = ids.len();
                    *ids.entry(row).or_insert(next)
                })
                .collect_vec();
            return fill_empty_clusters(labels, k);
        }
        let samples = embedding.iter().copied().collect_vec();
        let model: KMeans<float, 8, _> = KMeans::new(&samples, n, dims, EuclideanDistance);
        let config = KMeansConfig::build()
            .random_generator(rand08::rngs::StdRng::seed_from_u64(seed))
            .build();
        let best = (0..self.kmeans_inits.max(1))
            .map(|_| model.kmeans_lloyd(k, self.kmeans_iterations, KMeans::init_kmeanplusplus, &config))
            .min_by_key(|state| OrderedFloat(state.distsum));
        match best {
            Some(state) => fill_empty_clusters(state.assignments, k),
            None => Vec::new(),
        }
    }
}

/// Modified Gram-Schmidt over the columns, in place.
fn orthonormalize(basis: &mut Array2<float>) {
    for c in 0..basis.ncols() {
        for u in 0..c {
            let prev = basis.column(u).to_owned();
            let dot = prev.dot(&basis.column(c));
            basis.column_mut(c).scaled_add(-dot, &prev);
        }
        let norm = basis.column(c).dot(&basis.column(c)).sqrt();
        if norm > 1e-12 {
            basis.column_mut(c).mapv_inplace(|x| x / norm);
        }
    }
}

/// Moves one vertex from the most populated cluster into each empty one.
///
/// Identical embedding rows (e.g. a graph with fewer distinct eigenvalues
/// than `k`) leave Lloyd with empty clusters.
pub fn fill_empty_clusters(mut labels: Vec<usize>, k: usize) -> Vec<usize> {
    if labels.len() < k {
        return labels;
    }
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); k];
    for (v, &l) in labels.iter().enumerate() {
        if l < k {
            members[l].push(v);
        }
    }
    for empty in 0..k {
        if !members[empty].is_empty() {
            continue;
        }
        let donor = (0..k).max_by_key(|&c| members[c].len()).unwrap_or(empty);
        if let Some(v) = members[donor].pop() {
            labels[v] = empty;
            members[empty].push(v);
        }
    }
    labels
}

impl InitialPartitioner for SpectralClustering {
    fn name(&self) -> &str {
        "spectral"
    }

    fn partition(&self, hgraph: &Hypergraph, num_parts: usize, seed: u64) -> Option<Vec<usize>> {
        let n = hgraph.num_vertices();
        if num_parts < 2 || n < num_parts {
            return None;
        }
        let mut rng = seeded_rng(seed);
        let embedding = self.embed(hgraph, num_parts, &mut rng);
        let labels = self.cluster(&embedding, num_parts, seed);
        (labels.len() == n).then(|| dense_labels(&labels))
    }
}

/// Renumbers labels by first appearance.
pub fn dense_labels(labels: &[usize]) -> Vec<usize> {
    let mut map: Dict<usize, usize> = Dict::new();
    labels
        .iter()
        .map(|&l| {
            let next = map.len();
            *map.entry(l).or_insert(next)
        })
        .collect()
}

// --------------------------------------------------------------------------------
// ### External tools
// --------------------------------------------------------------------------------

fn run_shell(tool: &str, command: &str) -> Result<String> {
    debug!(target:"internal", "Running command: {command}");
    let failure = |msg: String| ChipletError::ExternalTool {
        tool: tool.to_string(),
        msg,
    };
    let output = Command::new("bash")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| failure(format!("failed to start: {e}")))?;
    if !output.status.success() {
        return Err(failure(format!(
            "exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses whitespace separated labels. Negative or malformed entries, or a
/// count different from `expected`, reject the whole result.
fn parse_labels(tool: &str, text: &str, expected: usize) -> Option<Vec<usize>> {
    let labels: std::result::Result<Vec<i64>, _> = text.split_whitespace().map(str::parse::<i64>).collect();
    let labels = match labels {
        Ok(labels) => labels,
        Err(e) => {
            warn!("{tool}: malformed output: {e}");
            return None;
        }
    };
    if labels.len() != expected {
        warn!("{tool}: expected {expected} labels, got {}", labels.len());
        return None;
    }
    if labels.iter().any(|&l| l < 0) {
        warn!("{tool}: unassigned vertices in result");
        return None;
    }
    Some(labels.into_iter().map(|l| l.usize()).collect())
}

/// Multilevel graph partitioner run as a separate process.
///
/// The command template may use `{graph}` and `{k}`; the tool is expected
/// to write `<graph>.part.<k>` next to the graph file.
#[derive(Debug, Clone, new)]
pub struct ExternalPartitioner {
    pub command: String,
    pub work_dir: PathBuf,
}

impl InitialPartitioner for ExternalPartitioner {
    fn name(&self) -> &str {
        "multilevel"
    }

    fn partition(&self, hgraph: &Hypergraph, num_parts: usize, _seed: u64) -> Option<Vec<usize>> {
        if num_parts < 2 {
            return None;
        }
        let graph = self
            .work_dir
            .join(format!("chiplet_part_{}_{num_parts}.graph", std::process::id()));
        if let Err(e) = hgraph.write_metis_graph(&graph) {
            warn!("{}: {e}", self.name());
            return None;
        }
        let command = self
            .command
            .replace("{graph}", &graph.display().to_string())
            .replace("{k}", &num_parts.to_string());
        if let Err(e) = run_shell(self.name(), &command) {
            warn!("{e}");
            let _ = fs::remove_file(&graph);
            return None;
        }
        let part_file = PathBuf::from(format!("{}.part.{num_parts}", graph.display()));
        let text = match fs::read_to_string(&part_file) {
            Ok(text) => text,
            Err(e) => {
                warn!("{}: cannot read {}: {e}", self.name(), part_file.display());
                return None;
            }
        };
        let _ = fs::remove_file(&graph);
        let _ = fs::remove_file(&part_file);
        parse_labels(self.name(), &text, hgraph.num_vertices())
            .filter(|labels| labels.iter().all(|&l| l < num_parts))
    }
}

/// Embedding service run as a separate process that prints one cluster
/// label per vertex. The command template may use `{hgraph}` and `{k}`.
#[derive(Debug, Clone, new)]
pub struct ExternalEmbedding {
    pub command: String,
    pub work_dir: PathBuf,
}

impl InitialPartitioner for ExternalEmbedding {
    fn name(&self) -> &str {
        "embedding"
    }

    fn partition(&self, hgraph: &Hypergraph, num_parts: usize, _seed: u64) -> Option<Vec<usize>> {
        let path = self
            .work_dir
            .join(format!("chiplet_part_{}_{num_parts}.hgr", std::process::id()));
        if let Err(e) = hgraph.write_hmetis(&path) {
            warn!("{}: {e}", self.name());
            return None;
        }
        let command = self
            .command
            .replace("{hgraph}", &path.display().to_string())
            .replace("{k}", &num_parts.to_string());
        let stdout = run_shell(self.name(), &command).map_err(|e| warn!("{e}")).ok();
        let _ = fs::remove_file(&path);
        let labels = dense_labels(&parse_labels(self.name(), &stdout?, hgraph.num_vertices())?);
        if labels.iter().any(|&l| l >= num_parts.max(1)) {
            warn!("{}: more clusters than the {num_parts} requested", self.name());
            return None;
        }
        Some(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypergraph::tests::path_graph;

    /// Two 5-cliques joined by the edge 4-5.
    fn two_clusters() -> Hypergraph {
        let mut edges = Vec::new();
        for base in [0, 5] {
            for a in base..base + 5 {
                for b in a + 1..base + 5 {
                    edges.push(vec![a, b]);
                }
            }
        }
        edges.push(vec![4, 5]);
        Hypergraph::builder().num_vertices(10).hyperedges(edges).build().unwrap()
    }

    #[test]
    fn test_crossbar_needs_enough_seeds() {
        let g = path_graph(1.0, 1.0);
        let cb = CrossbarExpansion::new(0.99, 0.6);
        assert!(cb.expand(&g, &[1], 2).is_empty());
        assert!(cb.expand(&g, &[], 1).is_empty());
        assert!(cb.partition(&g, 4, 0).is_none());
    }

    #[test]
    fn test_crossbar_assigns_every_vertex() {
        let g = two_clusters();
        let cb = CrossbarExpansion::new(0.9, 0.6);
        let crossbars = cb.find_crossbars(&g);
        assert_eq!(crossbars, vec![4, 5]);
        let part = cb.expand(&g, &crossbars, 2);
        assert_eq!(part.len(), 10);
        assert!(part.iter().all(|&p| p < 2));
        assert_ne!(part[4], part[5]);
    }

    #[test]
    fn test_kway_respects_size_limits() {
        let g = Hypergraph::builder()
            .num_vertices(103)
            .hyperedges((1..103).map(|v| vec![v - 1, v]).collect())
            .build()
            .unwrap();
        let kway = RandomKWay::new(1.1);
        let (_, upper) = kway.size_limits(103, 4);
        for seed in 0..5 {
            let part = kway.partition(&g, 4, seed).unwrap();
            let mut sizes = vec![0; 4];
            part.iter().for_each(|&p| sizes[p] += 1);
            for p in 0..4 {
                assert!(sizes[p] <= upper[p], "seed {seed}: {sizes:?}");
            }
        }
        assert_eq!(kway.partition(&g, 4, 9), kway.partition(&g, 4, 9));
    }

    #[test]
    fn test_spectral_separates_clusters() {
        let g = two_clusters();
        let part = SpectralClustering::default().partition(&g, 2, 1).unwrap();
        assert!(part[..5].iter().all(|&p| p == part[0]));
        assert!(part[5..].iter().all(|&p| p == part[5]));
        assert_ne!(part[0], part[5]);
    }

    #[test]
    fn test_spectral_splits_a_single_edge() {
        let g = Hypergraph::builder()
            .num_vertices(2)
            .hyperedges(vec![vec![0, 1]])
            .build()
            .unwrap();
        for seed in 0..4 {
            let part = SpectralClustering::default().partition(&g, 2, seed).unwrap();
            assert_ne!(part[0], part[1], "seed {seed}");
        }
    }

    #[test]
    fn test_fill_empty_clusters() {
        assert_eq!(fill_empty_clusters(vec![0, 0, 0], 2).iter().unique().count(), 2);
        assert_eq!(fill_empty_clusters(vec![2, 2, 2, 1], 3).iter().unique().count(), 3);
        assert_eq!(fill_empty_clusters(vec![1, 0], 2), vec![1, 0]);
        assert_eq!(fill_empty_clusters(vec![0], 2), vec![0]);
    }

    #[test]
    fn test_external_tools_degrade_to_none() {
        let g = path_graph(1.0, 1.0);
        let dir = std::env::temp_dir();
        assert!(ExternalPartitioner::new("false".into(), dir.clone()).partition(&g, 2, 0).is_none());
        let ok = ExternalEmbedding::new("echo 3 3 7 7 7".into(), dir.clone());
        assert_eq!(ok.partition(&g, 2, 0), Some(vec![0, 0, 1, 1, 1]));
        let unassigned = ExternalEmbedding::new("echo 0 -1 1 1 1".into(), dir.clone());
        assert!(unassigned.partition(&g, 2, 0).is_none());
        let short = ExternalEmbedding::new("echo 0 1".into(), dir);
        assert!(short.partition(&g, 2, 0).is_none());
    }

    #[test]
    fn test_shell_failures_name_the_tool() {
        assert_eq!(run_shell("echo", "echo 1 2").unwrap().trim(), "1 2");
        match run_shell("fail", "echo oops >&2; exit 3") {
            Err(ChipletError::ExternalTool { tool, msg }) => {
                assert_eq!(tool, "fail");
                assert!(msg.contains("oops"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

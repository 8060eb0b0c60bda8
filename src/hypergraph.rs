use crate::*;

/// Upper bound on buffers sized from a file header.
const MAX_PREALLOC: usize = 1 << 16;

/// Block-level netlist. Built once and only read afterwards.
///
/// Incidence is stored twice in CSR form: `eptr/eind` lists the vertices of
/// each hyperedge, `vptr/vind` lists the hyperedges touching each vertex.
#[derive(Debug, Clone)]
pub struct Hypergraph {
    num_vertices: usize,
    vertex_dimensions: usize,
    eptr: Vec<usize>,
    eind: Vec<usize>,
    vptr: Vec<usize>,
    vind: Vec<usize>,
    vertex_weights: Vec<Vec<float>>,
    hyperedge_weights: Vec<Vec<float>>,
    reaches: Vec<float>,
    io_sizes: Vec<float>,
}

#[bon]
impl Hypergraph {
    /// Hyperedges with fewer than two distinct vertices are dropped and
    /// hyperedges over an already seen vertex set are merged into the first one.
    #[builder]
    pub fn new(
        num_vertices: usize,
        hyperedges: Vec<Vec<usize>>,
        vertex_weights: Option<Vec<Vec<float>>>,
        hyperedge_weights: Option<Vec<Vec<float>>>,
        reaches: Option<Vec<float>>,
        io_sizes: Option<Vec<float>>,
        #[builder(default = 1.0)] default_reach: float,
        #[builder(default = 1.0)] default_io_size: float,
    ) -> Result<Self> {
        let num_input = hyperedges.len();
        let check_len = |what: &str, len: usize, expected: usize| -> Result<()> {
            if len != expected {
                return Err(ChipletError::InvalidHypergraph(format!(
                    "{what} has {len} entries, expected {expected}"
                )));
            }
            Ok(())
        };
        let vertex_weights = vertex_weights.unwrap_or_else(|| vec![vec![1.0]; num_vertices]);
        check_len("vertex_weights", vertex_weights.len(), num_vertices)?;
        let vertex_dimensions = vertex_weights.first().map_or(1, |w| w.len());
        if vertex_weights.iter().any(|w| w.len() != vertex_dimensions) {
            return Err(ChipletError::InvalidHypergraph(
                "vertex weights have inconsistent dimensions".into(),
            ));
        }
        let hyperedge_weights = hyperedge_weights.unwrap_or_else(|| vec![vec![1.0]; num_input]);
        check_len("hyperedge_weights", hyperedge_weights.len(), num_input)?;
        let reaches = reaches.unwrap_or_else(|| vec![default_reach; num_input]);
        check_len("reaches", reaches.len(), num_input)?;
        let io_sizes = io_sizes.unwrap_or_else(|| vec![default_io_size; num_input]);
        check_len("io_sizes", io_sizes.len(), num_input)?;

        let mut seen: Dict<Vec<usize>, usize> = Dict::new();
        let mut graph = Hypergraph {
            num_vertices,
            vertex_dimensions,
            eptr: vec![0],
            eind: Vec::new(),
            vptr: Vec::new(),
            vind: Vec::new(),
            vertex_weights,
            hyperedge_weights: Vec::new(),
            reaches: Vec::new(),
            io_sizes: Vec::new(),
        };
        for (e, edge) in hyperedges.into_iter().enumerate() {
            if let Some(&v) = edge.iter().find(|&&v| v >= num_vertices) {
                return Err(ChipletError::InvalidHypergraph(format!(
                    "hyperedge {e} references vertex {v} but there are only {num_vertices} vertices"
                )));
            }
            let members = edge.into_iter().unique().collect_vec();
            if members.len() < 2 {
                continue;
            }
            let key = members.iter().copied().sorted_unstable().collect_vec();
            if seen.contains_key(&key) {
                continue;
            }
            seen.insert(key, graph.reaches.len());
            graph.eind.extend_from_slice(&members);
            graph.eptr.push(graph.eind.len());
            graph.hyperedge_weights.push(hyperedge_weights[e].clone());
            graph.reaches.push(reaches[e]);
            graph.io_sizes.push(io_sizes[e]);
        }
        if graph.reaches.len() < num_input {
            debug!(
                "Dropped {} degenerate or duplicate hyperedges",
                num_input - graph.reaches.len()
            );
        }
        graph.build_incidence();
        Ok(graph)
    }
}

impl Hypergraph {
    fn build_incidence(&mut self) {
        let mut incident = vec![Vec::new(); self.num_vertices];
        for e in 0..self.num_hyperedges() {
            for &v in self.vertices(e) {
                incident[v].push(e);
            }
        }
        self.vptr = Vec::with_capacity(self.num_vertices + 1);
        self.vptr.push(0);
        self.vind.clear();
        for edges in incident {
            self.vind.extend(edges);
            self.vptr.push(self.vind.len());
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }
    pub fn num_hyperedges(&self) -> usize {
        self.eptr.len() - 1
    }
    pub fn vertex_dimensions(&self) -> usize {
        self.vertex_dimensions
    }
    pub fn vertices(&self, e: usize) -> &[usize] {
        &self.eind[self.eptr[e]..self.eptr[e + 1]]
    }
    pub fn edges(&self, v: usize) -> &[usize] {
        &self.vind[self.vptr[v]..self.vptr[v + 1]]
    }
    pub fn degree(&self, v: usize) -> usize {
        self.vptr[v + 1] - self.vptr[v]
    }
    pub fn vertex_weight(&self, v: usize) -> &[float] {
        &self.vertex_weights[v]
    }
    pub fn hyperedge_weight(&self, e: usize) -> &[float] {
        &self.hyperedge_weights[e]
    }
    pub fn reach(&self, e: usize) -> float {
        self.reaches[e]
    }
    pub fn io_size(&self, e: usize) -> float {
        self.io_sizes[e]
    }

    /// Distinct vertices sharing at least one hyperedge with `v`, ascending.
    pub fn neighbors(&self, v: usize) -> Vec<usize> {
        self.edges(v)
            .iter()
            .flat_map(|&e| self.vertices(e).iter().copied())
            .filter(|&u| u != v)
            .sorted_unstable()
            .dedup()
            .collect()
    }

    pub fn total_vertex_weights(&self) -> Vec<float> {
        let mut total = vec![0.0; self.vertex_dimensions];
        for w in &self.vertex_weights {
            for (t, x) in total.iter_mut().zip(w) {
                *t += x;
            }
        }
        total
    }

    /// Summed vertex weight of each part, one row per part.
    pub fn block_balance(&self, partition: &[usize], num_parts: usize) -> Vec<Vec<float>> {
        let mut balance = vec![vec![0.0; self.vertex_dimensions]; num_parts];
        for (v, &p) in partition.iter().enumerate() {
            for (b, w) in balance[p].iter_mut().zip(&self.vertex_weights[v]) {
                *b += w;
            }
        }
        balance
    }

    /// Per-part weight bounds for an even `num_parts`-way split with
    /// `ub_factor` percent of slack on either side.
    pub fn balance_bounds(&self, num_parts: usize, ub_factor: float) -> (Vec<Vec<float>>, Vec<Vec<float>>) {
        let total = self.total_vertex_weights();
        let base = 1.0 / num_parts.max(1).float();
        let slack = ub_factor * 0.01;
        let upper = total.iter().map(|t| t * (base + slack)).collect_vec();
        let lower = total.iter().map(|t| t * (base - slack).max(0.0)).collect_vec();
        (vec![upper; num_parts], vec![lower; num_parts])
    }

    /// Bounds that never bind, used when only the floorplan should constrain.
    pub fn unconstrained_bounds(&self, num_parts: usize) -> (Vec<Vec<float>>, Vec<Vec<float>>) {
        let total = self.total_vertex_weights();
        let upper = total.iter().map(|t| t + 1.0).collect_vec();
        let lower = vec![-1.0; self.vertex_dimensions];
        (vec![upper; num_parts], vec![lower; num_parts])
    }

    /// Sum of weight times (parts spanned - 1) over every hyperedge.
    pub fn connectivity_cost(&self, partition: &[usize]) -> float {
        (0..self.num_hyperedges())
            .map(|e| {
                let span = self.vertices(e).iter().map(|&v| partition[v]).unique().count();
                self.hyperedge_weights[e][0] * (span.float() - 1.0)
            })
            .sum()
    }

    pub fn check_partition(&self, partition: &[usize]) -> Result<usize> {
        if partition.len() != self.num_vertices {
            return Err(ChipletError::InvalidPartition(format!(
                "partition has {} entries but the hypergraph has {} vertices",
                partition.len(),
                self.num_vertices
            )));
        }
        Ok(partition.iter().max().map_or(0, |m| m + 1))
    }

    // --------------------------------------------------------------------------------
    // ### Text formats
    // --------------------------------------------------------------------------------

    /// Reads the hMETIS style format.
    ///
    /// Header `num_hyperedges num_vertices [fmt]`. With `fmt % 10 == 1` every
    /// edge line starts with `weight reach io_size`; with `fmt >= 10` vertex
    /// weight lines follow the edges. Vertex ids are 1-based.
    pub fn from_file(path: impl AsRef<Path>, default_reach: float, default_io_size: float) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ChipletError::io(path, e))?;
        let mut lines = BufReader::new(file)
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l))
            .filter(|(_, l)| l.as_ref().map_or(true, |s| !s.trim().is_empty() && !s.starts_with('%')));

        let mut next_line = |what: &str| -> Result<(usize, Vec<String>)> {
            match lines.next() {
                Some((n, Ok(text))) => Ok((n, text.split_whitespace().map(str::to_string).collect())),
                Some((_, Err(e))) => Err(ChipletError::io(path, e)),
                None => Err(ChipletError::parse(path, 0, format!("unexpected end of file, expected {what}"))),
            }
        };
        let parse_num = |n: usize, tok: &str| -> Result<float> {
            tok.parse::<float>()
                .ok()
                .filter(|x| x.is_finite())
                .ok_or_else(|| ChipletError::parse(path, n, format!("`{tok}` is not a finite number")))
        };
        let parse_count = |n: usize, tok: &str| -> Result<usize> {
            tok.parse::<usize>()
                .map_err(|_| ChipletError::parse(path, n, format!("`{tok}` is not a non-negative integer")))
        };

        let (n, header) = next_line("header")?;
        if header.len() < 2 {
            return Err(ChipletError::parse(path, n, "header needs at least two fields"));
        }
        let num_hyperedges = parse_count(n, &header[0])?;
        let num_vertices = parse_count(n, &header[1])?;
        let fmt = match header.get(2) {
            Some(tok) => parse_count(n, tok)?,
            None => 0,
        };
        let edge_meta = fmt % 10 == 1;
        let has_vertex_weights = fmt >= 10;

        // header counts are untrusted until the lines are actually there
        let capacity = num_hyperedges.min(MAX_PREALLOC);
        let mut hyperedges = Vec::with_capacity(capacity);
        let mut weights = Vec::with_capacity(capacity);
        let mut reaches = Vec::with_capacity(capacity);
        let mut io_sizes = Vec::with_capacity(capacity);
        for _ in 0..num_hyperedges {
            let (n, tokens) = next_line("hyperedge")?;
            let (meta, ids) = if edge_meta {
                if tokens.len() < 4 {
                    return Err(ChipletError::parse(path, n, "expected `weight reach io_size v1 v2 ...`"));
                }
                tokens.split_at(3)
            } else {
                tokens.split_at(0)
            };
            let mut edge = Vec::with_capacity(ids.len());
            for tok in ids {
                let id = parse_count(n, tok)?;
                if !(1..=num_vertices).contains(&id) {
                    return Err(ChipletError::parse(path, n, format!("vertex id {tok} out of range")));
                }
                edge.push(id - 1);
            }
            hyperedges.push(edge);
            if edge_meta {
                weights.push(vec![parse_num(n, &meta[0])?]);
                reaches.push(parse_num(n, &meta[1])?);
                io_sizes.push(parse_num(n, &meta[2])?);
            } else {
                weights.push(vec![1.0]);
                reaches.push(default_reach);
                io_sizes.push(default_io_size);
            }
        }

        let vertex_weights = if has_vertex_weights {
            let mut vw = Vec::with_capacity(num_vertices.min(MAX_PREALLOC));
            for _ in 0..num_vertices {
                let (n, tokens) = next_line("vertex weight")?;
                let w = tokens.iter().map(|t| parse_num(n, t)).collect::<Result<Vec<_>>>()?;
                vw.push(w);
            }
            Some(vw)
        } else {
            None
        };

        let graph = Hypergraph::builder()
            .num_vertices(num_vertices)
            .hyperedges(hyperedges)
            .maybe_vertex_weights(vertex_weights)
            .hyperedge_weights(weights)
            .reaches(reaches)
            .io_sizes(io_sizes)
            .build()?;
        info!(
            target:"internal",
            "Loaded {}: {} vertices, {} hyperedges",
            path.display(),
            graph.num_vertices(),
            graph.num_hyperedges()
        );
        Ok(graph)
    }

    /// Writes the graph back in the format read by [`Hypergraph::from_file`].
    pub fn write_hmetis(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let io_err = |e| ChipletError::io(path, e);
        let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
        writeln!(out, "{} {} 11", self.num_hyperedges(), self.num_vertices).map_err(io_err)?;
        for e in 0..self.num_hyperedges() {
            let ids = self.vertices(e).iter().map(|v| (v + 1).to_string()).join(" ");
            writeln!(
                out,
                "{} {} {} {}",
                self.hyperedge_weights[e][0], self.reaches[e], self.io_sizes[e], ids
            )
            .map_err(io_err)?;
        }
        for w in &self.vertex_weights {
            writeln!(out, "{}", w.iter().join(" ")).map_err(io_err)?;
        }
        out.flush().map_err(io_err)
    }

    /// Writes the clique expansion as a METIS graph with integer edge weights.
    pub fn write_metis_graph(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let io_err = |e| ChipletError::io(path, e);
        let mut adjacency: Vec<IndexMap<usize, float>> = vec![IndexMap::default(); self.num_vertices];
        for e in 0..self.num_hyperedges() {
            let members = self.vertices(e);
            let w = self.hyperedge_weights[e][0] / (members.len().float() - 1.0);
            for (&a, &b) in members.iter().tuple_combinations() {
                *adjacency[a].entry(b).or_insert(0.0) += w;
                *adjacency[b].entry(a).or_insert(0.0) += w;
            }
        }
        let num_edges = adjacency.iter().map(|a| a.len()).sum::<usize>() / 2;
        let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
        writeln!(out, "{} {} 001", self.num_vertices, num_edges).map_err(io_err)?;
        for row in &adjacency {
            let line = row
                .iter()
                .map(|(u, w)| format!("{} {}", u + 1, w.round().max(1.0).int()))
                .join(" ");
            writeln!(out, "{}", line).map_err(io_err)?;
        }
        out.flush().map_err(io_err)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Path 0-1-2-3-4 with unit weights.
    pub(crate) fn path_graph(weight: float, reach: float) -> Hypergraph {
        Hypergraph::builder()
            .num_vertices(5)
            .hyperedges(vec![vec![0, 1], vec![1, 2], vec![2, 3], vec![3, 4]])
            .vertex_weights(vec![vec![weight]; 5])
            .default_reach(reach)
            .default_io_size(1.0)
            .build()
            .unwrap()
    }

    /// Triangles 0-1-2 and 3-4-5 joined by the edge 2-3, every net with zero reach.
    pub(crate) fn bridged_triangles() -> Hypergraph {
        Hypergraph::builder()
            .num_vertices(6)
            .hyperedges(vec![
                vec![0, 1],
                vec![1, 2],
                vec![0, 2],
                vec![3, 4],
                vec![4, 5],
                vec![3, 5],
                vec![2, 3],
            ])
            .vertex_weights(vec![vec![20.0]; 6])
            .default_reach(0.0)
            .default_io_size(1.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_and_degenerate_edges_are_dropped() {
        let g = Hypergraph::builder()
            .num_vertices(4)
            .hyperedges(vec![vec![0, 1, 2], vec![2, 1, 0], vec![3, 3], vec![1, 3]])
            .build()
            .unwrap();
        assert_eq!(g.num_hyperedges(), 2);
        assert_eq!(g.vertices(0), &[0, 1, 2]);
        assert_eq!(g.edges(1), &[0, 1]);
        assert_eq!(g.neighbors(1), vec![0, 2, 3]);
        assert_eq!(g.degree(3), 1);
    }

    #[test]
    fn test_out_of_range_vertex_is_rejected() {
        let g = Hypergraph::builder()
            .num_vertices(2)
            .hyperedges(vec![vec![0, 2]])
            .build();
        assert!(matches!(g, Err(ChipletError::InvalidHypergraph(_))));
    }

    #[test]
    fn test_balance_helpers() {
        let g = path_graph(10.0, 5.0);
        assert_eq!(g.total_vertex_weights(), vec![50.0]);
        let balance = g.block_balance(&[0, 0, 1, 1, 1], 2);
        assert_eq!(balance, vec![vec![20.0], vec![30.0]]);
        let (upper, lower) = g.balance_bounds(2, 10.0);
        assert!((upper[0][0] - 30.0).abs() < 1e-9);
        assert!((lower[1][0] - 20.0).abs() < 1e-9);
        assert_eq!(g.connectivity_cost(&[0, 0, 1, 1, 1]), 1.0);
    }

    #[test]
    fn test_hmetis_round_trip() {
        let g = path_graph(3.0, 7.5);
        let path = std::env::temp_dir().join("chiplet_part_roundtrip.hgr");
        g.write_hmetis(&path).unwrap();
        let h = Hypergraph::from_file(&path, 1.0, 1.0).unwrap();
        assert_eq!(h.num_vertices(), 5);
        assert_eq!(h.num_hyperedges(), 4);
        assert_eq!(h.vertices(2), &[2, 3]);
        assert_eq!(h.reach(0), 7.5);
        assert_eq!(h.vertex_weight(4), &[3.0]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_plain_format_uses_defaults() {
        let path = std::env::temp_dir().join("chiplet_part_plain.hgr");
        fs::write(&path, "% comment\n2 3\n1 2\n2 3\n").unwrap();
        let g = Hypergraph::from_file(&path, 4.0, 0.5).unwrap();
        assert_eq!(g.num_hyperedges(), 2);
        assert_eq!(g.reach(1), 4.0);
        assert_eq!(g.io_size(0), 0.5);
        assert_eq!(g.vertex_weight(0), &[1.0]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_malformed_file_reports_line() {
        let path = std::env::temp_dir().join("chiplet_part_bad.hgr");
        fs::write(&path, "1 2 1\n1.0 2.0 x 1 2\n").unwrap();
        match Hypergraph::from_file(&path, 1.0, 1.0) {
            Err(ChipletError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_malformed_counts_are_parse_errors() {
        let cases = [
            ("negative_header", "-1 5\n", 1),
            ("nan_header", "nan 5\n", 1),
            ("fractional_header", "1.5 2\n1 2\n", 1),
            ("nan_vertex", "1 2\n1 nan\n", 2),
            ("zero_vertex", "1 2\n0 1\n", 2),
            ("fractional_vertex", "1 2\n1 1.5\n", 2),
            ("nan_reach", "1 2 1\n1 nan 1 1 2\n", 2),
        ];
        for (name, text, expected) in cases {
            let path = std::env::temp_dir().join(format!("chiplet_part_{name}.hgr"));
            fs::write(&path, text).unwrap();
            match Hypergraph::from_file(&path, 1.0, 1.0) {
                Err(ChipletError::Parse { line, .. }) => assert_eq!(line, expected, "{name}"),
                other => panic!("{name}: unexpected result {other:?}"),
            }
            let _ = fs::remove_file(&path);
        }
    }

    #[test]
    fn test_huge_header_fails_at_end_of_file() {
        let path = std::env::temp_dir().join("chiplet_part_huge.hgr");
        fs::write(&path, format!("{} 3\n1 2\n", usize::MAX)).unwrap();
        assert!(matches!(
            Hypergraph::from_file(&path, 1.0, 1.0),
            Err(ChipletError::Parse { line: 0, .. })
        ));
        let _ = fs::remove_file(&path);
    }
}

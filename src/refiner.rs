use crate::*;

/// Heap levels `get_best_candidate` may descend before giving up.
const MAXIMUM_TRAVERSE_LEVEL: usize = 25;
/// Share of interior vertices mixed into a boundary-only pass.
const RANDOM_NON_BOUNDARY_RATIO: f64 = 0.05;
/// Effort cap of the per-move floorplan check.
const FEASIBILITY_STEPS: usize = 100;
const FEASIBILITY_PERTURBATIONS: usize = 100;

/// Chiplet-level view of a partition, one chiplet per non-empty part.
#[derive(Debug, Clone, Default)]
pub struct ChipletNetlist {
    /// Part id of every chiplet, in order of first appearance.
    pub parts: Vec<usize>,
    pub areas: Vec<float>,
    pub nets: Vec<BundledNet>,
}

impl ChipletNetlist {
    pub fn len(&self) -> usize {
        self.parts.len()
    }
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
    pub fn build_chiplets(&self, halo_width: float) -> Vec<Chiplet> {
        self.areas.iter().map(|&a| Chiplet::square(a, halo_width)).collect()
    }
}

/// Collapses the hypergraph onto the parts of `partition`.
///
/// A hyperedge spanning several parts becomes one bundled net between the
/// first two distinct chiplets met along its pin list.
pub fn generate_netlist(hgraph: &Hypergraph, partition: &[usize]) -> ChipletNetlist {
    let num_parts = partition.iter().max().map_or(0, |m| m + 1);
    let mut cluster_of: Vec<Option<usize>> = vec![None; num_parts];
    let mut netlist = ChipletNetlist::default();
    for (v, &p) in partition.iter().enumerate() {
        let c = match cluster_of[p] {
            Some(c) => c,
            None => {
                netlist.parts.push(p);
                netlist.areas.push(0.0);
                cluster_of[p] = Some(netlist.parts.len() - 1);
                netlist.parts.len() - 1
            }
        };
        netlist.areas[c] += hgraph.vertex_weight(v).iter().sum::<float>();
    }
    for e in 0..hgraph.num_hyperedges() {
        let mut terminals = hgraph
            .vertices(e)
            .iter()
            .filter_map(|&v| cluster_of[partition[v]])
            .dedup();
        if let (Some(a), Some(b)) = (terminals.next(), terminals.next()) {
            netlist.nets.push(BundledNet::new(
                (a, b),
                hgraph.hyperedge_weight(e)[0],
                hgraph.reach(e),
                hgraph.io_size(e),
            ));
        }
    }
    netlist
}

/// What the floorplanner concluded about the current partition, indexed by part.
#[derive(Debug, Clone, PartialEq)]
pub struct FloorplanVerdict {
    pub aspect_ratios: Vec<float>,
    pub x: Vec<float>,
    pub y: Vec<float>,
    pub cost: float,
    pub valid: bool,
}

/// Gain-driven k-way refinement against a [`CostModel`], with the
/// floorplanner kept in the loop for geometry.
pub struct ChipletRefiner {
    hgraph: Arc<Hypergraph>,
    cost_model: Arc<dyn CostModel>,
    config: PartitionConfig,
    num_parts: usize,
    max_moves: usize,
    refine_iters: usize,
    geometry: Geometry,
    slopes: Slopes,
    /// Running estimate of the objective, resynchronised after every pass.
    current_cost: float,
    warm_start: Option<(Vec<usize>, Vec<usize>)>,
    rng: StdRng,
    last_pass_moves: usize,
}

#[bon]
impl ChipletRefiner {
    #[builder]
    pub fn new(
        hgraph: Arc<Hypergraph>,
        cost_model: Arc<dyn CostModel>,
        config: &PartitionConfig,
        num_parts: usize,
        techs: Option<Vec<usize>>,
        max_moves: Option<usize>,
        refine_iters: Option<usize>,
        #[builder(default = 0)] seed_offset: u64,
    ) -> Self {
        let num_parts = num_parts.max(1);
        let n = hgraph.num_vertices();
        let max_moves =
            max_moves.unwrap_or_else(|| (n.float() * config.max_moves_ratio).ceil().usize().max(1));
        let geometry = Geometry::with_techs(techs.unwrap_or_default()).padded(num_parts);
        let slopes = cost_model.init_slopes(num_parts);
        ChipletRefiner {
            hgraph,
            cost_model,
            num_parts,
            max_moves,
            refine_iters: refine_iters.unwrap_or(config.refine_iters),
            geometry,
            slopes,
            current_cost: 0.0,
            warm_start: None,
            rng: seeded_rng(config.seed + seed_offset),
            last_pass_moves: 0,
            config: config.clone(),
        }
    }
}

impl ChipletRefiner {
    pub fn hgraph(&self) -> &Arc<Hypergraph> {
        &self.hgraph
    }
    pub fn num_parts(&self) -> usize {
        self.num_parts
    }
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }
    pub fn slopes(&self) -> &Slopes {
        &self.slopes
    }
    pub fn current_cost(&self) -> float {
        self.current_cost
    }
    pub fn max_moves(&self) -> usize {
        self.max_moves
    }
    pub fn set_max_moves(&mut self, max_moves: usize) {
        self.max_moves = max_moves;
    }
    pub fn refine_iters(&self) -> usize {
        self.refine_iters
    }
    pub fn set_refine_iters(&mut self, refine_iters: usize) {
        self.refine_iters = refine_iters;
    }
    /// Moves kept by the most recent pass.
    pub fn last_pass_moves(&self) -> usize {
        self.last_pass_moves
    }

    /// Replaces the technology of every part. Geometry, slopes and the
    /// floorplan warm start are reset since they no longer apply.
    pub fn set_techs(&mut self, techs: Vec<usize>) {
        self.num_parts = self.num_parts.max(techs.len());
        self.geometry = Geometry::with_techs(techs).padded(self.num_parts);
        self.slopes = self.cost_model.init_slopes(self.num_parts);
        self.warm_start = None;
    }

    pub fn set_geometry(&mut self, geometry: Geometry) {
        self.geometry = geometry.padded(self.num_parts);
    }

    /// Full cost model evaluation, independent of the running estimate.
    pub fn cost_from_scratch(&self, partition: &[usize], approx: bool) -> float {
        self.cost_model.evaluate(&self.hgraph, partition, &self.geometry, approx)
    }

    pub fn update_slopes(&mut self, partition: &[usize]) {
        self.slopes = self.cost_model.slopes(&self.hgraph, partition, &self.geometry);
        self.slopes.area.resize(self.num_parts, 1.0);
        self.slopes.bandwidth.resize(self.num_parts, 1.0);
    }

    fn ensure_parts(&mut self, partition: &[usize]) {
        let needed = partition.iter().max().map_or(1, |m| m + 1);
        if needed > self.num_parts {
            self.num_parts = needed;
            self.geometry = self.geometry.padded(needed);
            self.slopes.area.resize(needed, 1.0);
            self.slopes.bandwidth.resize(needed, 1.0);
        }
    }

    // --------------------------------------------------------------------------------
    // ### Floorplanning
    // --------------------------------------------------------------------------------

    /// Packs the parts of `partition` and adopts the resulting geometry.
    ///
    /// The winning sequence pair is kept as the starting point of the next
    /// call with the same number of chiplets, and the slopes are refreshed
    /// against the new geometry.
    pub fn run_floorplanner(
        &mut self,
        partition: &[usize],
        max_steps: usize,
        perturbations: usize,
        cooling_acceleration: float,
    ) -> FloorplanVerdict {
        self.ensure_parts(partition);
        let netlist = generate_netlist(&self.hgraph, partition);
        let chiplets = netlist.build_chiplets(self.config.separation);
        let warm_start = self
            .warm_start
            .as_ref()
            .filter(|(pos, _)| pos.len() == chiplets.len())
            .map(|(pos, neg)| (pos.as_slice(), neg.as_slice()));
        let outcome = anneal_parallel()
            .chiplets(&chiplets)
            .nets(&netlist.nets)
            .config(&self.config.sa)
            .max_steps(max_steps)
            .perturbations(perturbations)
            .cooling_acceleration(cooling_acceleration)
            .seed(self.config.seed)
            .maybe_warm_start(warm_start)
            .call();

        let k = self.num_parts;
        let mut verdict = FloorplanVerdict {
            aspect_ratios: vec![1.0; k],
            x: vec![0.0; k],
            y: vec![0.0; k],
            cost: outcome.cost,
            valid: outcome.valid,
        };
        for (c, &p) in netlist.parts.iter().enumerate() {
            if let Some(m) = outcome.macros.get(c) {
                verdict.aspect_ratios[p] = m.aspect_ratio();
                verdict.x[p] = m.real_x();
                verdict.y[p] = m.real_y();
            }
        }
        self.geometry.aspect_ratios = verdict.aspect_ratios.clone();
        self.geometry.x = verdict.x.clone();
        self.geometry.y = verdict.y.clone();
        self.warm_start = Some((outcome.pos_seq, outcome.neg_seq));
        self.update_slopes(partition);
        verdict
    }

    /// Whether moving `v` to `to` still floorplans. The partition itself is
    /// left untouched; only the floorplan warm start of a feasible move is kept.
    pub fn check_floorplan_feasible(&mut self, partition: &[usize], v: usize, to: usize) -> bool {
        let mut moved = partition.to_vec();
        moved[v] = to;
        let geometry = self.geometry.clone();
        let slopes = self.slopes.clone();
        let warm_start = self.warm_start.clone();
        let verdict = self.run_floorplanner(
            &moved,
            self.config.floorplan_steps.min(FEASIBILITY_STEPS),
            self.config.floorplan_perturbations.min(FEASIBILITY_PERTURBATIONS),
            self.config.cooling_acceleration,
        );
        self.geometry = geometry;
        self.slopes = slopes;
        if !verdict.valid {
            self.warm_start = warm_start;
        }
        verdict.valid
    }

    // --------------------------------------------------------------------------------
    // ### Refinement
    // --------------------------------------------------------------------------------

    /// Improves `partition` in place while every part stays inside
    /// `[lower, upper]`. Runs up to `refine_iters` passes and stops at the
    /// first pass that gains nothing.
    pub fn refine(&mut self, partition: &mut [usize], upper: &[Vec<float>], lower: &[Vec<float>]) {
        self.ensure_parts(partition);
        let approx = self.config.approx_state;
        self.update_slopes(partition);
        self.current_cost = self.cost_from_scratch(partition, approx);
        self.last_pass_moves = 0;
        if self.max_moves == 0 {
            return;
        }
        let mut balance = self.hgraph.block_balance(partition, self.num_parts);
        let mut net_degs = self.net_degrees(partition);
        for iter in 0..self.refine_iters {
            if self.config.floorplan_each_pass {
                self.run_floorplanner(
                    partition,
                    self.config.floorplan_steps,
                    self.config.floorplan_perturbations,
                    self.config.cooling_acceleration,
                );
                self.current_cost = self.cost_from_scratch(partition, approx);
            }
            let gain = self.pass(partition, upper, lower, &mut balance, &mut net_degs);
            self.current_cost = self.cost_from_scratch(partition, approx);
            debug!(
                "Pass {iter}: {} moves, gain {gain:.4}, cost {:.4}",
                self.last_pass_moves, self.current_cost
            );
            if gain <= 0.0 {
                break;
            }
            self.update_slopes(partition);
        }
    }

    /// Pin count of every hyperedge in every part.
    fn net_degrees(&self, partition: &[usize]) -> Vec<Vec<u32>> {
        (0..self.hgraph.num_hyperedges())
            .map(|e| {
                let mut degs = vec![0u32; self.num_parts];
                for &v in self.hgraph.vertices(e) {
                    degs[partition[v]] += 1;
                }
                degs
            })
            .collect()
    }

    /// Vertices on a cut hyperedge plus a random share of the others.
    fn find_boundary_vertices(&mut self, net_degs: &[Vec<u32>]) -> Vec<usize> {
        let n = self.hgraph.num_vertices();
        let mut boundary = vec![false; n];
        for (e, degs) in net_degs.iter().enumerate() {
            if degs.iter().filter(|&&d| d > 0).count() > 1 {
                for &v in self.hgraph.vertices(e) {
                    boundary[v] = true;
                }
            }
        }
        (0..n)
            .filter(|&v| boundary[v] || self.rng.random_bool(RANDOM_NON_BOUNDARY_RATIO))
            .collect()
    }

    /// Benefit of moving `v` from `from` to `to`; positive means cheaper.
    fn vertex_gain(&self, v: usize, from: usize, to: usize, partition: &[usize], net_degs: &[Vec<u32>]) -> VertexGain {
        if from == to {
            return VertexGain::new(v, from, to, 0.0);
        }
        if self.config.exact_gain {
            let mut moved = partition.to_vec();
            moved[v] = to;
            let gain = self.current_cost - self.cost_from_scratch(&moved, self.config.approx_state);
            return VertexGain::new(v, from, to, gain);
        }
        let w = self.hgraph.vertex_weight(v)[0];
        let mut delta_cost = (self.slopes.area[to] - self.slopes.area[from]) * w;
        let mut delta_span = 0.0;
        for &e in self.hgraph.edges(v) {
            let degs = &net_degs[e];
            let span_before = degs.iter().filter(|&&d| d > 0).count();
            let span_after = span_before - usize::from(degs[from] == 1) + usize::from(degs[to] == 0);
            let io = self.hgraph.io_size(e);
            for (p, &d) in degs.iter().enumerate() {
                let after = d + u32::from(p == to) - u32::from(p == from);
                let was_cut = d > 0 && span_before > 1;
                let is_cut = after > 0 && span_after > 1;
                if was_cut != is_cut {
                    let sign = if is_cut { 1.0 } else { -1.0 };
                    delta_cost += sign * self.slopes.bandwidth[p] * io;
                }
            }
            delta_span += self.hgraph.hyperedge_weight(e)[0]
                * (span_after.float() - span_before.float());
        }
        VertexGain::new(v, from, to, -delta_cost - self.config.connectivity_weight * delta_span)
    }

    /// Best feasible move over all destination buckets.
    fn pick_move(
        &self,
        buckets: &[PriorityQueue],
        balance: &[Vec<float>],
        upper: &[Vec<float>],
        lower: &[Vec<float>],
    ) -> Option<VertexGain> {
        buckets
            .iter()
            .filter_map(|bucket| bucket.get_best_candidate(balance, upper, lower))
            .fold(None, |best: Option<VertexGain>, c| match best {
                Some(b) if b.gain >= c.gain => Some(b),
                _ => Some(c),
            })
    }

    fn pass(
        &mut self,
        partition: &mut [usize],
        upper: &[Vec<float>],
        lower: &[Vec<float>],
        balance: &mut [Vec<float>],
        net_degs: &mut [Vec<u32>],
    ) -> float {
        let n = self.hgraph.num_vertices();
        let k = self.num_parts;
        let candidates = if self.config.boundary_flag {
            self.find_boundary_vertices(net_degs)
        } else {
            (0..n).collect_vec()
        };
        let mut locked = vec![false; n];
        let mut buckets = (0..k)
            .map(|_| PriorityQueue::new(self.hgraph.clone(), MAXIMUM_TRAVERSE_LEVEL))
            .collect_vec();
        {
            let (this, part, degs) = (&*self, &*partition, &*net_degs);
            let gains: Vec<Vec<VertexGain>> = (0..k)
                .into_par_iter()
                .map(|to| {
                    candidates
                        .iter()
                        .filter(|&&v| part[v] != to)
                        .map(|&v| this.vertex_gain(v, part[v], to, part, degs))
                        .collect()
                })
                .collect();
            for (bucket, gains) in buckets.iter_mut().zip(gains) {
                gains.into_iter().for_each(|g| bucket.insert(g));
            }
        }

        let mut trace: Vec<VertexGain> = Vec::new();
        let mut total_gain = 0.0;
        let mut best_gain = 0.0;
        let mut best_len = 0;
        let mut uphill = 0;
        while trace.len() < self.max_moves {
            let Some(candidate) = self.pick_move(&buckets, balance, upper, lower) else {
                break;
            };
            if candidate.gain <= 0.0 {
                if uphill >= self.config.hill_climb_moves {
                    break;
                }
                uphill += 1;
            }
            let v = candidate.vertex;
            if self.config.check_move_feasibility
                && !self.check_floorplan_feasible(partition, v, candidate.destination_part)
            {
                buckets[candidate.destination_part].remove(v);
                continue;
            }

            move_vertex(&self.hgraph, &candidate, false, partition, balance, net_degs);
            locked[v] = true;
            buckets.iter_mut().for_each(|b| {
                b.remove(v);
            });
            total_gain += candidate.gain;
            self.current_cost -= candidate.gain;
            trace.push(candidate);
            if total_gain > best_gain {
                best_gain = total_gain;
                best_len = trace.len();
            }

            // gains only move through shared hyperedges unless every
            // candidate is scored against the full model
            let affected = if self.config.exact_gain {
                candidates.iter().copied().filter(|&u| !locked[u]).collect_vec()
            } else {
                self.hgraph.neighbors(v).into_iter().filter(|&u| !locked[u]).collect_vec()
            };
            for (to, bucket) in buckets.iter_mut().enumerate() {
                for &u in &affected {
                    let from = partition[u];
                    if from == to {
                        continue;
                    }
                    let gain = self.vertex_gain(u, from, to, partition, net_degs);
                    if !bucket.change_priority(u, gain) {
                        bucket.insert(gain);
                    }
                }
            }
        }

        for m in trace.drain(best_len..).rev() {
            move_vertex(&self.hgraph, &m, true, partition, balance, net_degs);
            self.current_cost += m.gain;
        }
        self.last_pass_moves = best_len;
        best_gain
    }
}

/// Applies a move, or takes it back when `undo` is set.
fn move_vertex(
    hgraph: &Hypergraph,
    m: &VertexGain,
    undo: bool,
    partition: &mut [usize],
    balance: &mut [Vec<float>],
    net_degs: &mut [Vec<u32>],
) {
    let (from, to) = if undo {
        (m.destination_part, m.source_part)
    } else {
        (m.source_part, m.destination_part)
    };
    debug_assert_eq!(partition[m.vertex], from, "move map out of sync");
    partition[m.vertex] = to;
    for (d, w) in hgraph.vertex_weight(m.vertex).iter().enumerate() {
        balance[from][d] -= w;
        balance[to][d] += w;
    }
    for &e in hgraph.edges(m.vertex) {
        net_degs[e][from] -= 1;
        net_degs[e][to] += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypergraph::tests::path_graph;
    use pretty_assertions::assert_eq;

    /// Objective equal to the connectivity cut, with exact slopes.
    struct CutCost;

    impl CostModel for CutCost {
        fn evaluate(&self, hgraph: &Hypergraph, partition: &[usize], _: &Geometry, _: bool) -> float {
            hgraph.connectivity_cost(partition)
        }
        fn slopes(&self, _: &Hypergraph, partition: &[usize], geometry: &Geometry) -> Slopes {
            let k = partition.iter().max().map_or(1, |m| m + 1).max(geometry.num_parts());
            Slopes {
                area: vec![0.0; k],
                bandwidth: vec![0.5; k],
            }
        }
    }

    fn refiner(hgraph: Hypergraph, cost_model: Arc<dyn CostModel>, config: &PartitionConfig, k: usize) -> ChipletRefiner {
        ChipletRefiner::builder()
            .hgraph(Arc::new(hgraph))
            .cost_model(cost_model)
            .config(config)
            .num_parts(k)
            .build()
    }

    #[test]
    fn test_generate_netlist_orders_parts_by_appearance() {
        let g = path_graph(10.0, 5.0);
        let netlist = generate_netlist(&g, &[2, 2, 0, 0, 1]);
        assert_eq!(netlist.parts, vec![2, 0, 1]);
        assert_eq!(netlist.areas, vec![20.0, 20.0, 10.0]);
        let terminals = netlist.nets.iter().map(|n| n.terminals).collect_vec();
        assert_eq!(terminals, vec![(0, 1), (1, 2)]);
        assert_eq!(netlist.build_chiplets(0.1).len(), 3);
    }

    #[test]
    fn test_path_partition_floorplans_legally() {
        let config = PartitionConfig::default();
        let cost_model = Arc::new(
            ManufacturingCostModel::builder()
                .library(Arc::new(DesignLibrary::builtin()))
                .build(),
        );
        let mut r = refiner(path_graph(100.0, 10.0), cost_model, &config, 2);
        let partition = vec![0, 0, 0, 1, 1];
        let verdict = r.run_floorplanner(&partition, 1000, 100, 0.95);
        assert!(verdict.valid);
        assert_eq!(verdict.aspect_ratios.len(), 2);
        assert_eq!(r.geometry().x, verdict.x);
        assert!(r.check_floorplan_feasible(&partition, 2, 1));
    }

    #[test]
    fn test_local_optimum_pass_applies_no_moves() {
        let config = PartitionConfig::builder().auto_size(false).build();
        let g = path_graph(1.0, 5.0);
        let (upper, lower) = g.unconstrained_bounds(2);
        let mut r = refiner(g, Arc::new(CutCost), &config, 2);
        let mut partition = vec![0, 0, 0, 1, 1];
        r.refine(&mut partition, &upper, &lower);
        assert_eq!(r.last_pass_moves(), 0);
        assert_eq!(partition, vec![0, 0, 0, 1, 1]);
        assert_eq!(r.current_cost(), 1.0);
    }

    #[test]
    fn test_refine_reduces_cut() {
        let config = PartitionConfig::default();
        let g = path_graph(1.0, 5.0);
        let (upper, lower) = g.unconstrained_bounds(2);
        let mut r = refiner(g, Arc::new(CutCost), &config, 2);
        let mut partition = vec![0, 1, 0, 1, 0];
        let before = r.cost_from_scratch(&partition, true);
        r.refine(&mut partition, &upper, &lower);
        let after = r.cost_from_scratch(&partition, true);
        assert_eq!(before, 4.0);
        assert!(after < before);
        assert_eq!(r.current_cost(), after);
    }

    #[test]
    fn test_refine_respects_balance() {
        let config = PartitionConfig::default();
        let g = path_graph(1.0, 5.0);
        let (upper, lower) = g.balance_bounds(2, 30.0);
        let mut r = refiner(g.clone(), Arc::new(CutCost), &config, 2);
        let mut partition = vec![0, 1, 0, 1, 0];
        r.refine(&mut partition, &upper, &lower);
        for (p, b) in g.block_balance(&partition, 2).iter().enumerate() {
            assert!(b[0] >= lower[p][0] && b[0] <= upper[p][0], "part {p} weighs {}", b[0]);
        }
        assert!(g.connectivity_cost(&partition) < 4.0);
    }

    #[test]
    fn test_cost_from_scratch_is_idempotent() {
        let config = PartitionConfig::default();
        let cost_model = Arc::new(
            ManufacturingCostModel::builder()
                .library(Arc::new(DesignLibrary::builtin()))
                .build(),
        );
        let r = refiner(path_graph(30.0, 5.0), cost_model, &config, 2);
        let partition = vec![0, 0, 1, 1, 1];
        assert_eq!(r.cost_from_scratch(&partition, false), r.cost_from_scratch(&partition, false));
    }

    #[test]
    fn test_set_techs_resets_geometry() {
        let config = PartitionConfig::default();
        let mut r = refiner(path_graph(1.0, 5.0), Arc::new(CutCost), &config, 2);
        r.set_techs(vec![1, 2, 3]);
        assert_eq!(r.num_parts(), 3);
        assert_eq!(r.geometry().techs, vec![1, 2, 3]);
        assert_eq!(r.slopes().area.len(), 3);
    }
}

use crate::*;

/// Placement snapshot the refiner hands to the cost model, one entry per part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Geometry {
    pub techs: Vec<usize>,
    pub aspect_ratios: Vec<float>,
    pub x: Vec<float>,
    pub y: Vec<float>,
}

impl Geometry {
    pub fn uniform(num_parts: usize, tech: usize) -> Self {
        Geometry {
            techs: vec![tech; num_parts],
            aspect_ratios: vec![1.0; num_parts],
            x: vec![0.0; num_parts],
            y: vec![0.0; num_parts],
        }
    }

    pub fn with_techs(techs: Vec<usize>) -> Self {
        let n = techs.len();
        Geometry {
            techs,
            aspect_ratios: vec![1.0; n],
            x: vec![0.0; n],
            y: vec![0.0; n],
        }
    }

    pub fn num_parts(&self) -> usize {
        self.techs.len()
    }

    /// Extends every vector to `num_parts` entries: square dies at the
    /// origin in the first technology.
    pub fn padded(&self, num_parts: usize) -> Geometry {
        let first = self.techs.first().copied().unwrap_or(0);
        let pad = |v: &[float], fill: float| {
            let mut v = v.to_vec();
            v.resize(num_parts.max(v.len()), fill);
            v
        };
        let mut techs = self.techs.clone();
        techs.resize(num_parts.max(techs.len()), first);
        Geometry {
            techs,
            aspect_ratios: pad(&self.aspect_ratios, 1.0),
            x: pad(&self.x, 0.0),
            y: pad(&self.y, 0.0),
        }
    }
}

/// Partial derivatives of the objective per part, with respect to the
/// summed block weight and the off-chip bandwidth of that part.
#[derive(Debug, Clone, PartialEq)]
pub struct Slopes {
    pub area: Vec<float>,
    pub bandwidth: Vec<float>,
}

/// Objective consulted by the refiner. Implementations must be pure
/// functions of their inputs.
pub trait CostModel: Send + Sync {
    fn evaluate(&self, hgraph: &Hypergraph, partition: &[usize], geometry: &Geometry, approx: bool) -> float;

    fn init_slopes(&self, num_parts: usize) -> Slopes {
        Slopes {
            area: vec![1.0; num_parts],
            bandwidth: vec![1.0; num_parts],
        }
    }

    fn slopes(&self, hgraph: &Hypergraph, partition: &[usize], geometry: &Geometry) -> Slopes;
}

/// Aggregate seen by the cost model for one chiplet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChipletSummary {
    pub weight: float,
    pub bandwidth: float,
}

/// Per-part weight and cut bandwidth. A cut hyperedge adds its io size to
/// every part it touches.
pub fn summarize(hgraph: &Hypergraph, partition: &[usize], num_parts: usize) -> Vec<ChipletSummary> {
    let mut summaries = vec![ChipletSummary::default(); num_parts];
    for (v, &p) in partition.iter().enumerate() {
        summaries[p].weight += hgraph.vertex_weight(v)[0];
    }
    let mut touched = Vec::new();
    for e in 0..hgraph.num_hyperedges() {
        touched.clear();
        touched.extend(hgraph.vertices(e).iter().map(|&v| partition[v]));
        touched.sort_unstable();
        touched.dedup();
        if touched.len() > 1 {
            for &p in &touched {
                summaries[p].bandwidth += hgraph.io_size(e);
            }
        }
    }
    summaries
}

/// Dies of `x_dim` by `y_dim` that fit on a wafer, counting full rows of
/// dies along horizontal chords. Both row alignments are tried and the
/// better one is kept.
pub fn dies_per_wafer(x_dim: float, y_dim: float, usable_diameter: float, dicing_distance: float) -> usize {
    if x_dim <= 0.0 || y_dim <= 0.0 || usable_diameter <= 0.0 {
        return 0;
    }
    let x_eff = x_dim + dicing_distance;
    let y_eff = y_dim + dicing_distance;
    let r = usable_diameter * 0.5;
    let half_dicing = dicing_distance * 0.5;
    let row_count = move |height: float| -> usize {
        let offset = height - half_dicing;
        if offset >= r {
            return 0;
        }
        let chord = (r * r - offset * offset).sqrt() * 2.0 + dicing_distance;
        (chord / x_eff).floor().usize()
    };

    // (height of the row's outer edge, copies of the row)
    let mut rows = vec![(y_eff * 0.5, 1)];
    let mut h = y_eff * 1.5;
    while h - half_dicing < r {
        rows.push((h, 2));
        h += y_eff;
    }
    let centred_rows = rows.len();
    let mut h = y_eff;
    while h - half_dicing < r {
        rows.push((h, 2));
        h += y_eff;
    }
    let counts = map_reduce(
        rows.into_iter().enumerate().collect_vec(),
        |(i, (height, copies))| (i < centred_rows, row_count(height) * copies),
        (0usize, 0usize),
        |(a, b), (centred, n)| if centred { (a + n, b) } else { (a, b + n) },
    );
    counts.0.max(counts.1)
}

/// Share of a (possibly stitched) reticle field that is filled with dies.
pub fn reticle_utilization(area: float, reticle_x: float, reticle_y: float) -> float {
    let field = reticle_x * reticle_y;
    if area <= 0.0 || field <= 0.0 {
        return 1.0;
    }
    let fields = (area / field).ceil().max(1.0);
    let reticle_area = fields * field;
    let dies = (reticle_area / area).floor();
    (dies * area) / reticle_area
}

/// Manufacturing cost plus power, driven by a [`DesignLibrary`].
#[derive(Debug, Clone)]
pub struct ManufacturingCostModel {
    library: Arc<DesignLibrary>,
    cost_coef: float,
    power_coef: float,
}

#[bon]
impl ManufacturingCostModel {
    #[builder]
    pub fn new(
        library: Arc<DesignLibrary>,
        #[builder(default = 1.0)] cost_coef: float,
        #[builder(default = 0.0)] power_coef: float,
    ) -> Self {
        ManufacturingCostModel {
            library,
            cost_coef,
            power_coef,
        }
    }
}

/// Penalty multiplier for dies that do not fit on the wafer.
const OVERSIZE_PENALTY: float = 10.0;

impl ManufacturingCostModel {
    pub fn library(&self) -> &DesignLibrary {
        &self.library
    }

    /// Node of every part; an index outside the library is a config error.
    pub fn techs_of(&self, geometry: &Geometry) -> Result<Vec<&TechNode>> {
        geometry
            .techs
            .iter()
            .map(|&t| {
                self.library.techs.get(t).ok_or_else(|| {
                    ChipletError::Config(format!(
                        "technology index {t} is outside the library ({} nodes)",
                        self.library.techs.len()
                    ))
                })
            })
            .collect()
    }

    /// Silicon area of a chiplet including its interface cells.
    pub fn die_area(&self, summary: &ChipletSummary, tech: &TechNode) -> float {
        summary.weight * tech.area_scale + tech.io.area_per_unit * summary.bandwidth
    }

    /// Cost of one known-good die.
    pub fn die_cost(&self, area: float, aspect_ratio: float, tech: &TechNode) -> float {
        if area <= 0.0 {
            return 0.0;
        }
        let wafer = &tech.wafer;
        let ar = aspect_ratio.clamp(0.2, 5.0);
        let x_dim = (area * ar).sqrt();
        let y_dim = (area / ar).sqrt();
        let dpw = dies_per_wafer(x_dim, y_dim, wafer.usable_diameter(), wafer.dicing_distance);
        let raw = if dpw == 0 {
            wafer.wafer_cost * OVERSIZE_PENALTY
        } else {
            wafer.wafer_cost / dpw.float()
        };
        let litho = tech.layers.iter().map(|l| l.litho_percent()).fold(0.0, float::max);
        let raw = if litho > 0.0 {
            let util = reticle_utilization(area, wafer.reticle_x(), wafer.reticle_y());
            raw * (1.0 - litho) + raw * litho / util
        } else {
            raw
        };
        let die_yield = wafer.wafer_process_yield
            * tech.layers.iter().map(|l| l.layer_yield(area)).product::<float>();
        let test = &self.library.test;
        let test_cost = test.cost_per_second * test.seconds_per_mm2 * area;
        // escapes that slip past test are paid for again at assembly
        let effective_yield = 1.0 - (1.0 - die_yield) * test.defect_coverage();
        (raw + test_cost) / effective_yield.max(1e-6)
    }

    fn package_area(&self, areas: &[float], geometry: &Geometry, approx: bool) -> float {
        let total: float = areas.iter().sum();
        if approx {
            return total * self.library.assembly.package_overhead();
        }
        let mut bbox: Option<(float, float, float, float)> = None;
        for (p, &area) in areas.iter().enumerate() {
            if area <= 0.0 {
                continue;
            }
            let ar = geometry.aspect_ratios[p].clamp(0.2, 5.0);
            let (w, h) = ((area * ar).sqrt(), (area / ar).sqrt());
            let (x, y) = (geometry.x[p], geometry.y[p]);
            bbox = Some(match bbox {
                None => (x, y, x + w, y + h),
                Some((lx, ly, ux, uy)) => (lx.min(x), ly.min(y), ux.max(x + w), uy.max(y + h)),
            });
        }
        bbox.map_or(0.0, |(lx, ly, ux, uy)| ((ux - lx) * (uy - ly)).max(total))
    }

    /// Cost and power of a set of chiplets.
    pub fn cost_and_power(
        &self,
        summaries: &[ChipletSummary],
        geometry: &Geometry,
        approx: bool,
    ) -> Result<(float, float)> {
        let techs = self.techs_of(geometry)?;
        let areas = summaries
            .iter()
            .enumerate()
            .map(|(p, s)| if s.weight > 0.0 { self.die_area(s, techs[p]) } else { 0.0 })
            .collect_vec();
        let mut die_costs = 0.0;
        let mut power = 0.0;
        let mut num_dies = 0;
        for (p, s) in summaries.iter().enumerate() {
            if areas[p] <= 0.0 {
                continue;
            }
            num_dies += 1;
            let tech = techs[p];
            die_costs += self.die_cost(areas[p], geometry.aspect_ratios[p], tech);
            power += areas[p] * tech.power_density + tech.io.energy_per_unit * s.bandwidth;
        }
        let assembly = &self.library.assembly;
        let package_cost = self.package_area(&areas, geometry, approx) * assembly.materials_cost_per_mm2
            + num_dies.float() * (assembly.picknplace_cost_per_die + assembly.bonding_cost_per_die);
        let assembly_yield = (assembly.bonding_yield * assembly.alignment_yield()).powi(num_dies.i32());
        Ok(((die_costs + package_cost) / assembly_yield, power))
    }

    pub fn objective(&self, summaries: &[ChipletSummary], geometry: &Geometry, approx: bool) -> Result<float> {
        let (cost, power) = self.cost_and_power(summaries, geometry, approx)?;
        Ok(self.cost_coef * cost + self.power_coef * power)
    }
}

impl CostModel for ManufacturingCostModel {
    fn evaluate(&self, hgraph: &Hypergraph, partition: &[usize], geometry: &Geometry, approx: bool) -> float {
        let num_parts = partition.iter().max().map_or(1, |m| m + 1).max(geometry.num_parts());
        let geometry = geometry.padded(num_parts);
        let summaries = summarize(hgraph, partition, num_parts);
        self.objective(&summaries, &geometry, approx).unwrap_or_else(|e| {
            warn!("{e}");
            float::MAX
        })
    }

    fn slopes(&self, hgraph: &Hypergraph, partition: &[usize], geometry: &Geometry) -> Slopes {
        let num_parts = partition.iter().max().map_or(1, |m| m + 1).max(geometry.num_parts());
        let geometry = geometry.padded(num_parts);
        let summaries = summarize(hgraph, partition, num_parts);
        let mut slopes = Slopes {
            area: vec![0.0; num_parts],
            bandwidth: vec![0.0; num_parts],
        };
        let Ok(base) = self.objective(&summaries, &geometry, true) else {
            return slopes;
        };
        // same geometry as `base`, so the bumped evaluations cannot fail
        let objective = |bumped: &[ChipletSummary]| self.objective(bumped, &geometry, true).unwrap_or(base);
        for p in 0..num_parts {
            let step = (summaries[p].weight * 0.01).max(1e-2);
            let mut bumped = summaries.clone();
            bumped[p].weight += step;
            slopes.area[p] = (objective(bumped.as_slice()) - base) / step;

            let step = (summaries[p].bandwidth * 0.01).max(1e-2);
            let mut bumped = summaries.clone();
            bumped[p].bandwidth += step;
            // an empty part cannot carry bandwidth on its own
            if bumped[p].weight <= 0.0 {
                bumped[p].weight = step;
            }
            slopes.bandwidth[p] = if summaries[p].weight > 0.0 {
                (objective(bumped.as_slice()) - base) / step
            } else {
                slopes.area[p]
            };
        }
        slopes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypergraph::tests::path_graph;

    fn model() -> ManufacturingCostModel {
        ManufacturingCostModel::builder()
            .library(Arc::new(DesignLibrary::builtin()))
            .build()
    }

    #[test]
    fn test_dies_per_wafer_is_sane() {
        // 10x10 mm dies on a 294 mm usable wafer: a few hundred
        let n = dies_per_wafer(10.0, 10.0, 294.0, 0.1);
        let upper = (std::f64::consts::PI * 147.0 * 147.0 / 100.0) as usize;
        assert!(n > 500 && n <= upper, "{n}");
        // smaller dies always fit at least as many
        assert!(dies_per_wafer(5.0, 5.0, 294.0, 0.1) > n);
        assert_eq!(dies_per_wafer(400.0, 400.0, 294.0, 0.1), 0);
        assert_eq!(dies_per_wafer(0.0, 10.0, 294.0, 0.1), 0);
    }

    #[test]
    fn test_reticle_utilization() {
        assert!((reticle_utilization(858.0, 26.0, 33.0) - 1.0).abs() < 1e-9);
        let u = reticle_utilization(500.0, 26.0, 33.0);
        assert!(u > 0.5 && u < 0.6);
    }

    #[test]
    fn test_summary_counts_cut_bandwidth() {
        let g = path_graph(10.0, 5.0);
        let s = summarize(&g, &[0, 0, 1, 1, 1], 2);
        assert_eq!(s[0].weight, 20.0);
        assert_eq!(s[1].weight, 30.0);
        assert_eq!(s[0].bandwidth, 1.0);
        assert_eq!(s[1].bandwidth, 1.0);
    }

    #[test]
    fn test_evaluate_is_idempotent() {
        let g = path_graph(50.0, 5.0);
        let m = model();
        let part = vec![0, 0, 1, 1, 1];
        let geometry = Geometry::uniform(2, 3);
        let a = m.evaluate(&g, &part, &geometry, false);
        let b = m.evaluate(&g, &part, &geometry, false);
        assert_eq!(a, b);
        assert!(a > 0.0);
    }

    #[test]
    fn test_cut_costs_more_than_no_cut_for_tiny_design() {
        // assembly overhead dominates for small dies
        let g = path_graph(2.0, 5.0);
        let m = model();
        let single = m.evaluate(&g, &[0; 5], &Geometry::uniform(1, 0), true);
        let split = m.evaluate(&g, &[0, 0, 1, 1, 1], &Geometry::uniform(2, 0), true);
        assert!(split > single);
    }

    #[test]
    fn test_slopes_are_positive_and_sized() {
        let g = path_graph(40.0, 5.0);
        let m = model();
        let slopes = m.slopes(&g, &[0, 0, 1, 1, 1], &Geometry::uniform(3, 0));
        assert_eq!(slopes.area.len(), 3);
        assert!(slopes.area.iter().all(|&s| s > 0.0));
        assert!(slopes.bandwidth[0] > 0.0);
        assert_eq!(m.init_slopes(4).area, vec![1.0; 4]);
    }

    #[test]
    fn test_geometry_padding() {
        let g = Geometry::with_techs(vec![2]).padded(3);
        assert_eq!(g.techs, vec![2, 2, 2]);
        assert_eq!(g.aspect_ratios, vec![1.0; 3]);
        assert_eq!(g.x.len(), 3);
    }

    #[test]
    fn test_unknown_tech_is_rejected() {
        let g = path_graph(40.0, 5.0);
        let m = model();
        let geometry = Geometry::with_techs(vec![0, 99]);
        assert!(matches!(m.techs_of(&geometry), Err(ChipletError::Config(_))));
        assert_eq!(m.evaluate(&g, &[0, 0, 1, 1, 1], &geometry, true), float::MAX);
        let slopes = m.slopes(&g, &[0, 0, 1, 1, 1], &geometry);
        assert!(slopes.area.iter().chain(&slopes.bandwidth).all(|&s| s == 0.0));
        assert_eq!(m.techs_of(&Geometry::uniform(2, 1)).unwrap().len(), 2);
    }
}

use crate::*;
use std::collections::BTreeSet;

/// Connection between two chiplets after collapsing a hyperedge onto the parts.
#[derive(Debug, Clone, PartialEq, new)]
pub struct BundledNet {
    pub terminals: (usize, usize),
    pub weight: float,
    pub reach: float,
    pub io_area: float,
}

/// Soft rectangle placed by the annealer.
///
/// `x`/`y`/`get_width()`/`get_height()` include the halo on every side,
/// the `real_*` accessors describe the die itself.
#[derive(Debug, Clone, PartialEq, new)]
pub struct Chiplet {
    pub x: float,
    pub y: float,
    pub width: float,
    pub height: float,
    pub min_area: float,
    pub halo_width: float,
    #[new(value = "0.2")]
    pub min_ar: float,
    #[new(value = "5.0")]
    pub max_ar: float,
}

impl Chiplet {
    /// Square die of the given area at the origin.
    pub fn square(area: float, halo_width: float) -> Self {
        let side = area.max(0.0).sqrt();
        let height = if side > 0.0 { area / side } else { 0.0 };
        Chiplet::new(0.0, 0.0, side, height, area, halo_width)
    }

    pub fn get_width(&self) -> float {
        self.width + 2.0 * self.halo_width
    }
    pub fn get_height(&self) -> float {
        self.height + 2.0 * self.halo_width
    }
    pub fn real_x(&self) -> float {
        self.x + self.halo_width
    }
    pub fn real_y(&self) -> float {
        self.y + self.halo_width
    }
    pub fn area(&self) -> float {
        self.width * self.height
    }
    /// Width over height of the die.
    pub fn aspect_ratio(&self) -> float {
        self.width / self.height.max(1e-3)
    }

    /// Outer width including halo; the die keeps its area and stays inside
    /// the aspect-ratio bounds.
    pub fn set_width(&mut self, outer_width: float) {
        if outer_width <= 2.0 * self.halo_width {
            return;
        }
        let area = self.min_area.max(self.area());
        let min_width = (area * self.min_ar).sqrt();
        let max_width = (area * self.max_ar).sqrt();
        self.width = (outer_width - 2.0 * self.halo_width).clamp(min_width, max_width);
        self.height = area / self.width;
    }

    pub fn set_height(&mut self, outer_height: float) {
        if outer_height <= 2.0 * self.halo_width {
            return;
        }
        let area = self.area().max(self.min_area);
        let min_height = (area / self.max_ar).sqrt();
        let max_height = (area / self.min_ar).sqrt();
        self.height = (outer_height - 2.0 * self.halo_width).clamp(min_height, max_height);
        self.width = area / self.height;
    }

    /// Grows the die into the given outer box. Ignored unless both sides grow.
    pub fn set_shape(&mut self, outer_width: float, outer_height: float) {
        if outer_width <= self.get_width() || outer_height <= self.get_height() {
            return;
        }
        let width = outer_width - 2.0 * self.halo_width;
        let height = outer_height - 2.0 * self.halo_width;
        let aspect_ratio = (width / height).clamp(self.min_ar, self.max_ar);
        let area = (width * height).max(self.min_area);
        self.height = (area / aspect_ratio).sqrt();
        self.width = area / self.height;
    }

    pub fn resize_with_aspect_ratio(&mut self, aspect_ratio: float) {
        let area = self.area().max(self.min_area);
        self.height = (area / aspect_ratio).sqrt();
        self.width = area / self.height;
    }

    /// Outer rectangles of two chiplets intersect with positive area.
    pub fn overlaps(&self, other: &Chiplet) -> bool {
        let eps = 1e-9;
        self.x + self.get_width() > other.x + eps
            && other.x + other.get_width() > self.x + eps
            && self.y + self.get_height() > other.y + eps
            && other.y + other.get_height() > self.y + eps
    }
}

/// Estimated wire length of a bundled net between two placed dies.
pub fn net_length(a: &Chiplet, b: &Chiplet, io_area: float) -> float {
    let (lx_a, ly_a) = (a.real_x(), a.real_y());
    let (ux_a, uy_a) = (lx_a + a.width, ly_a + a.height);
    let (lx_b, ly_b) = (b.real_x(), b.real_y());
    let (ux_b, uy_b) = (lx_b + b.width, ly_b + b.height);
    if uy_a.min(uy_b) > ly_a.max(ly_b) {
        // side by side, facing edges share a vertical span
        let w = uy_a.min(uy_b) - ly_a.max(ly_b);
        let h = lx_a.max(lx_b) - ux_a.min(ux_b);
        h + 2.0 * ((w * w + 2.0 * io_area).sqrt() - w)
    } else if ux_a.min(ux_b) > lx_a.max(lx_b) {
        let w = ux_a.min(ux_b) - lx_a.max(lx_b);
        let h = ly_a.max(ly_b) - uy_a.min(uy_b);
        h + 2.0 * ((w * w + 2.0 * io_area).sqrt() - w)
    } else {
        let center_a = ((lx_a + ux_a) * 0.5, (ly_a + uy_a) * 0.5);
        let center_b = ((lx_b + ux_b) * 0.5, (ly_b + uy_b) * 0.5);
        let width = (a.width + b.width) * 0.5;
        let height = (a.height + b.height) * 0.5;
        norm1(center_a, center_b) - width - height + 2.0 * (2.0 * io_area).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    PosSwap,
    NegSwap,
    DoubleSwap,
    Resize,
    Expand,
}

/// Net penalty tolerated by a legal floorplan.
const NET_PENALTY_TOLERANCE: float = 0.01;
const INIT_TEMPERATURE: float = 1.0;

/// Sequence-pair simulated annealing over a fixed set of chiplets.
pub struct SaCore {
    worker_id: usize,
    macros: Vec<Chiplet>,
    nets: Vec<BundledNet>,
    area_penalty_weight: float,
    package_penalty_weight: float,
    net_penalty_weight: float,
    action_thresholds: [float; 4],
    max_num_step: usize,
    num_perturb_per_step: usize,
    cooling_rate: float,
    min_temperature: float,
    rng: StdRng,

    pos_seq: Vec<usize>,
    neg_seq: Vec<usize>,
    width: float,
    height: float,
    area_penalty: float,
    package_penalty: float,
    net_penalty: float,
    norm_area_penalty: float,
    norm_package_penalty: float,
    norm_net_penalty: float,

    pre_pos_seq: Vec<usize>,
    pre_neg_seq: Vec<usize>,
    pre_macros: Vec<Chiplet>,
    pre_metrics: [float; 5],
    action: Action,

    cost_history: Vec<float>,
    temperature_history: Vec<float>,
}

#[bon]
impl SaCore {
    #[builder]
    pub fn new(
        #[builder(default = 0)] worker_id: usize,
        chiplets: Vec<Chiplet>,
        nets: Vec<BundledNet>,
        config: &SaConfig,
        max_num_step: usize,
        num_perturb_per_step: usize,
        #[builder(default = 0.95)] cooling_rate: float,
        #[builder(default = 0)] seed: u64,
    ) -> Self {
        let n = chiplets.len();
        let t1 = config.pos_swap_prob;
        let t2 = t1 + config.neg_swap_prob;
        let t3 = t2 + config.double_swap_prob;
        let t4 = t3 + config.resize_prob;
        SaCore {
            worker_id,
            pre_macros: chiplets.clone(),
            macros: chiplets,
            nets,
            area_penalty_weight: config.area_penalty_weight,
            package_penalty_weight: config.package_penalty_weight,
            net_penalty_weight: config.net_penalty_weight,
            action_thresholds: [t1, t2, t3, t4],
            max_num_step,
            num_perturb_per_step,
            cooling_rate,
            min_temperature: config.min_temperature,
            rng: StdRng::seed_from_u64(seed),
            pos_seq: (0..n).collect(),
            neg_seq: (0..n).collect(),
            width: 0.0,
            height: 0.0,
            area_penalty: 0.0,
            package_penalty: 0.0,
            net_penalty: 0.0,
            norm_area_penalty: 1.0,
            norm_package_penalty: 1.0,
            norm_net_penalty: 1.0,
            pre_pos_seq: (0..n).collect(),
            pre_neg_seq: (0..n).collect(),
            pre_metrics: [0.0; 5],
            action: Action::None,
            cost_history: Vec::new(),
            temperature_history: Vec::new(),
        }
    }
}

impl SaCore {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }
    pub fn macros(&self) -> &[Chiplet] {
        &self.macros
    }
    pub fn nets(&self) -> &[BundledNet] {
        &self.nets
    }
    pub fn pos_seq(&self) -> &[usize] {
        &self.pos_seq
    }
    pub fn neg_seq(&self) -> &[usize] {
        &self.neg_seq
    }
    pub fn width(&self) -> float {
        self.width
    }
    pub fn height(&self) -> float {
        self.height
    }
    pub fn cost_history(&self) -> &[float] {
        &self.cost_history
    }
    pub fn temperature_history(&self) -> &[float] {
        &self.temperature_history
    }

    /// Installs a warm-start sequence pair. Ignored unless both are
    /// permutations of the chiplet ids.
    pub fn set_sequences(&mut self, pos_seq: &[usize], neg_seq: &[usize]) -> bool {
        let n = self.macros.len();
        let is_perm = |s: &[usize]| s.len() == n && s.iter().copied().sorted_unstable().eq(0..n);
        if !is_perm(pos_seq) || !is_perm(neg_seq) {
            return false;
        }
        self.pos_seq = pos_seq.to_vec();
        self.neg_seq = neg_seq.to_vec();
        true
    }

    pub fn norms(&self) -> (float, float, float) {
        (self.norm_area_penalty, self.norm_package_penalty, self.norm_net_penalty)
    }
    pub fn set_norms(&mut self, norms: (float, float, float)) {
        self.norm_area_penalty = norms.0;
        self.norm_package_penalty = norms.1;
        self.norm_net_penalty = norms.2;
    }

    /// Longest-path packing of the sequence pair.
    pub fn pack_floorplan(&mut self) {
        let n = self.macros.len();
        if n == 0 {
            self.width = 0.0;
            self.height = 0.0;
            return;
        }
        for m in &mut self.macros {
            m.x = 0.0;
            m.y = 0.0;
        }
        let mut neg_pos = vec![0; n];
        for (i, &m) in self.neg_seq.iter().enumerate() {
            neg_pos[m] = i;
        }
        let mut length = vec![0.0; n];
        for &b in &self.pos_seq {
            let macro_b = &mut self.macros[b];
            if macro_b.get_width() <= 0.0 || macro_b.get_height() <= 0.0 {
                continue;
            }
            let p = neg_pos[b];
            macro_b.x = length[p];
            let right_edge = macro_b.x + macro_b.get_width();
            for l in length.iter_mut().skip(p) {
                if right_edge > *l {
                    *l = right_edge;
                } else {
                    break;
                }
            }
        }
        self.width = length[n - 1];

        length.iter_mut().for_each(|l| *l = 0.0);
        for &b in self.pos_seq.iter().rev() {
            let macro_b = &mut self.macros[b];
            if macro_b.get_width() <= 0.0 || macro_b.get_height() <= 0.0 {
                continue;
            }
            let p = neg_pos[b];
            macro_b.y = length[p];
            let top_edge = macro_b.y + macro_b.get_height();
            for l in length.iter_mut().skip(p) {
                if top_edge > *l {
                    *l = top_edge;
                } else {
                    break;
                }
            }
        }
        self.height = length[n - 1];
    }

    fn two_distinct_indices(&mut self) -> Option<(usize, usize)> {
        let n = self.macros.len();
        if n <= 1 {
            return None;
        }
        let i = self.rng.random_range(0..n);
        let mut j = self.rng.random_range(0..n - 1);
        if j >= i {
            j += 1;
        }
        Some((i, j))
    }

    fn single_seq_swap(&mut self, pos: bool) {
        if let Some((i, j)) = self.two_distinct_indices() {
            if pos {
                self.pos_seq.swap(i, j);
            } else {
                self.neg_seq.swap(i, j);
            }
        }
    }

    fn double_seq_swap(&mut self) {
        if let Some((i, j)) = self.two_distinct_indices() {
            self.pos_seq.swap(i, j);
            self.neg_seq.swap(i, j);
        }
    }

    /// Snaps one side of a random die to the nearest edge of a neighbour.
    fn resize_one_cluster(&mut self) {
        let idx = self.rng.random_range(0..self.macros.len());
        let src = &self.macros[idx];
        let (lx, ly) = (src.x, src.y);
        let (ux, uy) = (lx + src.get_width(), ly + src.get_height());
        let (min_ar, max_ar) = (src.min_ar, src.max_ar);

        if self.rng.random::<float>() < 0.2 {
            // log-uniform over the allowed aspect ratios
            let t = self.rng.random::<float>();
            let ar = (min_ar.ln() + t * (max_ar.ln() - min_ar.ln())).exp();
            self.macros[idx].resize_with_aspect_ratio(ar.clamp(min_ar, max_ar));
            return;
        }
        let right_edges = self.macros.iter().map(|m| m.x + m.get_width()).collect_vec();
        let top_edges = self.macros.iter().map(|m| m.y + m.get_height()).collect_vec();
        let option = self.rng.random::<float>();
        if option <= 0.25 {
            let e_x2 = right_edges
                .iter()
                .copied()
                .filter(|&x2| x2 > ux && x2 < self.width)
                .fold(self.width, float::min);
            self.macros[idx].set_width(e_x2 - lx);
        } else if option <= 0.5 {
            let d_x2 = right_edges
                .iter()
                .copied()
                .filter(|&x2| x2 < ux && x2 > lx)
                .fold(lx, float::max);
            if d_x2 > lx {
                self.macros[idx].set_width(d_x2 - lx);
            }
        } else if option <= 0.75 {
            let a_y2 = top_edges
                .iter()
                .copied()
                .filter(|&y2| y2 > uy && y2 < self.height)
                .fold(self.height, float::min);
            self.macros[idx].set_height(a_y2 - ly);
        } else {
            let c_y2 = top_edges
                .iter()
                .copied()
                .filter(|&y2| y2 < uy && y2 > ly)
                .fold(ly, float::max);
            if c_y2 > ly {
                self.macros[idx].set_height(c_y2 - ly);
            }
        }
    }

    /// Grid cells `[start, end)` covered by the segment.
    fn segment_cells(seg_start: float, seg_end: float, grid: &[float]) -> (usize, usize) {
        let mut start = 0;
        let mut end = None;
        for i in 0..grid.len().saturating_sub(1) {
            if grid[i] <= seg_start && grid[i + 1] > seg_start {
                start = i;
            }
            if grid[i] <= seg_end && grid[i + 1] > seg_end {
                end = Some(i);
            }
        }
        (start, end.unwrap_or(grid.len() - 1))
    }

    /// Grows every die into the free space around it, bounded by how much
    /// the nets of the least violated die could use.
    fn expand_clusters(&mut self) {
        let n = self.macros.len();
        let to_grid = |points: BTreeSet<OrderedFloat<float>>| points.into_iter().map(|p| p.0).collect_vec();
        let x_grid = to_grid(
            self.macros
                .iter()
                .flat_map(|m| [OrderedFloat(m.x), OrderedFloat(m.x + m.get_width())])
                .collect(),
        );
        let y_grid = to_grid(
            self.macros
                .iter()
                .flat_map(|m| [OrderedFloat(m.y), OrderedFloat(m.y + m.get_height())])
                .collect(),
        );
        let num_x = x_grid.len().saturating_sub(1);
        let num_y = y_grid.len().saturating_sub(1);
        if num_x == 0 || num_y == 0 {
            return;
        }

        let mut violation = vec![0.0; n];
        let mut expand = Vec::with_capacity(self.nets.len());
        for net in &self.nets {
            let penalty = self.net_violation(net);
            expand.push(if net.weight > 0.0 { penalty / net.weight } else { 0.0 });
            violation[net.terminals.0] += penalty;
            violation[net.terminals.1] += penalty;
        }
        let src = violation
            .iter()
            .position_min_by_key(|&&v| OrderedFloat(v))
            .unwrap_or(0);
        let s = &self.macros[src];
        let (src_lx, src_ly) = (s.x, s.y);
        let (src_ux, src_uy) = (s.x + s.get_width(), s.y + s.get_height());
        let (mut left_max, mut right_max, mut top_max, mut down_max) = (0.0, 0.0, 0.0, 0.0);
        for (i, net) in self.nets.iter().enumerate() {
            let sink = match net.terminals {
                (a, b) if a == src => b,
                (a, b) if b == src => a,
                _ => continue,
            };
            let m = &self.macros[sink];
            if src_lx > m.x + m.get_width() {
                left_max = float::max(left_max, expand[i]);
            }
            if src_ux < m.x {
                right_max = float::max(right_max, expand[i]);
            }
            if src_ly > m.y + m.get_height() {
                down_max = float::max(down_max, expand[i]);
            }
            if src_uy < m.y {
                top_max = float::max(top_max, expand[i]);
            }
        }

        let cells_of = |m: &Chiplet| {
            let (xs, xe) = Self::segment_cells(m.x, m.x + m.get_width(), &x_grid);
            let (ys, ye) = Self::segment_cells(m.y, m.y + m.get_height(), &y_grid);
            (xs, xe, ys, ye)
        };
        let mut grid: Vec<Vec<Option<usize>>> = vec![vec![None; num_x]; num_y];
        for (id, m) in self.macros.iter().enumerate() {
            let (xs, xe, ys, ye) = cells_of(m);
            for row in grid.iter_mut().take(ye).skip(ys) {
                for cell in row.iter_mut().take(xe).skip(xs) {
                    *cell = Some(id);
                }
            }
        }

        let order = self.pos_seq.iter().chain(self.neg_seq.iter()).copied().collect_vec();
        for id in order {
            if self.macros[id].get_width() <= 0.0 || self.macros[id].get_height() <= 0.0 {
                continue;
            }
            let (mut xs, mut xe, mut ys, mut ye) = cells_of(&self.macros[id]);
            let column_free = |grid: &Vec<Vec<Option<usize>>>, i: usize, ys: usize, ye: usize| {
                (ys..ye).all(|j| grid[j][i].is_none() || grid[j][i] == Some(id))
            };
            let row_free = |grid: &Vec<Vec<Option<usize>>>, j: usize, xs: usize, xe: usize| {
                (xs..xe).all(|i| grid[j][i].is_none() || grid[j][i] == Some(id))
            };
            while xs > 0 && column_free(&grid, xs - 1, ys, ye) {
                xs -= 1;
                (ys..ye).for_each(|j| grid[j][xs] = Some(id));
            }
            while ye < num_y && row_free(&grid, ye, xs, xe) {
                (xs..xe).for_each(|i| grid[ye][i] = Some(id));
                ye += 1;
            }
            while xe < num_x && column_free(&grid, xe, ys, ye) {
                (ys..ye).for_each(|j| grid[j][xe] = Some(id));
                xe += 1;
            }
            while ys > 0 && row_free(&grid, ys - 1, xs, xe) {
                ys -= 1;
                (xs..xe).for_each(|i| grid[ys][i] = Some(id));
            }
            let m = &mut self.macros[id];
            let left = float::max(x_grid[xs], m.x - left_max);
            let down = float::max(y_grid[ys], m.y - down_max);
            let right = float::min(x_grid[xe], m.x + m.get_width() + right_max);
            let top = float::min(y_grid[ye], m.y + m.get_height() + top_max);
            m.x = left;
            m.y = down;
            m.set_shape(right - left, top - down);
        }
    }

    pub fn net_violation(&self, net: &BundledNet) -> float {
        let length = net_length(
            &self.macros[net.terminals.0],
            &self.macros[net.terminals.1],
            net.io_area,
        );
        net.weight * (length - net.reach).max(0.0)
    }

    pub fn cal_net_penalty(&self) -> float {
        self.nets.iter().map(|net| self.net_violation(net)).sum()
    }

    fn cal_area_penalty(&self) -> float {
        if self.area_penalty_weight <= 0.0 {
            return 0.0;
        }
        self.macros
            .iter()
            .map(|m| (m.area() - m.min_area).max(0.0))
            .sum()
    }

    fn cal_package_penalty(&self) -> float {
        if self.package_penalty_weight <= 0.0 {
            return 0.0;
        }
        self.width * self.height
    }

    pub fn cal_penalty(&mut self) {
        self.area_penalty = self.cal_area_penalty();
        self.package_penalty = self.cal_package_penalty();
        self.net_penalty = self.cal_net_penalty();
    }

    pub fn is_valid(&self) -> bool {
        self.cal_net_penalty() <= NET_PENALTY_TOLERANCE
    }

    pub fn perturb(&mut self) {
        if self.macros.is_empty() {
            return;
        }
        self.pre_pos_seq.clone_from(&self.pos_seq);
        self.pre_neg_seq.clone_from(&self.neg_seq);
        self.pre_macros.clone_from(&self.macros);
        self.pre_metrics = [
            self.width,
            self.height,
            self.area_penalty,
            self.package_penalty,
            self.net_penalty,
        ];
        let op = self.rng.random::<float>();
        let [t1, t2, t3, t4] = self.action_thresholds;
        self.action = if op <= t1 {
            self.single_seq_swap(true);
            Action::PosSwap
        } else if op <= t2 {
            self.single_seq_swap(false);
            Action::NegSwap
        } else if op <= t3 {
            self.double_seq_swap();
            Action::DoubleSwap
        } else if op <= t4 {
            self.resize_one_cluster();
            Action::Resize
        } else {
            self.expand_clusters();
            Action::Expand
        };
        self.pack_floorplan();
    }

    /// Undoes the last perturbation.
    pub fn restore(&mut self) {
        if self.macros.is_empty() {
            return;
        }
        match self.action {
            Action::None => return,
            Action::PosSwap => self.pos_seq.clone_from(&self.pre_pos_seq),
            Action::NegSwap => self.neg_seq.clone_from(&self.pre_neg_seq),
            Action::DoubleSwap => {
                self.pos_seq.clone_from(&self.pre_pos_seq);
                self.neg_seq.clone_from(&self.pre_neg_seq);
            }
            Action::Resize | Action::Expand => {}
        }
        // positions were repacked as well
        self.macros.clone_from(&self.pre_macros);
        [
            self.width,
            self.height,
            self.area_penalty,
            self.package_penalty,
            self.net_penalty,
        ] = self.pre_metrics;
    }

    /// Takes one perturbation and derives the normalisation factors from it.
    pub fn initialize(&mut self) {
        self.pack_floorplan();
        self.cal_penalty();
        self.perturb();
        self.cal_penalty();
        self.norm_area_penalty = self.width * self.height;
        self.norm_package_penalty = self.width * self.height;
        self.norm_net_penalty = self.width + self.height;
    }

    pub fn cal_norm_cost(&mut self) -> float {
        self.cal_penalty();
        self.norm_cost()
    }

    fn norm_cost(&self) -> float {
        let mut cost = 0.0;
        if self.norm_area_penalty > 0.0 {
            cost += self.area_penalty_weight * self.area_penalty / self.norm_area_penalty;
        }
        if self.norm_package_penalty > 0.0 {
            cost += self.package_penalty_weight * self.package_penalty / self.norm_package_penalty;
        }
        if self.norm_net_penalty > 0.0 {
            cost += self.net_penalty_weight * self.net_penalty / self.norm_net_penalty;
        }
        cost
    }

    /// Normalised cost of the current layout.
    pub fn cost(&self) -> float {
        self.norm_cost()
    }

    /// Metropolis annealing. The temperature starts at `cooling_rate` and
    /// falls geometrically to the minimum over `max_num_step * acceleration`
    /// steps.
    pub fn run(&mut self, cooling_acceleration_factor: float) {
        self.pack_floorplan();
        if self.norm_area_penalty <= 0.0 {
            self.norm_area_penalty = 1.0;
        }
        if self.norm_package_penalty <= 0.0 {
            self.norm_package_penalty = 1.0;
        }
        if self.norm_net_penalty <= 0.0 {
            self.norm_net_penalty = 1.0;
        }
        let mut pre_cost = self.cal_norm_cost();
        let mut temperature = INIT_TEMPERATURE * self.cooling_rate;
        let horizon = (self.max_num_step.float() * cooling_acceleration_factor).max(1.0);
        let t_factor = ((self.min_temperature / temperature).ln() / horizon).exp();

        for _ in 0..self.max_num_step {
            for _ in 0..self.num_perturb_per_step {
                self.perturb();
                let cost = self.cal_norm_cost();
                let delta = cost - pre_cost;
                let acceptance = if delta > 0.0 {
                    (-delta / temperature).exp()
                } else {
                    1.0
                };
                if self.rng.random::<float>() < acceptance {
                    pre_cost = cost;
                } else {
                    self.restore();
                }
            }
            temperature *= t_factor;
            self.cost_history.push(pre_cost);
            self.temperature_history.push(temperature);
        }
        self.pack_floorplan();
        self.cal_penalty();
    }
}

/// Result of a full floorplanning run.
#[derive(Debug, Clone)]
pub struct FloorplanOutcome {
    pub macros: Vec<Chiplet>,
    pub pos_seq: Vec<usize>,
    pub neg_seq: Vec<usize>,
    pub cost: float,
    pub valid: bool,
}

impl FloorplanOutcome {
    pub fn empty() -> Self {
        FloorplanOutcome {
            macros: Vec::new(),
            pos_seq: Vec::new(),
            neg_seq: Vec::new(),
            cost: 0.0,
            valid: true,
        }
    }
}

/// Runs several annealers with different cooling rates in parallel and
/// keeps the best one, valid layouts first.
#[builder]
pub fn anneal_parallel(
    chiplets: &[Chiplet],
    nets: &[BundledNet],
    config: &SaConfig,
    max_steps: usize,
    perturbations: usize,
    #[builder(default = 1.0)] cooling_acceleration: float,
    #[builder(default = 0)] seed: u64,
    warm_start: Option<(&[usize], &[usize])>,
) -> FloorplanOutcome {
    if chiplets.is_empty() {
        return FloorplanOutcome::empty();
    }
    let num_workers = config.max_workers.clamp(2, 4);
    let delta_rate = (config.max_cooling_rate - config.min_cooling_rate) / (num_workers - 1).float();
    let per_worker_steps = (max_steps / num_workers).max(10);
    let per_worker_perturbations = (perturbations / num_workers).max(5);

    let mut workers = (0..num_workers)
        .map(|worker_id| {
            let rate = (config.min_cooling_rate + worker_id.float() * delta_rate)
                .clamp(config.min_cooling_rate, config.max_cooling_rate);
            let mut sa = SaCore::builder()
                .worker_id(worker_id)
                .chiplets(chiplets.to_vec())
                .nets(nets.to_vec())
                .config(config)
                .max_num_step(per_worker_steps)
                .num_perturb_per_step(per_worker_perturbations)
                .cooling_rate(rate)
                .seed(seed + worker_id.u64())
                .build();
            if let Some((pos, neg)) = warm_start {
                sa.set_sequences(pos, neg);
            }
            sa
        })
        .collect_vec();

    workers[0].initialize();
    let norms = workers[0].norms();
    workers.iter_mut().for_each(|w| w.set_norms(norms));
    workers
        .par_iter_mut()
        .for_each(|w| w.run(cooling_acceleration));

    let best = workers
        .iter()
        .map(|w| (w.is_valid(), w.cost(), w.worker_id()))
        .min_by_key(|&(valid, cost, id)| (!valid, OrderedFloat(cost), id))
        .map_or(0, |(_, _, id)| id);
    let winner = &workers[best];
    debug!(
        "Floorplan: worker {} wins, cost {:.4}, valid {}",
        best,
        winner.cost(),
        winner.is_valid()
    );
    FloorplanOutcome {
        macros: winner.macros().to_vec(),
        pos_seq: winner.pos_seq().to_vec(),
        neg_seq: winner.neg_seq().to_vec(),
        cost: winner.cost(),
        valid: winner.is_valid(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_no_overlap(macros: &[Chiplet]) {
        for (i, a) in macros.iter().enumerate() {
            for b in &macros[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    fn scenario_chiplets() -> (Vec<Chiplet>, Vec<BundledNet>) {
        let chiplets = vec![Chiplet::square(300.0, 0.1), Chiplet::square(200.0, 0.1)];
        let nets = vec![BundledNet::new((0, 1), 1.0, 10.0, 1.0)];
        (chiplets, nets)
    }

    #[test]
    fn test_chiplet_resizing_keeps_area_and_bounds() {
        let mut c = Chiplet::square(100.0, 0.5);
        c.set_width(40.0);
        assert!((c.area() - 100.0).abs() < 1e-9);
        assert!(c.aspect_ratio() <= 5.0 + 1e-9);
        c.set_height(60.0);
        assert!((c.area() - 100.0).abs() < 1e-9);
        assert!(c.aspect_ratio() >= 0.2 - 1e-9);
        // too small to hold the halo
        let before = c.clone();
        c.set_width(0.5);
        assert_eq!(c, before);
        c.resize_with_aspect_ratio(2.0);
        assert!((c.aspect_ratio() - 2.0).abs() < 1e-9);
        assert!(c.area() >= c.min_area - 1e-9);
    }

    #[test]
    fn test_resizing_respects_asymmetric_bounds() {
        let mut c = Chiplet::square(100.0, 0.0);
        c.min_ar = 0.5;
        c.max_ar = 3.0;
        let within = |c: &Chiplet| (0.5 - 1e-9..=3.0 + 1e-9).contains(&c.aspect_ratio());
        for outer in [1.0, 5.0, 8.0, 12.0, 40.0] {
            c.set_width(outer);
            assert!(within(&c), "width {outer}: {}", c.aspect_ratio());
            c.set_height(outer);
            assert!(within(&c), "height {outer}: {}", c.aspect_ratio());
        }
        c.set_width(40.0);
        assert!((c.aspect_ratio() - 3.0).abs() < 1e-9);
        c.set_height(40.0);
        assert!((c.aspect_ratio() - 0.5).abs() < 1e-9);
        assert!((c.area() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_shape_only_grows() {
        let mut c = Chiplet::square(16.0, 0.0);
        let before = c.clone();
        c.set_shape(3.0, 10.0);
        assert_eq!(c, before);
        c.set_shape(5.0, 5.0);
        assert!((c.area() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_pack_is_non_overlapping() {
        let chiplets = (1..=6).map(|i| Chiplet::square(10.0 * i.float(), 0.2)).collect_vec();
        let config = SaConfig::default();
        let mut sa = SaCore::builder()
            .chiplets(chiplets)
            .nets(vec![])
            .config(&config)
            .max_num_step(10)
            .num_perturb_per_step(10)
            .seed(3)
            .build();
        let mut rng = seeded_rng(11);
        for _ in 0..50 {
            let mut pos = (0..6).collect_vec();
            let mut neg = (0..6).collect_vec();
            pos.shuffle(&mut rng);
            neg.shuffle(&mut rng);
            assert!(sa.set_sequences(&pos, &neg));
            sa.pack_floorplan();
            assert_no_overlap(sa.macros());
            let max_x = sa.macros().iter().map(|m| m.x + m.get_width()).fold(0.0, float::max);
            assert!((max_x - sa.width()).abs() < 1e-9);
        }
        assert!(!sa.set_sequences(&[0, 1], &[1, 0]));
    }

    #[test]
    fn test_restore_undoes_perturbation() {
        let (chiplets, nets) = scenario_chiplets();
        let config = SaConfig::default();
        let mut sa = SaCore::builder()
            .chiplets(chiplets)
            .nets(nets)
            .config(&config)
            .max_num_step(10)
            .num_perturb_per_step(10)
            .seed(5)
            .build();
        sa.pack_floorplan();
        sa.cal_penalty();
        for _ in 0..100 {
            let before = (sa.macros().to_vec(), sa.pos_seq().to_vec(), sa.neg_seq().to_vec());
            let cost_before = sa.cost();
            sa.perturb();
            sa.cal_penalty();
            sa.restore();
            assert_eq!(sa.macros(), &before.0[..]);
            assert_eq!(sa.pos_seq(), &before.1[..]);
            assert_eq!(sa.neg_seq(), &before.2[..]);
            assert_eq!(sa.cost(), cost_before);
        }
    }

    #[test]
    fn test_two_chiplet_path_is_legal() {
        let (chiplets, nets) = scenario_chiplets();
        let config = SaConfig::default();
        let outcome = anneal_parallel()
            .chiplets(&chiplets)
            .nets(&nets)
            .config(&config)
            .max_steps(1000)
            .perturbations(100)
            .cooling_acceleration(0.95)
            .seed(42)
            .call();
        assert!(outcome.valid);
        assert_no_overlap(&outcome.macros);
        for net in &nets {
            let (a, b) = net.terminals;
            let len = net_length(&outcome.macros[a], &outcome.macros[b], net.io_area);
            assert!(len <= net.reach + NET_PENALTY_TOLERANCE / net.weight);
        }
    }

    #[test]
    fn test_unreachable_net_is_reported_invalid() {
        // two large dies can never get their centres within a tiny reach
        let chiplets = vec![Chiplet::square(400.0, 0.1), Chiplet::square(400.0, 0.1)];
        let nets = vec![BundledNet::new((0, 1), 1.0, 0.0, 50.0)];
        let config = SaConfig::default();
        let outcome = anneal_parallel()
            .chiplets(&chiplets)
            .nets(&nets)
            .config(&config)
            .max_steps(40)
            .perturbations(20)
            .call();
        assert!(!outcome.valid);
        assert_no_overlap(&outcome.macros);
    }

    #[test]
    fn test_annealing_records_history() {
        let chiplets = (0..4).map(|_| Chiplet::square(25.0, 0.1)).collect_vec();
        let nets = vec![
            BundledNet::new((0, 1), 1.0, 3.0, 1.0),
            BundledNet::new((2, 3), 1.0, 3.0, 1.0),
        ];
        let config = SaConfig::default();
        let mut sa = SaCore::builder()
            .chiplets(chiplets)
            .nets(nets)
            .config(&config)
            .max_num_step(30)
            .num_perturb_per_step(10)
            .seed(9)
            .build();
        sa.initialize();
        sa.run(1.0);
        assert_eq!(sa.cost_history().len(), 30);
        let temps = sa.temperature_history();
        assert!(temps.windows(2).all(|w| w[1] < w[0]));
        assert_no_overlap(sa.macros());
    }
}

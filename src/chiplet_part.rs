use crate::*;

/// Graphs above this size get the cheap refinement schedule.
const LARGE_GRAPH_VERTICES: usize = 200;
/// Effort of the floorplan runs made around every candidate.
const CANDIDATE_FLOORPLAN_STEPS: usize = 100;
const CANDIDATE_FLOORPLAN_PERTURBATIONS: usize = 100;
/// Refinement schedule of the one-shot technology partition.
const QUICK_MOVES_RATIO: float = 0.05;
const QUICK_REFINE_ITERS: usize = 2;
const TOP_RESULTS_SHOWN: usize = 3;

/// A starting point for refinement and the strategy that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub origin: String,
    pub partition: Vec<usize>,
}

/// A refined and floorplanned partition.
#[derive(Debug, Clone)]
pub struct PartitionResult {
    pub origin: String,
    pub partition: Vec<usize>,
    pub num_parts: usize,
    /// Exact cost against `geometry`.
    pub cost: float,
    pub valid: bool,
    pub geometry: Geometry,
}

impl PartitionResult {
    pub fn summary(&self, library: &DesignLibrary) -> PartitionSummary {
        let k = self.num_parts;
        PartitionSummary {
            cost: self.cost,
            valid: self.valid,
            num_parts: k,
            techs: library.names_of(&self.geometry.techs[..k.min(self.geometry.techs.len())]),
            aspect_ratios: self.geometry.aspect_ratios.iter().take(k).copied().collect(),
            x: self.geometry.x.iter().take(k).copied().collect(),
            y: self.geometry.y.iter().take(k).copied().collect(),
        }
    }
}

/// Best technology multiset found by [`ChipletPart::enumerate_tech_assignments`].
#[derive(Debug, Clone, PartialEq)]
pub struct TechAssignment {
    pub cost: float,
    pub partition: Vec<usize>,
    pub techs: Vec<usize>,
}

pub fn num_parts_of(partition: &[usize]) -> usize {
    partition.iter().max().map_or(1, |m| m + 1)
}

/// Consecutive blocks of near-equal size.
pub fn contiguous_partition(num_vertices: usize, num_parts: usize) -> Vec<usize> {
    let k = num_parts.max(1);
    let (size, remainder) = (num_vertices / k, num_vertices % k);
    (0..k)
        .flat_map(|p| std::iter::repeat(p).take(size + usize::from(p < remainder)))
        .collect()
}

/// Indices of the candidates worth refining, cheapest first.
///
/// A candidate survives when its z-score is below `zscore_threshold` and it
/// costs at most `relative_threshold` times the cheapest one. The cheapest
/// `min_candidates` are kept regardless.
pub fn filter_candidates(
    costs: &[float],
    zscore_threshold: float,
    relative_threshold: float,
    min_candidates: usize,
) -> Vec<usize> {
    let (mean, std) = mean_std(costs);
    let best = costs.iter().copied().fold(float::INFINITY, float::min);
    let mut kept = Vec::new();
    for i in (0..costs.len()).sorted_by_key(|&i| OrderedFloat(costs[i])) {
        let zscore = if std > 0.0 { (costs[i] - mean) / std } else { 0.0 };
        let relative = if best > 0.0 {
            costs[i] / best
        } else if costs[i] <= best {
            1.0
        } else {
            float::INFINITY
        };
        let good = zscore < zscore_threshold && relative <= relative_threshold;
        let keep = good || kept.len() < min_candidates;
        debug!(
            target:"internal",
            "Candidate {i}: cost {:.4}, z {zscore:.2}, x{relative:.2} -> {}",
            costs[i],
            if keep { "kept" } else { "filtered" }
        );
        if keep {
            kept.push(i);
        }
    }
    kept
}

/// Key of a technology multiset: the number of distinct nodes, then
/// `name:count` pairs by count descending and name ascending.
pub fn canonical_tech_form(names: &[String]) -> String {
    let pairs = names
        .iter()
        .counts()
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)))
        .collect_vec();
    format!(
        "{}:{}",
        pairs.len(),
        pairs.iter().map(|(name, count)| format!("{name}:{count}:")).join("")
    )
}

/// Candidate search, refinement and floorplanning over one hypergraph.
pub struct ChipletPart {
    hgraph: Arc<Hypergraph>,
    library: Arc<DesignLibrary>,
    cost_model: Arc<dyn CostModel>,
    config: PartitionConfig,
    pool: Option<rayon::ThreadPool>,
}

#[bon]
impl ChipletPart {
    #[builder]
    pub fn new(
        hgraph: Arc<Hypergraph>,
        library: Arc<DesignLibrary>,
        #[builder(default)] config: PartitionConfig,
        // defaults to a manufacturing model over `library`
        cost_model: Option<Arc<dyn CostModel>>,
    ) -> Self {
        let mut config = config;
        if config.auto_size {
            let large = hgraph.num_vertices() > LARGE_GRAPH_VERTICES;
            config.max_moves_ratio = if large { 0.05 } else { 0.5 };
            config.refine_iters = if large { 1 } else { 3 };
            config.boundary_flag |= large;
        }
        let cost_model = cost_model.unwrap_or_else(|| {
            Arc::new(
                ManufacturingCostModel::builder()
                    .library(library.clone())
                    .cost_coef(config.cost_coef)
                    .power_coef(config.power_coef)
                    .build(),
            )
        });
        let pool = (config.num_threads > 0)
            .then(|| rayon::ThreadPoolBuilder::new().num_threads(config.num_threads).build())
            .and_then(|built| {
                built
                    .map_err(|e| warn!("Falling back to the global thread pool: {e}"))
                    .ok()
            });
        ChipletPart {
            hgraph,
            library,
            cost_model,
            config,
            pool,
        }
    }
}

impl ChipletPart {
    pub fn hgraph(&self) -> &Arc<Hypergraph> {
        &self.hgraph
    }
    pub fn library(&self) -> &Arc<DesignLibrary> {
        &self.library
    }
    pub fn cost_model(&self) -> &Arc<dyn CostModel> {
        &self.cost_model
    }
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Runs `op` inside the configured thread pool, if any.
    pub fn install<T: Send>(&self, op: impl FnOnce() -> T + Send) -> T {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    pub fn check_techs(&self, techs: &[usize]) -> Result<()> {
        match techs.iter().find(|&&t| t >= self.library.techs.len()) {
            Some(t) => Err(ChipletError::Config(format!(
                "technology index {t} is outside the library ({} nodes)",
                self.library.techs.len()
            ))),
            None => Ok(()),
        }
    }

    pub fn tech_names(&self, techs: &[usize]) -> Vec<String> {
        self.library.names_of(techs)
    }

    fn bounds(&self, num_parts: usize) -> (Vec<Vec<float>>, Vec<Vec<float>>) {
        if self.config.balance_constraints {
            self.hgraph.balance_bounds(num_parts, self.config.ub_factor)
        } else {
            self.hgraph.unconstrained_bounds(num_parts)
        }
    }

    fn refiner(&self, techs: Vec<usize>, seed_offset: u64) -> ChipletRefiner {
        ChipletRefiner::builder()
            .hgraph(self.hgraph.clone())
            .cost_model(self.cost_model.clone())
            .config(&self.config)
            .num_parts(techs.len())
            .techs(techs)
            .seed_offset(seed_offset)
            .build()
    }

    fn candidate_floorplan(&self, refiner: &mut ChipletRefiner, partition: &[usize]) -> FloorplanVerdict {
        refiner.run_floorplanner(
            partition,
            self.config.floorplan_steps.min(CANDIDATE_FLOORPLAN_STEPS),
            self.config.floorplan_perturbations.min(CANDIDATE_FLOORPLAN_PERTURBATIONS),
            self.config.cooling_acceleration,
        )
    }

    fn full_floorplan(&self, refiner: &mut ChipletRefiner, partition: &[usize]) -> FloorplanVerdict {
        refiner.run_floorplanner(
            partition,
            self.config.floorplan_steps,
            self.config.floorplan_perturbations,
            self.config.cooling_acceleration,
        )
    }

    /// Floorplans `candidate`, refines it and floorplans the outcome again.
    fn refine_candidate(&self, candidate: &Candidate, techs: Vec<usize>, seed_offset: u64, quick: bool) -> PartitionResult {
        let mut partition = candidate.partition.clone();
        let mut refiner = self.refiner(techs, seed_offset);
        if quick {
            let moves = (self.hgraph.num_vertices().float() * QUICK_MOVES_RATIO).ceil().usize();
            refiner.set_max_moves(moves.max(1));
            refiner.set_refine_iters(QUICK_REFINE_ITERS);
        }
        self.candidate_floorplan(&mut refiner, &partition);
        let (upper, lower) = self.bounds(refiner.num_parts());
        refiner.refine(&mut partition, &upper, &lower);
        let verdict = self.candidate_floorplan(&mut refiner, &partition);
        let cost = refiner.cost_from_scratch(&partition, false);
        debug!(
            target:"internal",
            "{}: refined to cost {cost:.4} ({})",
            candidate.origin,
            if verdict.valid { "feasible" } else { "infeasible" }
        );
        PartitionResult {
            origin: candidate.origin.clone(),
            num_parts: num_parts_of(&partition),
            cost,
            valid: verdict.valid,
            geometry: refiner.geometry().clone(),
            partition,
        }
    }

    // --------------------------------------------------------------------------------
    // ### Candidate generation
    // --------------------------------------------------------------------------------

    fn kway_slack(&self) -> float {
        1.0 + self.config.ub_factor / 100.0
    }

    fn external_strategies(&self) -> (Option<ExternalPartitioner>, Option<ExternalEmbedding>) {
        let work_dir = std::env::temp_dir();
        (
            self.config
                .external_partitioner
                .clone()
                .map(|command| ExternalPartitioner::new(command, work_dir.clone())),
            self.config
                .external_embedding
                .clone()
                .map(|command| ExternalEmbedding::new(command, work_dir)),
        )
    }

    fn search_strategies(&self) -> Vec<Box<dyn InitialPartitioner>> {
        let mut strategies: Vec<Box<dyn InitialPartitioner>> = vec![
            Box::new(SpectralClustering::default()),
            Box::new(CrossbarExpansion::new(
                self.config.crossbar_quantile,
                self.config.crossbar_majority,
            )),
            Box::new(RandomKWay::new(self.kway_slack())),
        ];
        let (partitioner, embedding) = self.external_strategies();
        if let Some(embedding) = embedding {
            strategies.push(Box::new(embedding));
        }
        if let Some(partitioner) = partitioner {
            strategies.push(Box::new(partitioner));
        }
        strategies
    }

    fn run_strategies(&self, strategies: &[Box<dyn InitialPartitioner>], ks: &[usize]) -> Vec<Candidate> {
        let n = self.hgraph.num_vertices();
        let seed = self.config.seed;
        let hgraph = &*self.hgraph;
        let jobs = strategies.iter().cartesian_product(ks.iter().copied()).collect_vec();
        let generated: Vec<Candidate> = self.install(|| {
            jobs.into_par_iter()
                .filter_map(|(strategy, k)| {
                    strategy.partition(hgraph, k, seed).map(|partition| Candidate {
                        origin: format!("{} (k={k})", strategy.name()),
                        partition,
                    })
                })
                .collect()
        });
        generated
            .into_iter()
            .filter(|c| c.partition.len() == n)
            .unique_by(|c| c.partition.clone())
            .collect()
    }

    /// Starting partitions for every size in `chiplets_set`. Duplicates are
    /// dropped; a failing strategy only costs its own candidates.
    pub fn generate_candidates(&self) -> Vec<Candidate> {
        let n = self.hgraph.num_vertices();
        let mut candidates = Vec::new();
        if self.config.chiplets_set.contains(&1) {
            candidates.push(Candidate {
                origin: "trivial (k=1)".to_string(),
                partition: vec![0; n],
            });
        }
        let ks = self.config.chiplets_set.iter().copied().filter(|&k| k > 1).collect_vec();
        candidates.extend(self.run_strategies(&self.search_strategies(), &ks));
        candidates.into_iter().unique_by(|c| c.partition.clone()).collect()
    }

    /// Starting partitions of exactly `num_parts` parts for the technology
    /// modes, with contiguous blocks when no generator succeeds.
    pub fn tech_candidates(&self, num_parts: usize) -> Vec<Candidate> {
        let n = self.hgraph.num_vertices();
        if num_parts <= 1 {
            return vec![Candidate {
                origin: "trivial (k=1)".to_string(),
                partition: vec![0; n],
            }];
        }
        let (partitioner, embedding) = self.external_strategies();
        let mut strategies: Vec<Box<dyn InitialPartitioner>> = Vec::new();
        if let Some(partitioner) = partitioner {
            strategies.push(Box::new(partitioner));
        }
        strategies.push(Box::new(SpectralClustering::default()));
        if let Some(embedding) = embedding {
            strategies.push(Box::new(embedding));
        }
        let mut candidates = self.run_strategies(&strategies, &[num_parts]);
        candidates.retain(|c| c.partition.iter().all(|&p| p < num_parts));
        if candidates.is_empty() {
            warn!("No generator produced a {num_parts}-way partition, using contiguous blocks");
            candidates.push(Candidate {
                origin: format!("contiguous (k={num_parts})"),
                partition: contiguous_partition(n, num_parts),
            });
        }
        candidates
    }

    /// Cost of every candidate with square dies in `tech`, package estimated.
    pub fn score_candidates(&self, candidates: &[Candidate], tech: usize) -> Vec<float> {
        self.install(|| {
            candidates
                .par_iter()
                .map(|c| {
                    let geometry = Geometry::uniform(num_parts_of(&c.partition), tech);
                    self.cost_model.evaluate(&self.hgraph, &c.partition, &geometry, true)
                })
                .collect()
        })
    }

    // --------------------------------------------------------------------------------
    // ### Single technology
    // --------------------------------------------------------------------------------

    /// Searches the partition sizes of `chiplets_set` with every chiplet in
    /// `tech`, and writes the winner to `<output_prefix>.cpart.<k>`.
    #[time("Partition")]
    pub fn partition(&self, tech: usize) -> Result<PartitionResult> {
        self.check_techs(&[tech])?;
        display_progress_step(1, 4, "Generating candidate partitions");
        let candidates = self.generate_candidates();
        if candidates.is_empty() {
            return Err(ChipletError::InvalidPartition(
                "no candidate partition was produced".to_string(),
            ));
        }

        display_progress_step(2, 4, "Scoring candidates");
        let costs = self.score_candidates(&candidates, tech);
        let kept = filter_candidates(
            &costs,
            self.config.zscore_threshold,
            self.config.relative_threshold,
            self.config.min_candidates,
        );
        info!(
            "Refining {} of {} candidates",
            kept.len().to_string().bright_green(),
            candidates.len()
        );

        display_progress_step(3, 4, "Refining candidates");
        let mut results: Vec<PartitionResult> = self.install(|| {
            kept.par_iter()
                .map(|&i| {
                    let c = &candidates[i];
                    self.refine_candidate(c, vec![tech; num_parts_of(&c.partition)], i.u64(), false)
                })
                .collect()
        });
        results.sort_by_key(|r| (!r.valid, OrderedFloat(r.cost)));
        self.print_ranking(&results);

        display_progress_step(4, 4, "Floorplanning the best partition");
        let mut best = results.into_iter().next().ok_or_else(|| {
            ChipletError::InvalidPartition("every candidate was filtered out".to_string())
        })?;
        if !best.valid {
            warn!("No feasible candidate, keeping the cheapest infeasible one");
        }
        let mut refiner = self.refiner(best.geometry.techs.clone(), 0);
        refiner.set_geometry(best.geometry.clone());
        let verdict = self.full_floorplan(&mut refiner, &best.partition);
        if verdict.valid || !best.valid {
            best.valid = verdict.valid;
            best.cost = refiner.cost_from_scratch(&best.partition, false);
            best.geometry = refiner.geometry().clone();
        }
        info!(
            "Best partition from {}: {} parts, cost {:.4}, {}",
            best.origin,
            best.num_parts,
            best.cost,
            if best.valid { "feasible".green() } else { "infeasible".red() }
        );

        write_partition(
            format!("{}.cpart.{}", self.config.output_prefix, best.num_parts),
            &best.partition,
        )?;
        Ok(best)
    }

    fn print_ranking(&self, results: &[PartitionResult]) {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.add_row(row!["Rank", "Origin", "Parts", "Cost", "Feasible"]);
        for (rank, r) in results.iter().take(TOP_RESULTS_SHOWN).enumerate() {
            table.add_row(row![
                rank + 1,
                r.origin,
                r.num_parts,
                format!("{:.4}", r.cost),
                if r.valid { "Yes" } else { "No" }
            ]);
        }
        table.printstd();
    }

    /// Floorplans and prices a partition read from disk.
    #[time("Evaluate partition")]
    pub fn evaluate_partition(&self, path: impl AsRef<Path>, tech: usize) -> Result<PartitionResult> {
        self.check_techs(&[tech])?;
        let path = path.as_ref();
        let partition = read_partition_file(path, self.hgraph.num_vertices())?;
        let k = num_parts_of(&partition);
        let mut refiner = self.refiner(vec![tech; k], 0);
        let verdict = self.full_floorplan(&mut refiner, &partition);
        let result = PartitionResult {
            origin: path.display().to_string(),
            num_parts: k,
            cost: refiner.cost_from_scratch(&partition, false),
            valid: verdict.valid,
            geometry: refiner.geometry().clone(),
            partition,
        };
        info!(
            "{}: {k} parts, cost {:.4}, {}",
            result.origin.blue().underline(),
            result.cost,
            if result.valid { "feasible".green() } else { "infeasible".red() }
        );
        Ok(result)
    }

    // --------------------------------------------------------------------------------
    // ### Technology assignment
    // --------------------------------------------------------------------------------

    /// One generated partition with a part per entry of `techs`, refined on
    /// a short schedule. Nothing is written.
    pub fn quick_tech_result(&self, techs: &[usize]) -> Result<PartitionResult> {
        if techs.is_empty() {
            return Err(ChipletError::Config("empty technology assignment".to_string()));
        }
        self.check_techs(techs)?;
        let candidate = self
            .tech_candidates(techs.len())
            .into_iter()
            .next()
            .unwrap_or_else(|| Candidate {
                origin: "contiguous".to_string(),
                partition: contiguous_partition(self.hgraph.num_vertices(), techs.len()),
            });
        Ok(self.refine_candidate(&candidate, techs.to_vec(), 0, true))
    }

    /// Refines a given partition on the short schedule for a fixed
    /// technology per part. `techs` must cover every part id.
    pub fn refine_tech_partition(&self, partition: Vec<usize>, techs: &[usize]) -> PartitionResult {
        let candidate = Candidate {
            origin: "genetic".to_string(),
            partition,
        };
        self.refine_candidate(&candidate, techs.to_vec(), 0, true)
    }

    /// [`Self::quick_tech_result`], persisted as `<prefix>.parts.<k>`,
    /// `<prefix>.techs.<k>` and `<prefix>.summary.txt`.
    #[time("Quick technology partition")]
    pub fn quick_tech_partition(&self, techs: &[usize]) -> Result<PartitionResult> {
        let result = self.quick_tech_result(techs)?;
        let prefix = &self.config.output_prefix;
        let k = techs.len();
        write_partition(format!("{prefix}.parts.{k}"), &result.partition)?;
        write_techs(format!("{prefix}.techs.{k}"), &self.tech_names(techs))?;
        result.summary(&self.library).write(format!("{prefix}.summary.txt"))?;
        info!(
            "[{}]: cost {:.4}, {}",
            self.tech_names(techs).join(", "),
            result.cost,
            if result.valid { "feasible".green() } else { "infeasible".red() }
        );
        Ok(result)
    }

    /// Cheapest feasible partition found for a fixed technology per part.
    /// An unusable assignment scores `float::MAX` with an empty partition;
    /// one whose candidates all fail to floorplan scores `float::MAX` with
    /// the cheapest of those partitions.
    pub fn evaluate_tech_partition(&self, techs: &[usize]) -> (float, Vec<usize>) {
        if techs.is_empty() {
            return (float::MAX, Vec::new());
        }
        if let Err(e) = self.check_techs(techs) {
            warn!("{e}");
            return (float::MAX, Vec::new());
        }
        let n = self.hgraph.num_vertices();
        if techs.len() == 1 {
            let partition = vec![0; n];
            let geometry = Geometry::with_techs(techs.to_vec());
            let cost = self.cost_model.evaluate(&self.hgraph, &partition, &geometry, false);
            return (cost, partition);
        }
        let candidates = self.tech_candidates(techs.len());
        let results: Vec<PartitionResult> = self.install(|| {
            candidates
                .par_iter()
                .enumerate()
                .map(|(i, c)| self.refine_candidate(c, techs.to_vec(), i.u64(), false))
                .collect()
        });
        match results.into_iter().min_by_key(|r| (!r.valid, OrderedFloat(r.cost))) {
            Some(best) if best.valid => (best.cost, best.partition),
            Some(best) => {
                debug!(
                    target:"internal",
                    "[{}]: no feasible floorplan, cheapest infeasible cost {:.4}",
                    self.tech_names(techs).join(", "),
                    best.cost
                );
                (float::MAX, best.partition)
            }
            None => (float::MAX, Vec::new()),
        }
    }

    /// Every technology multiset of 1 to `max_parts` parts drawn from
    /// `techs`, one representative per canonical form.
    pub fn unique_tech_assignments(&self, techs: &[usize], max_parts: usize) -> Vec<Vec<usize>> {
        let mut seen = Set::new();
        let mut unique = Vec::new();
        for k in 1..=max_parts {
            for assignment in (0..k).map(|_| techs.iter().copied()).multi_cartesian_product() {
                if seen.insert(canonical_tech_form(&self.tech_names(&assignment))) {
                    unique.push(assignment);
                }
            }
        }
        unique
    }

    /// Evaluates every distinct technology multiset up to `max_parts` parts
    /// and returns the cheapest.
    #[time("Enumerate technology assignments")]
    pub fn enumerate_tech_assignments(&self, techs: &[usize], max_parts: usize) -> Option<TechAssignment> {
        let assignments = self.unique_tech_assignments(techs, max_parts);
        let evaluated: Vec<(float, Vec<usize>)> = self.install(|| {
            assignments
                .par_iter()
                .map(|assignment| self.evaluate_tech_partition(assignment))
                .collect()
        });

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.add_row(row!["Parts", "Possible", "Unique", "Pruned", "Best Cost"]);
        for k in 1..=max_parts {
            let possible = techs.len().saturating_pow(u32::try_from(k).unwrap_or(u32::MAX));
            let costs = assignments
                .iter()
                .zip(&evaluated)
                .filter(|(a, _)| a.len() == k)
                .map(|(_, (cost, _))| *cost)
                .collect_vec();
            let best = costs.iter().copied().fold(float::MAX, float::min);
            table.add_row(row![
                k,
                possible,
                costs.len(),
                possible.saturating_sub(costs.len()),
                if best < float::MAX { format!("{best:.4}") } else { "-".to_string() }
            ]);
        }
        table.printstd();

        assignments
            .into_iter()
            .zip(evaluated)
            .filter(|(_, (cost, partition))| *cost < float::MAX && !partition.is_empty())
            .min_by_key(|(_, (cost, _))| OrderedFloat(*cost))
            .map(|(techs, (cost, partition))| TechAssignment {
                cost,
                partition,
                techs,
            })
    }
}

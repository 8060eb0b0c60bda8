use crate::*;

/// Elites carried over unchanged by the simple mode.
const SIMPLE_ELITES: usize = 2;
/// Generations without improvement before the simple mode stops.
const SIMPLE_PATIENCE: usize = 2;
/// Relative change under which a generation counts as converged.
const CONVERGENCE_TOLERANCE: float = 0.001;
const CONVERGENCE_LIMIT: usize = 10;
/// Random starting partitions generated per part count.
const RANDOM_SEEDS_PER_K: usize = 3;
const REASSIGN_FRACTION: float = 0.05;
const SPLIT_TECH_INHERITANCE: float = 0.7;
const REPAIR_MOVES: usize = 5;

/// A partition together with a technology per part.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneticSolution {
    pub num_partitions: usize,
    pub partition: Vec<usize>,
    pub techs: Vec<usize>,
    /// `None` until evaluated. Infeasible solutions cost `float::MAX`.
    pub cost: Option<float>,
    pub valid: bool,
}

impl GeneticSolution {
    pub fn new(partition: Vec<usize>, techs: Vec<usize>) -> Self {
        Self {
            num_partitions: num_parts_of(&partition),
            partition,
            techs,
            cost: None,
            valid: false,
        }
    }

    pub fn fitness(&self) -> float {
        self.cost.unwrap_or(float::MAX)
    }

    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.num_partitions,
            self.partition.iter().join(","),
            self.techs.iter().join(",")
        )
    }

    /// Writes `<prefix>.parts.<k>`, `<prefix>.techs.<k>` and a plain text
    /// `<prefix>.summary.txt` with the size of every part.
    pub fn save_results(&self, prefix: &str, library: &DesignLibrary) -> Result<()> {
        let k = self.num_partitions;
        let names = library.names_of(&self.techs);
        write_partition(format!("{prefix}.parts.{k}"), &self.partition)?;
        write_techs(format!("{prefix}.techs.{k}"), &names)?;

        let mut sizes = vec![0usize; k];
        for &p in &self.partition {
            if let Some(size) = sizes.get_mut(p) {
                *size += 1;
            }
        }
        let n = self.partition.len().max(1).float();
        let writer = FileWriter::new(format!("{prefix}.summary.txt"))?;
        match self.cost {
            Some(cost) if cost < float::MAX => writer.write_line(&format!("cost: {cost:.6}"))?,
            _ => writer.write_line("cost: -")?,
        }
        writer.write_line(&format!("valid: {}", self.valid))?;
        writer.write_line(&format!("num_parts: {k}"))?;
        writer.write_line(&format!("techs: {}", names.join(",")))?;
        for (p, (name, size)) in names.iter().zip(&sizes).enumerate() {
            writer.write_line(&format!(
                "part {p}: {name}, {size} vertices ({:.1}%)",
                100.0 * size.float() / n
            ))?;
        }
        writer.flush()
    }
}

/// Sorts by fitness (lower is better) and repeats the ranking until
/// `pool_size` individuals are drawn.
pub fn create_mating_pool<T: Clone>(population: &[T], fitness: &[float], pool_size: usize) -> Vec<T> {
    if population.is_empty() {
        return Vec::new();
    }
    let ranked = (0..population.len())
        .sorted_by_key(|&i| OrderedFloat(fitness.get(i).copied().unwrap_or(float::MAX)))
        .collect_vec();
    ranked
        .iter()
        .cycle()
        .take(pool_size)
        .map(|&i| population[i].clone())
        .collect()
}

#[derive(Debug, Clone)]
struct Fitness {
    cost: float,
    valid: bool,
    partition: Vec<usize>,
}

impl Fitness {
    fn of(result: Result<PartitionResult>) -> Self {
        match result {
            Ok(r) => Fitness {
                cost: if r.valid { r.cost } else { float::MAX },
                valid: r.valid,
                partition: r.partition,
            },
            Err(e) => {
                warn!("{e}");
                Fitness {
                    cost: float::MAX,
                    valid: false,
                    partition: Vec::new(),
                }
            }
        }
    }
}

pub(crate) fn check_available(engine: &ChipletPart, techs: &[usize]) -> Result<()> {
    if techs.is_empty() {
        return Err(ChipletError::Config("no technology to choose from".to_string()));
    }
    engine.check_techs(techs)
}

// --------------------------------------------------------------------------------
// ### Simple mode
// --------------------------------------------------------------------------------

/// Evolves technology vectors only. Every individual is scored with
/// [`ChipletPart::quick_tech_result`].
pub struct GeneticPart<'a> {
    engine: &'a ChipletPart,
    config: GeneticConfig,
    techs: Vec<usize>,
    rng: StdRng,
    cache: Dict<String, Fitness>,
    evaluations: usize,
}

#[bon]
impl<'a> GeneticPart<'a> {
    #[builder]
    pub fn new(
        engine: &'a ChipletPart,
        techs: Vec<usize>,
        #[builder(default)] config: GeneticConfig,
    ) -> Self {
        let rng = seeded_rng(config.seed);
        Self {
            engine,
            config,
            techs,
            rng,
            cache: Dict::new(),
            evaluations: 0,
        }
    }
}

impl<'a> GeneticPart<'a> {
    /// Number of distinct individuals scored so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn cached_fitness(&self) -> Vec<float> {
        self.cache.values().map(|f| f.cost).collect()
    }

    fn key(&self, individual: &[usize]) -> String {
        self.engine.tech_names(individual).join(",")
    }

    fn random_tech(&mut self) -> usize {
        self.techs[self.rng.random_range(0..self.techs.len())]
    }

    fn random_individual(&mut self, max_len: usize) -> Vec<usize> {
        let len = self.rng.random_range(1..=max_len);
        (0..len).map(|_| self.random_tech()).collect()
    }

    /// Scores every individual, evaluating each distinct gene sequence once.
    pub fn evaluate(&mut self, population: &[Vec<usize>]) -> Vec<float> {
        let keys = population.iter().map(|ind| self.key(ind)).collect_vec();
        let missing = population
            .iter()
            .zip(&keys)
            .filter(|(_, key)| !self.cache.contains_key(*key))
            .unique_by(|(_, key)| (*key).clone())
            .map(|(ind, key)| (ind.clone(), key.clone()))
            .collect_vec();
        let engine = self.engine;
        let fresh: Vec<(String, Fitness)> = engine.install(|| {
            missing
                .into_par_iter()
                .map(|(ind, key)| (key, Fitness::of(engine.quick_tech_result(&ind))))
                .collect()
        });
        self.evaluations += fresh.len();
        self.cache.extend(fresh);
        keys.iter()
            .map(|key| self.cache.get(key).map_or(float::MAX, |f| f.cost))
            .collect()
    }

    /// Single point crossover over the shorter parent.
    fn crossover(&mut self, first: &[usize], second: &[usize]) -> Vec<usize> {
        let len = first.len().min(second.len());
        if len == 0 {
            return first.to_vec();
        }
        let cut = self.rng.random_range(0..len);
        first[..cut].iter().chain(&second[cut..len]).copied().collect()
    }

    fn mutate(&mut self, individual: &mut [usize]) {
        if individual.is_empty() {
            return;
        }
        let pos = self.rng.random_range(0..individual.len());
        individual[pos] = self.random_tech();
    }

    #[time("Genetic technology search")]
    pub fn run(&mut self) -> Result<GeneticSolution> {
        check_available(self.engine, &self.techs)?;
        let size = self.config.population_size.max(SIMPLE_ELITES + 2);
        let max_len = self.config.max_partitions.max(1);
        let mutation_rate = self.config.mutation_rate.clamp(0.0, 1.0);

        let mut population = (0..size).map(|_| self.random_individual(max_len)).collect_vec();
        let mut best: Option<(Vec<usize>, float)> = None;
        let mut stale = 0;
        for generation in 0..self.config.num_generations {
            let fitness = self.evaluate(&population);
            let Some(leader) = (0..population.len()).min_by_key(|&i| OrderedFloat(fitness[i])) else {
                break;
            };
            let improved = best.as_ref().is_none_or(|(_, cost)| fitness[leader] < *cost);
            if improved {
                best = Some((population[leader].clone(), fitness[leader]));
            }
            info!(
                "Generation {}: best [{}] {:.4}",
                generation + 1,
                self.engine.tech_names(&population[leader]).join(", "),
                fitness[leader]
            );
            if generation >= self.config.gen_threshold {
                stale = if improved { 0 } else { stale + 1 };
                if stale >= SIMPLE_PATIENCE {
                    info!("No improvement for {stale} generations, stopping");
                    break;
                }
            }

            let pool = create_mating_pool(&population, &fitness, size);
            let mut next = Vec::with_capacity(size);
            for pair in pool.chunks_exact(2) {
                if next.len() + SIMPLE_ELITES >= size {
                    break;
                }
                let first = self.crossover(&pair[0], &pair[1]);
                let second = self.crossover(&pair[1], &pair[0]);
                next.push(first);
                next.push(second);
            }
            next.truncate(size - SIMPLE_ELITES);
            for individual in &mut next {
                if self.rng.random_bool(mutation_rate) {
                    self.mutate(individual);
                }
            }
            next.extend(pool.into_iter().take(SIMPLE_ELITES));
            population = next;
        }

        let (techs, _) = best.ok_or_else(|| {
            ChipletError::Config("the genetic search needs at least one generation".to_string())
        })?;
        let fitness = self.cache.get(&self.key(&techs)).cloned().unwrap_or_else(|| Fitness {
            cost: float::MAX,
            valid: false,
            partition: Vec::new(),
        });
        Ok(GeneticSolution {
            num_partitions: techs.len(),
            partition: fitness.partition,
            techs,
            cost: Some(fitness.cost),
            valid: fitness.valid,
        })
    }
}

// --------------------------------------------------------------------------------
// ### General mode
// --------------------------------------------------------------------------------

/// Evolves partitions and technologies together.
pub struct GeneticTechPartitioner<'a> {
    engine: &'a ChipletPart,
    config: GeneticConfig,
    techs: Vec<usize>,
    min_partitions: usize,
    max_partitions: usize,
    rng: StdRng,
    cache: Mutex<Dict<String, Fitness>>,
}

#[bon]
impl<'a> GeneticTechPartitioner<'a> {
    #[builder]
    pub fn new(
        engine: &'a ChipletPart,
        techs: Vec<usize>,
        #[builder(default)] config: GeneticConfig,
    ) -> Self {
        let n = engine.hgraph().num_vertices().max(1);
        let min_partitions = config.min_partitions.clamp(1, n);
        let max_partitions = config.max_partitions.min(n).max(min_partitions);
        let rng = seeded_rng(config.seed);
        Self {
            engine,
            config,
            techs,
            min_partitions,
            max_partitions,
            rng,
            cache: Mutex::new(Dict::new()),
        }
    }
}

impl<'a> GeneticTechPartitioner<'a> {
    pub fn partition_range(&self) -> (usize, usize) {
        (self.min_partitions, self.max_partitions)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().map_or_else(|e| e.into_inner().len(), |c| c.len())
    }

    fn num_vertices(&self) -> usize {
        self.engine.hgraph().num_vertices()
    }

    fn random_tech(&mut self) -> usize {
        self.techs[self.rng.random_range(0..self.techs.len())]
    }

    fn random_techs(&mut self, k: usize) -> Vec<usize> {
        (0..k).map(|_| self.random_tech()).collect()
    }

    fn random_partition(&mut self, k: usize) -> Vec<usize> {
        let k = k.max(1);
        (0..self.num_vertices()).map(|_| self.rng.random_range(0..k)).collect()
    }

    /// Random, balanced and generated partitions for every allowed size.
    pub fn create_initial_partitions(&mut self) -> Vec<Vec<usize>> {
        let n = self.num_vertices();
        let mut partitions = Vec::new();
        for k in self.min_partitions..=self.max_partitions {
            for _ in 0..RANDOM_SEEDS_PER_K {
                partitions.push(self.random_partition(k));
            }
            partitions.push((0..n).map(|v| v % k).collect());
        }
        for k in self.min_partitions..=self.max_partitions {
            partitions.extend(self.engine.tech_candidates(k).into_iter().map(|c| c.partition));
        }
        partitions
    }

    pub fn initialize_population(&mut self) -> Vec<GeneticSolution> {
        let size = self.config.population_size.max(1);
        let mut seeds = self.create_initial_partitions().into_iter();
        (0..size)
            .map(|_| {
                let partition = seeds.next().unwrap_or_else(|| {
                    let k = self.rng.random_range(self.min_partitions..=self.max_partitions);
                    self.random_partition(k)
                });
                let k = num_parts_of(&partition);
                let techs = self.random_techs(k);
                let mut solution = GeneticSolution::new(partition, techs);
                self.repair_solution(&mut solution);
                solution
            })
            .collect()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Dict<String, Fitness>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(solution: &mut GeneticSolution, fitness: &Fitness) {
        solution.cost = Some(fitness.cost);
        solution.valid = fitness.valid;
        if fitness.partition.len() == solution.partition.len() {
            solution.partition.clone_from(&fitness.partition);
            compact(solution);
        }
    }

    /// Refines the solution's partition for its technologies and records the
    /// exact cost. Results are cached by the pre-refinement solution.
    pub fn evaluate_fitness(&self, solution: &mut GeneticSolution) {
        if solution.cost.is_some() {
            return;
        }
        let key = solution.cache_key();
        let cached = self.lock_cache().get(&key).cloned();
        let fitness = match cached {
            Some(fitness) => fitness,
            None => {
                let fitness = self.score(solution);
                self.lock_cache().insert(key, fitness.clone());
                fitness
            }
        };
        Self::apply(solution, &fitness);
    }

    fn score(&self, solution: &GeneticSolution) -> Fitness {
        if solution.techs.len() < solution.num_partitions {
            return Fitness::of(Err(ChipletError::InvalidPartition(format!(
                "{} technologies for {} parts",
                solution.techs.len(),
                solution.num_partitions
            ))));
        }
        let techs = &solution.techs[..solution.num_partitions];
        Fitness::of(Ok(self.engine.refine_tech_partition(solution.partition.clone(), techs)))
    }

    fn evaluate_population(&self, population: &mut [GeneticSolution]) {
        let unique = population
            .iter()
            .filter(|s| s.cost.is_none())
            .unique_by(|s| s.cache_key())
            .cloned()
            .collect_vec();
        self.engine.install(|| {
            unique.into_par_iter().for_each(|mut s| self.evaluate_fitness(&mut s));
        });
        for solution in population.iter_mut() {
            self.evaluate_fitness(solution);
        }
    }

    fn tournament(&mut self, population: &[GeneticSolution]) -> usize {
        let size = self.config.tournament_size.max(1);
        (0..size)
            .map(|_| self.rng.random_range(0..population.len()))
            .min_by_key(|&i| OrderedFloat(population[i].fitness()))
            .unwrap_or(0)
    }

    /// One of three recombinations, picked at random:
    /// a single cut on the partition, a uniform mix of technologies over the
    /// better partition, or a fresh random partition sized like a parent.
    pub fn crossover(&mut self, first: &GeneticSolution, second: &GeneticSolution) -> GeneticSolution {
        let (better, worse) = if first.fitness() <= second.fitness() {
            (first, second)
        } else {
            (second, first)
        };
        let mut child = match self.rng.random_range(0..3) {
            0 => {
                let n = first.partition.len().min(second.partition.len());
                let cut = self.rng.random_range(0..=n);
                let partition = first.partition[..cut]
                    .iter()
                    .chain(&second.partition[cut..n])
                    .copied()
                    .collect_vec();
                let k = num_parts_of(&partition);
                let mut techs = better.techs.clone();
                techs.truncate(k);
                while techs.len() < k {
                    techs.push(self.random_tech());
                }
                GeneticSolution::new(partition, techs)
            }
            1 => {
                let techs = (0..better.num_partitions)
                    .map(|p| match worse.techs.get(p) {
                        Some(&t) if self.rng.random_bool(0.5) => t,
                        _ => better.techs.get(p).copied().unwrap_or(first_tech(&self.techs)),
                    })
                    .collect_vec();
                GeneticSolution::new(better.partition.clone(), techs)
            }
            _ => {
                let k = if self.rng.random_bool(0.5) {
                    first.num_partitions
                } else {
                    second.num_partitions
                };
                let partition = self.random_partition(k);
                let techs = (0..k)
                    .map(|p| {
                        let parent = if self.rng.random_bool(0.5) { first } else { second };
                        match parent.techs.get(p) {
                            Some(&t) => t,
                            None => self.random_tech(),
                        }
                    })
                    .collect_vec();
                GeneticSolution::new(partition, techs)
            }
        };
        child.cost = None;
        child
    }

    /// One of three mutations, picked at random: reassign a few vertices,
    /// change a third of the technologies, or merge/split parts.
    pub fn mutate(&mut self, solution: &mut GeneticSolution) {
        let n = solution.partition.len();
        let k = solution.num_partitions.max(1);
        match self.rng.random_range(0..3) {
            0 if n > 0 => {
                let moves = (n.float() * REASSIGN_FRACTION).usize().max(1);
                for _ in 0..moves {
                    let v = self.rng.random_range(0..n);
                    solution.partition[v] = self.rng.random_range(0..k);
                }
            }
            1 if !solution.techs.is_empty() => {
                for _ in 0..(k / 3).max(1) {
                    let p = self.rng.random_range(0..solution.techs.len());
                    solution.techs[p] = self.random_tech();
                }
            }
            _ => {
                let can_merge = k > self.min_partitions && k > 1;
                let can_split = k < self.max_partitions;
                if can_merge && (!can_split || self.rng.random_bool(0.5)) {
                    let from = self.rng.random_range(0..k);
                    let into = (from + self.rng.random_range(1..k)) % k;
                    for p in solution.partition.iter_mut().filter(|p| **p == from) {
                        *p = into;
                    }
                } else if can_split {
                    let source = self.rng.random_range(0..k);
                    let members = (0..n).filter(|&v| solution.partition[v] == source).collect_vec();
                    if members.len() > 1 {
                        for &v in members.iter().skip(1) {
                            if self.rng.random_bool(0.5) {
                                solution.partition[v] = k;
                            }
                        }
                        if !solution.partition.contains(&k) {
                            solution.partition[members[members.len() - 1]] = k;
                        }
                        let inherited = solution.techs.get(source).copied();
                        let tech = match inherited {
                            Some(t) if self.rng.random_bool(SPLIT_TECH_INHERITANCE) => t,
                            _ => self.random_tech(),
                        };
                        solution.techs.truncate(k);
                        while solution.techs.len() < k {
                            solution.techs.push(self.random_tech());
                        }
                        solution.techs.push(tech);
                    }
                }
            }
        }
        solution.num_partitions = num_parts_of(&solution.partition);
        solution.cost = None;
    }

    /// Dense part ids, a part count inside the allowed range and a
    /// technology for every part.
    pub fn repair_solution(&mut self, solution: &mut GeneticSolution) {
        compact(solution);
        while solution.num_partitions < self.min_partitions {
            let k = solution.num_partitions;
            let mut sizes = vec![0usize; k];
            for &p in &solution.partition {
                sizes[p] += 1;
            }
            let Some((largest, &size)) = sizes.iter().enumerate().max_by_key(|(_, s)| **s) else {
                break;
            };
            if size < 2 {
                break;
            }
            let moves = REPAIR_MOVES.min(size - 1);
            for p in solution
                .partition
                .iter_mut()
                .filter(|p| **p == largest)
                .take(moves)
            {
                *p = k;
            }
            solution.num_partitions = k + 1;
        }
        if solution.num_partitions > self.max_partitions {
            for p in solution.partition.iter_mut().filter(|p| **p >= self.max_partitions) {
                *p = 0;
            }
            solution.num_partitions = self.max_partitions;
        }
        let k = solution.num_partitions;
        solution.techs.truncate(k);
        while solution.techs.len() < k {
            let tech = self.random_tech();
            solution.techs.push(tech);
        }
        solution.cost = None;
    }

    fn breed(&mut self, population: &[GeneticSolution]) -> Vec<GeneticSolution> {
        let size = population.len();
        let crossover_rate = self.config.crossover_rate.clamp(0.0, 1.0);
        let mutation_rate = self.config.mutation_rate.clamp(0.0, 1.0);
        let mut next = population
            .iter()
            .sorted_by_key(|s| OrderedFloat(s.fitness()))
            .take(self.config.elite_count.min(size))
            .cloned()
            .collect_vec();
        while next.len() < size {
            let first = self.tournament(population);
            let second = self.tournament(population);
            let (first, second) = (&population[first], &population[second]);
            if self.rng.random_bool(crossover_rate) {
                let mut child = self.crossover(first, second);
                if self.rng.random_bool(mutation_rate) {
                    self.mutate(&mut child);
                }
                self.repair_solution(&mut child);
                next.push(child);
            } else {
                for parent in [first, second] {
                    if next.len() >= size {
                        break;
                    }
                    let mut child = parent.clone();
                    if self.rng.random_bool(mutation_rate) {
                        self.mutate(&mut child);
                        self.repair_solution(&mut child);
                    }
                    next.push(child);
                }
            }
        }
        next
    }

    #[time("Genetic technology partitioning")]
    pub fn run(&mut self) -> Result<GeneticSolution> {
        check_available(self.engine, &self.techs)?;
        info!(
            "Evolving {} to {} parts over {} generations",
            self.min_partitions, self.max_partitions, self.config.num_generations
        );
        let mut population = self.initialize_population();
        let mut best: Option<GeneticSolution> = None;
        let mut previous = float::MAX;
        let mut converged = 0;
        for generation in 0..self.config.num_generations {
            self.evaluate_population(&mut population);
            let Some(leader) = population.iter().min_by_key(|s| OrderedFloat(s.fitness())) else {
                break;
            };
            let leader_cost = leader.fitness();
            if best.as_ref().is_none_or(|b| leader_cost < b.fitness()) {
                best = Some(leader.clone());
            }
            let feasible = population.iter().filter(|s| s.valid).map(|s| s.fitness()).collect_vec();
            let (mean, _) = mean_std(&feasible);
            info!(
                "Generation {}: best {:.4}, mean {:.4}, {} feasible",
                generation + 1,
                leader_cost,
                mean,
                feasible.len()
            );

            if (leader_cost - previous).abs() < CONVERGENCE_TOLERANCE * previous {
                converged += 1;
                if converged >= CONVERGENCE_LIMIT {
                    info!("Converged after {} generations", generation + 1);
                    break;
                }
            } else {
                converged = 0;
                previous = leader_cost;
            }
            population = self.breed(&population);
        }
        let best = best.ok_or_else(|| {
            ChipletError::Config("the genetic search needs at least one generation".to_string())
        })?;
        self.print_summary(&best);
        Ok(best)
    }

    fn print_summary(&self, best: &GeneticSolution) {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_BOX_CHARS);
        table.add_row(row!["Part", "Technology", "Vertices"]);
        for (p, name) in self.engine.tech_names(&best.techs).iter().enumerate() {
            let size = best.partition.iter().filter(|&&q| q == p).count();
            table.add_row(row![p, name, size]);
        }
        table.printstd();
        info!(
            "Best solution: {} parts, cost {:.4}, {} ({} distinct evaluations)",
            best.num_partitions,
            best.fitness(),
            if best.valid { "feasible".green() } else { "infeasible".red() },
            self.cache_len()
        );
    }

    pub fn save_results(&self, solution: &GeneticSolution, prefix: &str) -> Result<()> {
        solution.save_results(prefix, self.engine.library())
    }
}

fn first_tech(techs: &[usize]) -> usize {
    techs.first().copied().unwrap_or(0)
}

/// Relabels parts densely by first appearance, carrying technologies along.
fn compact(solution: &mut GeneticSolution) {
    let fallback = first_tech(&solution.techs);
    let mut mapping = Dict::new();
    let mut techs = Vec::new();
    for p in solution.partition.iter_mut() {
        let next = mapping.len();
        let id = *mapping.entry(*p).or_insert_with(|| {
            techs.push(solution.techs.get(*p).copied().unwrap_or(fallback));
            next
        });
        *p = id;
    }
    solution.num_partitions = mapping.len().max(1);
    if techs.is_empty() {
        techs.push(fallback);
    }
    solution.techs = techs;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chiplet_part::tests::unreachable_engine;
    use crate::hypergraph::tests::path_graph;
    use pretty_assertions::assert_eq;

    fn engine(prefix: &str) -> ChipletPart {
        let config = PartitionConfig::builder()
            .floorplan_steps(100)
            .floorplan_perturbations(20)
            .output_prefix(
                std::env::temp_dir()
                    .join(format!("chiplet_part_{}_{prefix}", std::process::id()))
                    .display()
                    .to_string(),
            )
            .build();
        ChipletPart::builder()
            .hgraph(Arc::new(path_graph(20.0, 10.0)))
            .library(Arc::new(DesignLibrary::builtin()))
            .config(config)
            .build()
    }

    fn small_config() -> GeneticConfig {
        GeneticConfig::builder()
            .population_size(6)
            .num_generations(3)
            .min_partitions(1)
            .max_partitions(3)
            .build()
    }

    #[test]
    fn test_mating_pool_cycles_ranking() {
        let population = vec!["a", "b", "c"];
        let pool = create_mating_pool(&population, &[3.0, 1.0, 2.0], 7);
        assert_eq!(pool, vec!["b", "c", "a", "b", "c", "a", "b"]);
        assert!(create_mating_pool::<&str>(&[], &[], 4).is_empty());
    }

    #[test]
    fn test_simple_mode_evaluates_each_sequence_once() {
        let engine = engine("simple");
        let mut ga = GeneticPart::builder()
            .engine(&engine)
            .techs(vec![0, 2])
            .config(
                GeneticConfig::builder()
                    .population_size(4)
                    .num_generations(3)
                    .max_partitions(2)
                    .build(),
            )
            .build();
        let best = ga.run().unwrap();
        assert_eq!(best.techs.len(), best.num_partitions);
        assert_eq!(best.partition.len(), 5);
        assert!(best.fitness() > 0.0);
        // repeats of a sequence are served from the cache
        assert_eq!(ga.evaluations(), ga.cached_fitness().len());
        assert!(ga.cached_fitness().iter().all(|&c| c > 0.0));

        let before = ga.evaluations();
        let again = ga.evaluate(&[vec![0], vec![0], vec![2, 0]]);
        assert_eq!(again.len(), 3);
        assert_eq!(again[0], again[1]);
        assert!(ga.evaluations() <= before + 2);
        assert!(ga.evaluate(&[vec![0]]) == vec![again[0]]);
    }

    #[test]
    fn test_simple_mode_rejects_empty_library_choice() {
        let engine = engine("simple_empty");
        let mut ga = GeneticPart::builder().engine(&engine).techs(vec![]).build();
        assert!(matches!(ga.run(), Err(ChipletError::Config(_))));
    }

    #[test]
    fn test_repair_relabels_and_clamps() {
        let engine = engine("repair");
        let mut ga = GeneticTechPartitioner::builder()
            .engine(&engine)
            .techs(vec![0, 1, 2])
            .config(GeneticConfig::builder().min_partitions(1).max_partitions(2).build())
            .build();
        let mut s = GeneticSolution::new(vec![3, 3, 7, 7, 9], (0..10).collect());
        ga.repair_solution(&mut s);
        assert_eq!(s.partition, vec![0, 0, 1, 1, 0]);
        assert_eq!(s.techs, vec![3, 7]);
        assert_eq!(s.num_partitions, 2);
        assert_eq!(s.cost, None);

        let mut ga = GeneticTechPartitioner::builder()
            .engine(&engine)
            .techs(vec![0, 1, 2])
            .config(GeneticConfig::builder().min_partitions(3).max_partitions(4).build())
            .build();
        let mut s = GeneticSolution::new(vec![0; 5], vec![1]);
        ga.repair_solution(&mut s);
        assert_eq!(s.num_partitions, 3);
        assert_eq!(num_parts_of(&s.partition), 3);
        assert_eq!(s.techs.len(), 3);
        assert_eq!(s.techs[0], 1);
    }

    #[test]
    fn test_operators_keep_solutions_consistent() {
        let engine = engine("operators");
        let mut ga = GeneticTechPartitioner::builder()
            .engine(&engine)
            .techs(vec![0, 2, 4])
            .config(small_config())
            .build();
        let population = ga.initialize_population();
        assert_eq!(population.len(), 6);
        for i in 0..40 {
            let first = &population[i % population.len()];
            let second = &population[(i * 7 + 1) % population.len()];
            let mut child = ga.crossover(first, second);
            ga.mutate(&mut child);
            ga.repair_solution(&mut child);
            let (min, max) = ga.partition_range();
            assert_eq!(child.partition.len(), 5);
            assert_eq!(child.num_partitions, num_parts_of(&child.partition));
            assert!((min..=max).contains(&child.num_partitions));
            assert_eq!(child.techs.len(), child.num_partitions);
            assert!(child.techs.iter().all(|t| [0, 2, 4].contains(t)));
        }
    }

    #[test]
    fn test_general_mode_run_and_save() {
        let engine = engine("general");
        let mut ga = GeneticTechPartitioner::builder()
            .engine(&engine)
            .techs(vec![2, 4])
            .config(small_config())
            .build();
        let best = ga.run().unwrap();
        assert_eq!(best.partition.len(), 5);
        assert!((1..=3).contains(&best.num_partitions));
        assert_eq!(best.techs.len(), best.num_partitions);
        assert!(best.cost.is_some());
        assert!(ga.cache_len() > 0);

        let mut again = GeneticSolution::new(best.partition.clone(), best.techs.clone());
        ga.evaluate_fitness(&mut again);
        assert!(again.cost.is_some());

        let prefix = engine.config().output_prefix.clone();
        ga.save_results(&best, &prefix).unwrap();
        let k = best.num_partitions;
        assert_eq!(
            read_partition_file(format!("{prefix}.parts.{k}"), 5).unwrap(),
            best.partition
        );
        let summary = fs::read_to_string(format!("{prefix}.summary.txt")).unwrap();
        assert!(summary.contains(&format!("num_parts: {k}")));
        assert!(summary.contains("part 0:"));
        for file in [format!("parts.{k}"), format!("techs.{k}"), "summary.txt".to_string()] {
            let _ = fs::remove_file(format!("{prefix}.{file}"));
        }
    }

    #[test]
    fn test_general_mode_reports_unfloorplannable_best_as_invalid() {
        let engine = unreachable_engine();
        let mut ga = GeneticTechPartitioner::builder()
            .engine(&engine)
            .techs(vec![0])
            .config(
                GeneticConfig::builder()
                    .population_size(4)
                    .num_generations(2)
                    .min_partitions(2)
                    .max_partitions(2)
                    .build(),
            )
            .build();
        let best = ga.run().unwrap();
        assert_eq!(best.num_partitions, 2);
        assert!(!best.valid);
        assert_eq!(best.fitness(), float::MAX);
    }
}

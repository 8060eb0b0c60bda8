use crate::*;

/// Attempts per requested individual when drawing a unique population.
const UNIQUE_ATTEMPTS_PER_SLOT: usize = 10;
/// Generations that run before the population may be declared converged.
const CONVERGENCE_WARMUP: usize = 50;
const CONVERGENCE_SPREAD: float = 0.001;

/// Sorts a technology vector by frequency (descending), then technology
/// index (ascending). Permutations of one multiset share a canonical form.
pub fn canonicalize(assignment: &[usize]) -> Vec<usize> {
    assignment
        .iter()
        .copied()
        .counts()
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .flat_map(|(tech, count)| std::iter::repeat(tech).take(count))
        .collect()
}

pub fn assignment_hash(assignment: &[usize]) -> String {
    canonicalize(assignment).iter().join(",")
}

/// Evolves technology multisets. Each canonical form is priced once with
/// [`ChipletPart::evaluate_tech_partition`].
pub struct CanonicalGa<'a> {
    engine: &'a ChipletPart,
    config: GeneticConfig,
    techs: Vec<usize>,
    min_partitions: usize,
    max_partitions: usize,
    rng: StdRng,
    cache: Mutex<Dict<String, (float, Vec<usize>)>>,
}

#[bon]
impl<'a> CanonicalGa<'a> {
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

impl<'a> CanonicalGa<'a> {
    pub fn partition_range(&self) -> (usize, usize) {
        (self.min_partitions, self.max_partitions)
    }

    /// Distinct canonical forms evaluated so far.
    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Dict<String, (float, Vec<usize>)>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn random_tech(&mut self) -> usize {
        self.techs[self.rng.random_range(0..self.techs.len())]
    }

    fn random_assignment(&mut self) -> Vec<usize> {
        let k = self.rng.random_range(self.min_partitions..=self.max_partitions);
        (0..k).map(|_| self.random_tech()).collect()
    }

    /// Random assignments with pairwise distinct canonical forms. When the
    /// space runs out the remaining slots are filled with repeats.
    pub fn initialize_population(&mut self) -> Vec<Vec<usize>> {
        let size = self.config.population_size.max(1);
        let mut seen = Set::new();
        let mut population = Vec::with_capacity(size);
        for _ in 0..size * UNIQUE_ATTEMPTS_PER_SLOT {
            if population.len() >= size {
                break;
            }
            let assignment = self.random_assignment();
            if seen.insert(assignment_hash(&assignment)) {
                population.push(assignment);
            }
        }
        debug!(target:"internal", "{} unique individuals drawn", population.len());
        while population.len() < size {
            let assignment = self.random_assignment();
            population.push(assignment);
        }
        population
    }

    /// Cost of every individual. Canonical forms missing from the cache are
    /// evaluated in parallel.
    pub fn evaluate(&self, population: &[Vec<usize>]) -> Vec<float> {
        let hashes = population.iter().map(|a| assignment_hash(a)).collect_vec();
        let missing = {
            let cache = self.lock_cache();
            population
                .iter()
                .zip(&hashes)
                .filter(|(_, hash)| !cache.contains_key(*hash))
                .unique_by(|(_, hash)| (*hash).clone())
                .map(|(a, hash)| (canonicalize(a), hash.clone()))
                .collect_vec()
        };
        let engine = self.engine;
        engine.install(|| {
            missing.into_par_iter().for_each(|(canonical, hash)| {
                let evaluated = engine.evaluate_tech_partition(&canonical);
                self.lock_cache().insert(hash, evaluated);
            });
        });
        let cache = self.lock_cache();
        let costs: Vec<float> = hashes
            .iter()
            .map(|hash| cache.get(hash).map_or(float::MAX, |(cost, _)| *cost))
            .collect();
        costs
    }

    fn tournament(&mut self, fitness: &[float]) -> usize {
        let size = self.config.tournament_size.max(1);
        (0..size)
            .map(|_| self.rng.random_range(0..fitness.len()))
            .min_by_key(|&i| OrderedFloat(fitness[i]))
            .unwrap_or(0)
    }

    /// One point, uniform over the shorter parent, or `first`'s length with
    /// technologies mixed from both parents.
    pub fn crossover(&mut self, first: &[usize], second: &[usize]) -> Vec<usize> {
        let shorter = first.len().min(second.len());
        match self.rng.random_range(0..3) {
            0 => {
                if shorter <= 1 {
                    return first.to_vec();
                }
                let cut = self.rng.random_range(1..shorter);
                first[..cut].iter().chain(&second[cut..shorter]).copied().collect()
            }
            1 => (0..shorter)
                .map(|i| if self.rng.random_bool(0.5) { first[i] } else { second[i] })
                .collect(),
            _ => (0..first.len())
                .map(|i| match second.get(i) {
                    Some(&t) if self.rng.random_bool(0.5) => t,
                    _ => first[i],
                })
                .collect(),
        }
    }

    /// Changes a few technologies, grows or shrinks the vector by one, or
    /// swaps two positions.
    pub fn mutate(&mut self, assignment: &mut Vec<usize>) {
        if assignment.is_empty() {
            return;
        }
        let len = assignment.len();
        match self.rng.random_range(0..3) {
            0 => {
                let changes = (len.float() * self.config.mutation_rate).usize().max(1);
                for _ in 0..changes {
                    let pos = self.rng.random_range(0..len);
                    assignment[pos] = self.random_tech();
                }
            }
            1 if len > self.min_partitions && len < self.max_partitions => {
                if self.rng.random_bool(0.5) {
                    let tech = self.random_tech();
                    assignment.push(tech);
                } else {
                    let pos = self.rng.random_range(0..len);
                    assignment.remove(pos);
                }
            }
            _ if len >= 2 => {
                let a = self.rng.random_range(0..len);
                let b = (a + self.rng.random_range(1..len)) % len;
                assignment.swap(a, b);
            }
            _ => {}
        }
    }

    fn clamp_length(&mut self, assignment: &mut Vec<usize>) {
        while assignment.len() < self.min_partitions {
            let tech = self.random_tech();
            assignment.push(tech);
        }
        while assignment.len() > self.max_partitions {
            let pos = self.rng.random_range(0..assignment.len());
            assignment.remove(pos);
        }
    }

    fn offspring(&mut self, population: &[Vec<usize>], fitness: &[float]) -> Vec<usize> {
        let first = self.tournament(fitness);
        let second = self.tournament(fitness);
        let mut child = if self.rng.random_bool(self.config.crossover_rate.clamp(0.0, 1.0)) {
            self.crossover(&population[first], &population[second])
        } else if fitness[first] < fitness[second] {
            population[first].clone()
        } else {
            population[second].clone()
        };
        if child.is_empty() {
            child = self.random_assignment();
        }
        if self.rng.random_bool(self.config.mutation_rate.clamp(0.0, 1.0)) {
            self.mutate(&mut child);
        }
        self.clamp_length(&mut child);
        child
    }

    #[time("Canonical genetic search")]
    pub fn run(&mut self) -> Result<GeneticSolution> {
        check_available(self.engine, &self.techs)?;
        info!(
            "Searching technology multisets of {} to {} parts from [{}]",
            self.min_partitions,
            self.max_partitions,
            self.engine.tech_names(&self.techs).join(", ")
        );

        let mut population = self.initialize_population();
        let mut fitness = self.evaluate(&population);
        let mut best = (0..population.len())
            .min_by_key(|&i| OrderedFloat(fitness[i]))
            .map(|i| (population[i].clone(), fitness[i]))
            .ok_or_else(|| ChipletError::Config("empty population".to_string()))?;

        let size = population.len();
        for generation in 0..self.config.num_generations {
            let mut next = (0..size)
                .sorted_by_key(|&i| OrderedFloat(fitness[i]))
                .take(self.config.elite_count.min(size))
                .map(|i| population[i].clone())
                .collect_vec();
            while next.len() < size {
                let child = self.offspring(&population, &fitness);
                next.push(child);
            }
            population = next;
            fitness = self.evaluate(&population);

            let (leader, mean) = match (0..size).min_by_key(|&i| OrderedFloat(fitness[i])) {
                Some(i) => (i, mean_std(&fitness).0),
                None => break,
            };
            if fitness[leader] < best.1 {
                best = (population[leader].clone(), fitness[leader]);
            }
            info!(
                "Generation {}: best {:.4}, mean {:.4}, {} forms cached",
                generation + 1,
                fitness[leader],
                mean,
                self.cache_len()
            );
            if generation > CONVERGENCE_WARMUP
                && fitness[leader] == best.1
                && (mean - fitness[leader]).abs() < CONVERGENCE_SPREAD
            {
                info!("Population converged after {} generations", generation + 1);
                break;
            }
        }

        let techs = canonicalize(&best.0);
        let (cost, partition) = self
            .lock_cache()
            .get(&assignment_hash(&techs))
            .cloned()
            .unwrap_or((float::MAX, Vec::new()));
        let valid = cost < float::MAX && !partition.is_empty();
        info!(
            "Best multiset [{}]: cost {:.4}",
            self.engine.tech_names(&techs).join(", "),
            cost
        );
        Ok(GeneticSolution {
            num_partitions: techs.len(),
            partition,
            techs,
            cost: Some(cost),
            valid,
        })
    }

    pub fn save_results(&self, solution: &GeneticSolution, prefix: &str) -> Result<()> {
        solution.save_results(prefix, self.engine.library())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chiplet_part::tests::unreachable_engine;
    use crate::hypergraph::tests::path_graph;
    use pretty_assertions::assert_eq;

    fn engine() -> ChipletPart {
        let config = PartitionConfig::builder()
            .floorplan_steps(100)
            .floorplan_perturbations(20)
            .build();
        ChipletPart::builder()
            .hgraph(Arc::new(path_graph(20.0, 10.0)))
            .library(Arc::new(DesignLibrary::builtin()))
            .config(config)
            .build()
    }

    #[test]
    fn test_canonicalize_orders_by_frequency_then_index() {
        assert_eq!(canonicalize(&[2, 0, 2, 1]), vec![2, 2, 0, 1]);
        assert_eq!(canonicalize(&[1, 0]), vec![0, 1]);
        assert_eq!(canonicalize(&[4, 4, 3, 3, 3]), vec![3, 3, 3, 4, 4]);
        assert!(canonicalize(&[]).is_empty());
        assert_eq!(assignment_hash(&[0, 2, 2]), assignment_hash(&[2, 0, 2]));
        assert_ne!(assignment_hash(&[0, 2, 2]), assignment_hash(&[0, 0, 2]));
    }

    #[test]
    fn test_initial_population_is_unique() {
        let engine = engine();
        let mut ga = CanonicalGa::builder()
            .engine(&engine)
            .techs(vec![0, 1, 2, 3, 4])
            .config(
                GeneticConfig::builder()
                    .population_size(4)
                    .min_partitions(1)
                    .max_partitions(3)
                    .build(),
            )
            .build();
        let population = ga.initialize_population();
        assert_eq!(population.len(), 4);
        assert_eq!(population.iter().map(|a| assignment_hash(a)).unique().count(), 4);
        assert!(population.iter().all(|a| (1..=3).contains(&a.len())));
    }

    #[test]
    fn test_small_space_fills_population_with_repeats() {
        let engine = engine();
        let mut ga = CanonicalGa::builder()
            .engine(&engine)
            .techs(vec![2])
            .config(
                GeneticConfig::builder()
                    .population_size(5)
                    .min_partitions(1)
                    .max_partitions(2)
                    .build(),
            )
            .build();
        let population = ga.initialize_population();
        assert_eq!(population.len(), 5);
        assert!(population.iter().map(|a| assignment_hash(a)).unique().count() <= 2);
    }

    #[test]
    fn test_operators_respect_bounds() {
        let engine = engine();
        let mut ga = CanonicalGa::builder()
            .engine(&engine)
            .techs(vec![0, 2, 4])
            .config(
                GeneticConfig::builder()
                    .population_size(6)
                    .min_partitions(2)
                    .max_partitions(4)
                    .build(),
            )
            .build();
        let population = ga.initialize_population();
        let fitness = vec![1.0; population.len()];
        for _ in 0..50 {
            let child = ga.offspring(&population, &fitness);
            assert!((2..=4).contains(&child.len()));
            assert!(child.iter().all(|t| [0, 2, 4].contains(t)));
        }
        let mut single = vec![2];
        ga.mutate(&mut single);
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn test_run_caches_by_canonical_form() {
        let engine = engine();
        let mut ga = CanonicalGa::builder()
            .engine(&engine)
            .techs(vec![2, 4])
            .config(
                GeneticConfig::builder()
                    .population_size(4)
                    .num_generations(2)
                    .min_partitions(1)
                    .max_partitions(2)
                    .build(),
            )
            .build();
        let best = ga.run().unwrap();
        assert!(best.valid);
        assert_eq!(best.partition.len(), 5);
        assert_eq!(best.techs, canonicalize(&best.techs));
        // only 2 + 3 multisets exist
        assert!(ga.cache_len() <= 5);

        let costs = ga.evaluate(&[vec![4, 2], vec![2, 4]]);
        assert_eq!(costs[0], costs[1]);
    }

    #[test]
    fn test_unfloorplannable_multiset_is_invalid() {
        let engine = unreachable_engine();
        let mut ga = CanonicalGa::builder()
            .engine(&engine)
            .techs(vec![0])
            .config(
                GeneticConfig::builder()
                    .population_size(2)
                    .num_generations(1)
                    .min_partitions(2)
                    .max_partitions(2)
                    .build(),
            )
            .build();
        let best = ga.run().unwrap();
        assert_eq!(best.techs, vec![0, 0]);
        assert!(!best.valid);
        assert_eq!(best.fitness(), float::MAX);
    }
}

use anyhow::{bail, Context, Result};
use chiplet_part::*;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{Level, LevelFilter};
use pretty_env_logger::formatted_builder;

#[derive(Parser)]
#[command(version, about = "Chiplet partitioning with floorplan-aware refinement")]
struct Cli {
    /// Technology library in JSON; the built-in library is used otherwise.
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    /// Also print the per-step internal log.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Input {
    /// Hypergraph in hMETIS format.
    hypergraph: PathBuf,

    /// Reach of edges that do not carry their own.
    #[arg(long, default_value_t = 0.5)]
    reach: float,

    /// IO area of edges that do not carry their own.
    #[arg(long, default_value_t = 0.1)]
    io_size: float,

    /// Gap kept between chiplets by the floorplanner.
    #[arg(long, default_value_t = 0.1)]
    separation: float,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Worker threads; 0 keeps the global pool.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Prefix of every file written.
    #[arg(short, long, default_value = "chiplet")]
    output: String,

    /// Shell command computing a k-way partition of a METIS graph.
    #[arg(long)]
    partitioner: Option<String>,

    /// Shell command printing spectral embedding labels.
    #[arg(long)]
    embedding: Option<String>,
}

#[derive(Args)]
struct Evolution {
    /// Comma separated technology names to choose from.
    #[arg(long, value_delimiter = ',', required = true)]
    techs: Vec<String>,

    #[arg(long, default_value_t = 50)]
    population: usize,

    #[arg(long, default_value_t = 50)]
    generations: usize,

    #[arg(long, default_value_t = 0.2)]
    mutation_rate: float,

    #[arg(long, default_value_t = 0.7)]
    crossover_rate: float,

    #[arg(long, default_value_t = 2)]
    min_partitions: usize,

    #[arg(long, default_value_t = 8)]
    max_partitions: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum GeneticMode {
    /// Technology vectors only.
    Simple,
    /// Partitions and technologies together.
    General,
    /// Technology multisets.
    Canonical,
}

#[derive(Subcommand)]
enum Commands {
    /// Best partition with every chiplet in one technology.
    Partition {
        #[command(flatten)]
        input: Input,
        #[arg(long, default_value = "7nm")]
        tech: String,
        /// Allowed imbalance in percent.
        #[arg(long, default_value_t = 2.0)]
        ub_factor: float,
        /// Keep refinement within the imbalance limit.
        #[arg(long)]
        balanced: bool,
        /// Part counts to try.
        #[arg(long, value_delimiter = ',', default_values_t = [1, 2, 3, 4, 5, 6, 7, 8])]
        chiplets: Vec<usize>,
    },
    /// Floorplan and price a partition file.
    Evaluate {
        #[command(flatten)]
        input: Input,
        partition: PathBuf,
        #[arg(long, default_value = "7nm")]
        tech: String,
    },
    /// One refined partition for a fixed technology per part.
    TechPartition {
        #[command(flatten)]
        input: Input,
        /// Comma separated, one entry per part.
        #[arg(long, value_delimiter = ',', required = true)]
        techs: Vec<String>,
    },
    /// Genetic search over technologies and partitions.
    Genetic {
        #[command(flatten)]
        input: Input,
        #[command(flatten)]
        evolution: Evolution,
        #[arg(long, value_enum, default_value_t = GeneticMode::General)]
        mode: GeneticMode,
    },
    /// Exhaustive search over technology multisets.
    Enumerate {
        #[command(flatten)]
        input: Input,
        #[arg(long, value_delimiter = ',', required = true)]
        techs: Vec<String>,
        #[arg(long, default_value_t = 4)]
        max_partitions: usize,
    },
}

fn init_logger(verbose: bool) {
    formatted_builder()
        .filter_level(LevelFilter::Info)
        .filter_module("internal", if verbose { LevelFilter::Debug } else { LevelFilter::Off })
        .init();
}

fn load_library(path: Option<&Path>) -> Result<DesignLibrary> {
    let library = match path {
        Some(path) => DesignLibrary::from_json(path)
            .with_context(|| format!("loading library {}", path.display()))?,
        None => DesignLibrary::builtin(),
    };
    library.validate()?;
    Ok(library)
}

fn resolve_tech(library: &DesignLibrary, name: &str) -> Result<usize> {
    match library.tech_index(name) {
        Some(t) => Ok(t),
        None => bail!(
            "unknown technology {name}, the library has [{}]",
            library.tech_names().join(", ")
        ),
    }
}

fn partition_config(input: &Input) -> PartitionConfig {
    PartitionConfig::builder()
        .seed(input.seed)
        .num_threads(input.threads)
        .separation(input.separation)
        .maybe_external_partitioner(input.partitioner.clone())
        .maybe_external_embedding(input.embedding.clone())
        .output_prefix(input.output.clone())
        .build()
}

fn load_engine(input: &Input, library: DesignLibrary, config: PartitionConfig) -> Result<ChipletPart> {
    let hgraph = Hypergraph::from_file(&input.hypergraph, input.reach, input.io_size)
        .with_context(|| format!("reading {}", input.hypergraph.display()))?;
    info!(
        "{}: {} vertices, {} hyperedges",
        input.hypergraph.display().to_string().blue().underline(),
        hgraph.num_vertices(),
        hgraph.num_hyperedges()
    );
    Ok(ChipletPart::builder()
        .hgraph(Arc::new(hgraph))
        .library(Arc::new(library))
        .config(config)
        .build())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);
    let tmr = timer!(Level::Info; "chiplet_part");
    let library = load_library(cli.library.as_deref())?;
    match cli.command {
        Commands::Partition { input, tech, ub_factor, balanced, chiplets } => {
            let tech = resolve_tech(&library, &tech)?;
            let config = PartitionConfig {
                ub_factor,
                balance_constraints: balanced,
                chiplets_set: chiplets,
                ..partition_config(&input)
            };
            let engine = load_engine(&input, library, config)?;
            let result = engine.partition(tech)?;
            result
                .summary(engine.library())
                .write(format!("{}.summary.txt", input.output))?;
        }
        Commands::Evaluate { input, partition, tech } => {
            let tech = resolve_tech(&library, &tech)?;
            let engine = load_engine(&input, library, partition_config(&input))?;
            let result = engine
                .evaluate_partition(&partition, tech)
                .with_context(|| format!("evaluating {}", partition.display()))?;
            println!("cost: {:.6}\nvalid: {}", result.cost, result.valid);
        }
        Commands::TechPartition { input, techs } => {
            let techs = library.resolve(&techs)?;
            let engine = load_engine(&input, library, partition_config(&input))?;
            engine.quick_tech_partition(&techs)?;
        }
        Commands::Genetic { input, evolution, mode } => {
            let techs = library.resolve(&evolution.techs)?;
            let genetic = GeneticConfig::builder()
                .population_size(evolution.population)
                .num_generations(evolution.generations)
                .mutation_rate(evolution.mutation_rate)
                .crossover_rate(evolution.crossover_rate)
                .min_partitions(evolution.min_partitions)
                .max_partitions(evolution.max_partitions)
                .seed(input.seed)
                .build();
            let engine = load_engine(&input, library, partition_config(&input))?;
            let best = match mode {
                GeneticMode::Simple => GeneticPart::builder()
                    .engine(&engine)
                    .techs(techs)
                    .config(genetic)
                    .build()
                    .run()?,
                GeneticMode::General => GeneticTechPartitioner::builder()
                    .engine(&engine)
                    .techs(techs)
                    .config(genetic)
                    .build()
                    .run()?,
                GeneticMode::Canonical => CanonicalGa::builder()
                    .engine(&engine)
                    .techs(techs)
                    .config(genetic)
                    .build()
                    .run()?,
            };
            best.save_results(&input.output, engine.library())?;
        }
        Commands::Enumerate { input, techs, max_partitions } => {
            let techs = library.resolve(&techs)?;
            let engine = load_engine(&input, library, partition_config(&input))?;
            let Some(best) = engine.enumerate_tech_assignments(&techs, max_partitions) else {
                bail!("no technology assignment could be evaluated");
            };
            let solution = GeneticSolution {
                num_partitions: best.techs.len(),
                partition: best.partition,
                techs: best.techs,
                valid: best.cost < float::MAX,
                cost: Some(best.cost),
            };
            solution.save_results(&input.output, engine.library())?;
        }
    }
    finish!(tmr);
    Ok(())
}

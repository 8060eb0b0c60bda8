use chiplet_part::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const SIZES: [usize; 3] = [50, 200, 800];

// Local two-pin nets plus a few wide random nets.
fn random_hypergraph(num_vertices: usize, seed: u64) -> Arc<Hypergraph> {
    let mut rng = seeded_rng(seed);
    let mut hyperedges = (1..num_vertices).map(|v| vec![v - 1, v]).collect_vec();
    for _ in 0..num_vertices / 4 {
        let width = rng.random_range(3..=6);
        hyperedges.push((0..width).map(|_| rng.random_range(0..num_vertices)).collect());
    }
    let vertex_weights = (0..num_vertices)
        .map(|_| vec![rng.random_range(1.0..10.0)])
        .collect_vec();
    let hgraph = Hypergraph::builder()
        .num_vertices(num_vertices)
        .hyperedges(hyperedges)
        .vertex_weights(vertex_weights)
        .default_reach(2.0)
        .build();
    match hgraph {
        Ok(hgraph) => Arc::new(hgraph),
        Err(e) => panic!("bench hypergraph: {e}"),
    }
}

fn bench_refine(c: &mut Criterion) {
    let library = Arc::new(DesignLibrary::builtin());
    let config = PartitionConfig::builder()
        .floorplan_steps(50)
        .floorplan_perturbations(20)
        .build();
    let mut group = c.benchmark_group("refine");
    group
        .sample_size(10)
        .warm_up_time(std::time::Duration::from_millis(300))
        .measurement_time(std::time::Duration::from_secs(2));
    for n in SIZES {
        let hgraph = random_hypergraph(n, 7);
        let cost_model: Arc<dyn CostModel> = Arc::new(
            ManufacturingCostModel::builder()
                .library(library.clone())
                .cost_coef(1.0)
                .power_coef(0.0)
                .build(),
        );
        let start = contiguous_partition(n, 3);
        let (upper, lower) = hgraph.unconstrained_bounds(3);
        group.bench_with_input(BenchmarkId::new("three_way", n), &n, |b, _| {
            b.iter(|| {
                let mut refiner = ChipletRefiner::builder()
                    .hgraph(hgraph.clone())
                    .cost_model(cost_model.clone())
                    .config(&config)
                    .num_parts(3)
                    .techs(vec![2; 3])
                    .seed_offset(0)
                    .build();
                let mut partition = start.clone();
                refiner.refine(&mut partition, &upper, &lower);
                black_box(partition)
            })
        });
    }
    group.finish();
}

fn bench_cost_model(c: &mut Criterion) {
    let library = Arc::new(DesignLibrary::builtin());
    let model = ManufacturingCostModel::builder()
        .library(library)
        .cost_coef(1.0)
        .power_coef(0.0)
        .build();
    let mut group = c.benchmark_group("cost_model");
    for n in SIZES {
        let hgraph = random_hypergraph(n, 11);
        let partition = contiguous_partition(n, 4);
        let geometry = Geometry::uniform(4, 2);
        group.bench_with_input(BenchmarkId::new("evaluate", n), &n, |b, _| {
            b.iter(|| black_box(model.evaluate(&hgraph, black_box(&partition), &geometry, true)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_refine, bench_cost_model);
criterion_main!(benches);

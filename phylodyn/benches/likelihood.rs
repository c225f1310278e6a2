use criterion::{black_box, criterion_group, criterion_main, Criterion};
use phylodyn::birth_death::BirthDeathProcess;
use phylodyn::{
    BirthDeathSettings, Condition, Graph, MultiRateBirthDeathProcess, MultiRateParameters, Taxon,
    TimeTree, TreeDistribution,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn taxa(n: usize) -> Vec<Taxon> {
    (0..n).map(|i| Taxon::new(format!("t{}", i))).collect()
}

fn bench_fossilized(c: &mut Criterion) {
    let mut group = c.benchmark_group("fossilized");

    let mut graph = Graph::new();
    let origin = graph.add_stochastic("origin", 10.0);
    let lambda = graph.add_constant("lambda", 1.0);
    let mu = graph.add_constant("mu", 0.5);
    let psi = graph.add_constant("psi", 0.0);
    let rho = graph.add_constant("rho", 1.0);
    let settings = BirthDeathSettings {
        origin: Some(origin),
        condition: Condition::Survival,
        taxa: taxa(200),
        ..Default::default()
    };
    let mut process = BirthDeathProcess::fossilized(settings, lambda, mu, psi, rho).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let tree = process.simulate_tree(&graph, &mut rng).unwrap();

    group.bench_function("200_tips", |b| {
        b.iter(|| process.compute_ln_probability(&graph, black_box(&tree)))
    });

    group.finish();
}

fn multi_rate_setup(n: usize, k: usize) -> (Graph, MultiRateBirthDeathProcess, TimeTree) {
    let mut graph = Graph::new();
    let parameters = MultiRateParameters {
        root_age: graph.add_stochastic("root_age", 5.0),
        speciation: graph.add_constant("lambda", (0..k).map(|i| 0.5 + 0.25 * i as f64).collect::<Vec<_>>()),
        extinction: graph.add_constant("mu", 0.2),
        shift_rate: graph.add_constant("eta", 0.1),
        sampling_fraction: graph.add_constant("rho", 1.0),
        root_frequencies: None,
    };
    let process = MultiRateBirthDeathProcess::new(parameters, Condition::Survival, taxa(n)).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let tree = process.simulate_tree(&graph, &mut rng).unwrap();
    (graph, process, tree)
}

fn bench_multi_rate(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_rate");
    group.sample_size(20);

    let (graph, mut process, tree) = multi_rate_setup(50, 4);
    let all: Vec<_> = (0..tree.num_nodes()).collect();
    group.bench_function("50_tips_4_categories_full", |b| {
        b.iter(|| {
            process.touch_tree(&all, &tree);
            let p = process.compute_ln_probability(&graph, black_box(&tree));
            process.keep_tree();
            p
        })
    });

    let tip = 0;
    group.bench_function("50_tips_4_categories_one_branch", |b| {
        b.iter(|| {
            process.touch_tree(&[tip], &tree);
            let p = process.compute_ln_probability(&graph, black_box(&tree));
            process.restore_tree();
            p
        })
    });

    group.finish();
}

criterion_group!(benches, bench_fossilized, bench_multi_rate);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use admissoor::mgf::Mgf;
use admissoor::snc::arrival::MmbpArrival;
use admissoor::snc::operators::{BoundArena, LatencyBound};
use admissoor::trace::ProcessedTraceEntry;

fn exponential_mgf(mean: f64, p: f64) -> Mgf {
    let mut mgf = Mgf::exponential();
    mgf.add_sample(&ProcessedTraceEntry {
        arrival_ns: 0,
        work: mean,
        is_get: true,
    });
    mgf.set_prob_request(p);
    mgf
}

fn two_state_arrival() -> MmbpArrival {
    MmbpArrival::from_parts(
        vec![vec![0.99999, 0.00001], vec![0.00002, 0.99998]],
        vec![exponential_mgf(1500.0, 0.01), exponential_mgf(1500.0, 0.05)],
    )
}

fn four_state_arrival() -> MmbpArrival {
    let mgfs = (1..=4).map(|i| exponential_mgf(1500.0, 0.01 * i as f64)).collect();
    let mut matrix = vec![vec![0.0; 4]; 4];
    for (from, row) in matrix.iter_mut().enumerate() {
        for (to, cell) in row.iter_mut().enumerate() {
            *cell = if from == to { 0.99997 } else { 0.00001 };
        }
    }
    MmbpArrival::from_parts(matrix, mgfs)
}

fn bench_spectral_radius(c: &mut Criterion) {
    let two = two_state_arrival();
    let four = four_state_arrival();

    c.bench_function("spectral_radius/two_state_closed_form", |b| {
        b.iter(|| two.spectral_radius(black_box(1e-4)))
    });
    c.bench_function("spectral_radius/four_state_eigenvalues", |b| {
        b.iter(|| four.spectral_radius(black_box(1e-4)))
    });
}

fn bench_latency_bound(c: &mut Criterion) {
    let arrival = two_state_arrival();

    c.bench_function("latency_bound/theta_optimization", |b| {
        b.iter(|| {
            let mut arena = BoundArena::new();
            let a = arena.mmbp(&arrival);
            let s = arena.constant_service(1.25e8);
            LatencyBound::new(&mut arena, a, s, black_box(1e-3)).calc_latency()
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_spectral_radius(c);
    bench_latency_bound(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tscore::Labels;

pub const DEFAULT_SEED: u64 = 0x_5453_434F_5245_4245; // fixed seed for stable benchmarks

#[derive(Clone, Debug)]
pub struct SeriesSpec {
    pub key: String,
    pub labels: Labels,
}

#[derive(Clone, Debug)]
pub struct AddOp {
    pub series: usize,
    pub ts: u64,
    pub val: f64,
}

/// `series_count` series labelled `k0..k{label_pairs}` with values drawn from
/// `0..label_cardinality`.
pub fn generate_series(
    seed: u64,
    series_count: usize,
    label_pairs: usize,
    label_cardinality: u32,
) -> Vec<SeriesSpec> {
    assert!(series_count > 0);
    assert!(label_cardinality > 0);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..series_count)
        .map(|i| {
            let mut labels = Labels::new();
            for k in 0..label_pairs {
                let v = rng.random_range(0..label_cardinality);
                labels.insert(format!("k{}", k), format!("v{}", v));
            }
            SeriesSpec {
                key: format!("series_{}", i),
                labels,
            }
        })
        .collect()
}

/// Round-robin writes across `series_count` series; each series sees strictly increasing
/// timestamps with a jittered step and a random-walk value.
pub fn generate_add_ops(seed: u64, points: usize, series_count: usize) -> Vec<AddOp> {
    assert!(series_count > 0);

    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x5a5a);
    let mut last_ts = vec![0u64; series_count];
    let mut last_val = vec![100.0f64; series_count];
    let mut ops = Vec::with_capacity(points);

    for i in 0..points {
        let series = i % series_count;
        last_ts[series] += 1_000 + rng.random_range(0..50u64);
        last_val[series] += rng.random_range(-1.0..1.0);
        ops.push(AddOp {
            series,
            ts: last_ts[series],
            val: last_val[series],
        });
    }

    ops
}

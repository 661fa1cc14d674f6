use std::time::Instant;

#[path = "support/bench_common.rs"]
mod bench_common;

use bench_common::{generate_seed, random_keys, SplitMix64};
use pocket_filter::{FilterConfig, PocketDict, PocketFilter};

/// Sweeps the bucket load divisor and reports how the rejection rate and
/// bucket occupancy respond. The default of 45 keys per 51-slot bucket is an
/// empirical trade between space and saturation risk; this makes the trade
/// visible for other working sets.
fn main() {
    let key_count = 2_000_000;
    let seed = generate_seed();
    println!("seed: {seed:#018x}, keys: {key_count}");

    for keys_per_bucket in [30, 40, 45, 48, 51] {
        let mut generator = SplitMix64::new(seed);
        let keys = random_keys(key_count, &mut generator);
        let config = FilterConfig {
            keys_per_bucket,
            max_threads: 0,
        };

        let start = Instant::now();
        let build = PocketFilter::build_with_config(&keys, &config)
            .expect("filter should build");
        let elapsed = start.elapsed();
        let filter = build.filter;

        let mut histogram = [0usize; PocketDict::CAPACITY + 1];
        for bucket in filter.buckets() {
            histogram[bucket.fill()] += 1;
        }
        let full_buckets = histogram[PocketDict::CAPACITY];
        let mean_fill = filter.len() as f64 / filter.bucket_count().max(1) as f64;

        println!(
            "load {keys_per_bucket:2}: {} buckets, {:.2} bytes/key, mean fill {:.1}, \
             {} full, rejected {} ({:.4}%), built in {:?}",
            filter.bucket_count(),
            build.bytes_per_key,
            mean_fill,
            full_buckets,
            build.rejected_keys.len(),
            build.rejected_keys.len() as f64 / key_count as f64 * 100.0,
            elapsed
        );
    }
}

use std::collections::HashSet;
use std::time::Instant;

#[path = "support/bench_common.rs"]
mod bench_common;

use bench_common::{generate_seed, random_keys, SplitMix64};
use pocket_filter::PocketFilter;

fn main() {
    let key_count = 10_000_000;
    let query_count = 10_000_000;

    let seed = generate_seed();
    let mut generator = SplitMix64::new(seed);
    let keys = random_keys(key_count, &mut generator);
    let key_set: HashSet<u64> = keys.iter().copied().collect();

    let build_start = Instant::now();
    let build = PocketFilter::build(&keys).expect("filter should build");
    let build_time = build_start.elapsed();
    let filter = build.filter;

    let mut positives = 0_u64;
    let mut false_positives = 0_u64;
    for _ in 0..query_count {
        let key = generator.next();
        if filter.contains(key) {
            positives += 1;
            if !key_set.contains(&key) {
                false_positives += 1;
            }
        }
    }

    let fp_rate = false_positives as f64 / query_count as f64;
    let rejected_rate = build.rejected_keys.len() as f64 / key_count as f64;

    println!("seed: {seed:#018x}");
    println!("built filter for {key_count} keys in {:?}", build_time);
    println!(
        "buckets: {}, bytes: {}, bytes/key: {:.3}",
        filter.bucket_count(),
        build.total_bytes,
        build.bytes_per_key
    );
    println!(
        "rejected at build: {} ({:.4}%)",
        build.rejected_keys.len(),
        rejected_rate * 100.0
    );
    println!("queries: {query_count}");
    println!("positives: {positives}");
    println!("false positives: {false_positives}");
    println!("false positive rate: {:.6}%", fp_rate * 100.0);
}

use std::env;
use std::hint::black_box;
use std::str::FromStr;
use std::time::Instant;

use rayon::prelude::*;

#[path = "support/bench_common.rs"]
mod bench_common;

use bench_common::{generate_seed, random_keys, SplitMix64};
use pocket_filter::{PocketDict, PocketFilter};

fn main() {
    let cli = Cli::from_env();
    println!(
        "running with key_count={}, query_count={}, threads={}, seed={:#018x}",
        cli.key_count, cli.query_count, cli.threads, cli.seed
    );

    let mut generator = SplitMix64::new(cli.seed);
    let keys = random_keys(cli.key_count, &mut generator);

    let build_start = Instant::now();
    let build = PocketFilter::build(&keys).expect("filter should build");
    let filter = build.filter;
    println!(
        "built {} buckets ({} bytes) in {:?}, {} keys rejected",
        filter.bucket_count(),
        build.total_bytes,
        build_start.elapsed(),
        build.rejected_keys.len()
    );

    let queries = random_keys(cli.query_count, &mut generator);

    run_single_probes(&filter, &queries);
    run_batch_64(&filter, &queries);
    run_batch_128(&filter, &queries);
    run_threaded_probes(&filter, &queries, cli.threads);
    run_variant_probes(&mut generator);
}

fn report(label: &str, probes: usize, hits: u64, elapsed: std::time::Duration) {
    let per_second = probes as f64 / elapsed.as_secs_f64();
    println!(
        "[{label}] {probes} probes in {:?} ({:.1} Mprobe/s), {hits} positive",
        elapsed,
        per_second / 1e6
    );
}

fn run_single_probes(filter: &PocketFilter, queries: &[u64]) {
    let start = Instant::now();
    let mut hits = 0_u64;
    for &key in queries {
        hits += filter.contains(key) as u64;
    }
    report("contains", queries.len(), black_box(hits), start.elapsed());
}

fn run_batch_64(filter: &PocketFilter, queries: &[u64]) {
    let start = Instant::now();
    let mut hits = 0_u64;
    let mut block = [0u64; 64];
    for chunk in queries.chunks_exact(64) {
        block.copy_from_slice(chunk);
        hits += filter.contains_batch_64(&block).count_ones() as u64;
    }
    let probed = queries.len() / 64 * 64;
    report("contains_batch_64", probed, black_box(hits), start.elapsed());
}

fn run_batch_128(filter: &PocketFilter, queries: &[u64]) {
    let start = Instant::now();
    let mut hits = 0_u64;
    let mut block = [0u64; 128];
    for chunk in queries.chunks_exact(128) {
        block.copy_from_slice(chunk);
        hits += filter.contains_batch_128(&block).count_ones() as u64;
    }
    let probed = queries.len() / 128 * 128;
    report("contains_batch_128", probed, black_box(hits), start.elapsed());
}

fn run_threaded_probes(filter: &PocketFilter, queries: &[u64], threads: usize) {
    // A frozen filter is freely shareable: reads are pure functions of the
    // bucket bytes.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .expect("thread pool should build");
    let start = Instant::now();
    let hits: u64 = pool.install(|| {
        queries
            .par_chunks(8192)
            .map(|chunk| chunk.iter().filter(|&&key| filter.contains(key)).count() as u64)
            .sum()
    });
    report(
        &format!("contains x{threads} threads"),
        queries.len(),
        black_box(hits),
        start.elapsed(),
    );
}

fn run_variant_probes(generator: &mut SplitMix64) {
    let mut dict = PocketDict::new();
    while !dict.is_full() {
        let word = generator.next();
        dict.add((word % PocketDict::QUOTIENTS as u64) as u8, (word >> 32) as u8);
    }

    let probes: Vec<(u8, u8)> = (0..2_000_000)
        .map(|_| {
            let word = generator.next();
            ((word % PocketDict::QUOTIENTS as u64) as u8, (word >> 32) as u8)
        })
        .collect();

    for variant in 1..=5u32 {
        let start = Instant::now();
        let mut hits = 0_u64;
        for &(quot, rem) in &probes {
            let found = match variant {
                1 => dict.find_v1(quot, rem),
                2 => dict.find_v2(quot, rem),
                3 => dict.find_v3(quot, rem),
                4 => dict.find_v4(quot, rem),
                _ => dict.find_v5(quot, rem),
            };
            hits += found as u64;
        }
        report(
            &format!("find_v{variant}"),
            probes.len(),
            black_box(hits),
            start.elapsed(),
        );
    }
}

#[derive(Debug)]
struct Cli {
    key_count: usize,
    query_count: usize,
    threads: usize,
    seed: u64,
}

impl Cli {
    fn from_env() -> Self {
        let mut cli = Self {
            key_count: 1_000_000,
            query_count: 10_000_000,
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            seed: generate_seed(),
        };

        let mut args = env::args().skip(1);
        while let Some(flag) = args.next() {
            fn parse<T: FromStr>(value: Option<String>, name: &str) -> T
            where
                T::Err: std::fmt::Display,
            {
                let value = value.unwrap_or_else(|| panic!("expected value after {name}"));
                value
                    .parse::<T>()
                    .unwrap_or_else(|err| panic!("invalid value for {name}: {err}"))
            }

            match flag.as_str() {
                "--keys" => cli.key_count = parse(args.next(), "--keys"),
                "--queries" => cli.query_count = parse(args.next(), "--queries"),
                "--threads" => cli.threads = parse(args.next(), "--threads"),
                "--seed" => cli.seed = parse(args.next(), "--seed"),
                other => panic!("unknown flag: {other}"),
            }
        }

        cli
    }
}

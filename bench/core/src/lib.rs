// This file is dual licensed as MIT OR Apache-2.0, at your option.

// Workload driver for needle index implementations.
//
// Loads an index from several writer threads with a configurable share
// of out-of-order ids, probes it from reader threads while the load is
// running, optionally deletes a share of the ids, then repacks and
// verifies that the observable content is unchanged. Reports timings
// through `log`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub trait NeedleIndex: Send + Sync + 'static {
	fn set(&self, key: u64, offset: u64, size: u32) -> (u64, u32);
	fn get(&self, key: u64) -> Option<(u64, u32)>;
	fn delete(&self, key: u64) -> u32;
	fn optimize(&self);
	// One-line occupancy summary for the report.
	fn describe(&self) -> String {
		String::new()
	}
}

#[derive(Clone)]
pub struct Args {
	pub entries: u64,
	pub writers: u64,
	pub readers: u64,
	// Percent of each writer's ids delivered out of order.
	pub disorder: u64,
	// Percent of ids deleted after the load.
	pub deletions: u64,
	pub seed: u64,
}

impl Default for Args {
	fn default() -> Args {
		Args {
			entries: 1_000_000,
			writers: 4,
			readers: 4,
			disorder: 10,
			deletions: 5,
			seed: 42,
		}
	}
}

pub fn parse_args(args: impl Iterator<Item = String>) -> Args {
	let mut result = Args::default();
	for raw in args {
		let mut parts = raw.splitn(2, '=');
		let flag = parts.next().unwrap();
		let value = parts
			.next()
			.and_then(|v| v.parse::<u64>().ok())
			.unwrap_or_else(|| panic!("Expected {}=<number>", flag));
		match flag {
			"--entries" => result.entries = value,
			"--writers" => result.writers = value.max(1),
			"--readers" => result.readers = value,
			"--disorder" => result.disorder = value.min(100),
			"--deletions" => result.deletions = value.min(100),
			"--seed" => result.seed = value,
			_ => panic!("Unknown argument {}", flag),
		}
	}
	result
}

// Ascending ids starting at `start`, with `disorder` percent of the
// positions pairwise swapped.
fn stripe_keys(start: u64, count: u64, disorder: u64, seed: u64) -> Vec<u64> {
	let mut keys: Vec<u64> = (start..start + count).collect();
	let mut rng = SmallRng::seed_from_u64(seed);
	for _ in 0..count * disorder / 100 {
		let a = rng.gen_range(0..count) as usize;
		let b = rng.gen_range(0..count) as usize;
		keys.swap(a, b);
	}
	keys
}

fn scan_live<D: NeedleIndex>(index: &D, total: u64) -> u64 {
	let mut live = 0;
	for key in 1..=total {
		if index.get(key).map_or(false, |(_, size)| size > 0) {
			live += 1;
		}
	}
	live
}

pub fn run<D: NeedleIndex>(args: Args, index: D) {
	env_logger::try_init().ok();
	let index = Arc::new(index);
	let writer_count = args.writers.max(1);
	let stripe = args.entries / writer_count;
	let total = stripe * writer_count;
	let done = Arc::new(AtomicBool::new(false));

	let start = Instant::now();
	let writers: Vec<_> = (0..writer_count)
		.map(|w| {
			let index = index.clone();
			let (disorder, seed) = (args.disorder, args.seed + w);
			std::thread::spawn(move || {
				for key in stripe_keys(w * stripe + 1, stripe, disorder, seed) {
					index.set(key, key * 8, 1 + (key % 4096) as u32);
				}
			})
		})
		.collect();
	let readers: Vec<_> = (0..args.readers)
		.map(|r| {
			let index = index.clone();
			let done = done.clone();
			let seed = args.seed + 100 + r;
			std::thread::spawn(move || {
				let mut rng = SmallRng::seed_from_u64(seed);
				let mut probes = 0u64;
				let mut hits = 0u64;
				while !done.load(Ordering::Relaxed) {
					if index.get(rng.gen_range(1..=total)).is_some() {
						hits += 1;
					}
					probes += 1;
				}
				(probes, hits)
			})
		})
		.collect();
	for writer in writers {
		writer.join().unwrap();
	}
	let elapsed = start.elapsed();
	done.store(true, Ordering::Relaxed);
	let (mut probes, mut hits) = (0u64, 0u64);
	for reader in readers {
		let (p, h) = reader.join().unwrap();
		probes += p;
		hits += h;
	}
	log::info!(
		target: "map-bench",
		"Loaded {} entries in {:.2?} ({:.0} sets/s), {} concurrent probes ({} hits)",
		total,
		elapsed,
		total as f64 / elapsed.as_secs_f64(),
		probes,
		hits,
	);

	if args.deletions > 0 {
		let mut rng = SmallRng::seed_from_u64(args.seed + 1000);
		let start = Instant::now();
		let count = total * args.deletions / 100;
		for _ in 0..count {
			index.delete(rng.gen_range(1..=total));
		}
		log::info!(target: "map-bench", "Deleted {} ids in {:.2?}", count, start.elapsed());
	}

	let start = Instant::now();
	let live_before = scan_live(&*index, total);
	log::info!(
		target: "map-bench",
		"Scanned {} ids ({} live) in {:.2?}",
		total,
		live_before,
		start.elapsed(),
	);
	let summary = index.describe();
	if !summary.is_empty() {
		log::info!(target: "map-bench", "Before repack: {}", summary);
	}

	let start = Instant::now();
	index.optimize();
	log::info!(target: "map-bench", "Repacked in {:.2?}", start.elapsed());

	let start = Instant::now();
	let live_after = scan_live(&*index, total);
	assert_eq!(live_before, live_after, "repack changed the live id set");
	log::info!(
		target: "map-bench",
		"Re-scanned {} ids ({} live) in {:.2?}",
		total,
		live_after,
		start.elapsed(),
	);
	let summary = index.describe();
	if !summary.is_empty() {
		log::info!(target: "map-bench", "After repack: {}", summary);
	}
}

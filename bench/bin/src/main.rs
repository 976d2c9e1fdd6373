// This file is dual licensed as MIT OR Apache-2.0, at your option.

use needle_map::CompactMap;

#[cfg(all(not(windows), not(target_env = "musl")))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

struct MapIndex(CompactMap);

impl map_bench::NeedleIndex for MapIndex {
	fn set(&self, key: u64, offset: u64, size: u32) -> (u64, u32) {
		self.0.set(key, offset, size)
	}

	fn get(&self, key: u64) -> Option<(u64, u32)> {
		self.0.get(key).map(|value| (value.offset, value.size))
	}

	fn delete(&self, key: u64) -> u32 {
		self.0.delete(key)
	}

	fn optimize(&self) {
		self.0.optimize()
	}

	fn describe(&self) -> String {
		let stats = self.0.stats();
		format!(
			"{} sections, {} packed ({} tombstones), {} overflow",
			stats.sections, stats.packed_entries, stats.tombstones, stats.overflow_entries,
		)
	}
}

fn main() {
	let args = map_bench::parse_args(std::env::args().skip(1));
	map_bench::run(args, MapIndex(CompactMap::new()));
}

// This file is dual licensed as MIT OR Apache-2.0, at your option.

// Ordered sequence of compact sections covering disjoint needle id
// ranges. The map assumes mostly increasing id arrival: routing binary
// searches the section start ids, and a new section is only created when
// an id falls past the end of a full section, before the first section,
// or into an empty map. The sequence is guarded by its own lock, shared
// for routing and iteration, exclusive while a section is inserted and
// for the whole of a repack.

use parking_lot::RwLock;

use crate::section::{CompactSection, NeedleId, NeedleValue, Offset, Size};

/// Needle index of a single volume: maps needle ids to the offset and
/// size of the blob in the volume file.
pub struct CompactMap {
	sections: RwLock<Vec<CompactSection>>,
}

/// Occupancy snapshot, computed section by section.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MapStats {
	pub sections: usize,
	pub packed_entries: usize,
	pub overflow_entries: usize,
	pub tombstones: usize,
}

impl CompactMap {
	pub fn new() -> CompactMap {
		CompactMap { sections: RwLock::new(Vec::new()) }
	}

	// Owning section for a key, if any: the last section whose start is
	// not above the key, unless that section is full and the key lies
	// past its end.
	fn locate(sections: &[CompactSection], key: NeedleId) -> Option<usize> {
		let i = match sections.binary_search_by_key(&key, |section| section.start()) {
			Ok(i) => i,
			Err(0) => return None,
			Err(i) => i - 1,
		};
		if !sections[i].is_full() || key <= sections[i].end_hint() {
			Some(i)
		} else {
			None
		}
	}

	fn create_section(sections: &mut Vec<CompactSection>, key: NeedleId) -> usize {
		log::trace!(
			target: "needle-map",
			"New section starting at {}, {} total",
			key,
			sections.len() + 1,
		);
		sections.push(CompactSection::new(key));
		let mut i = sections.len() - 1;
		// Keep the sequence sorted by start id.
		while i > 0 && sections[i - 1].start() > sections[i].start() {
			sections.swap(i - 1, i);
			i -= 1;
		}
		i
	}

	/// Returns the previous offset and size of the needle, or (0, 0) if
	/// it was not present.
	pub fn set(&self, key: NeedleId, offset: Offset, size: Size) -> (Offset, Size) {
		{
			let sections = self.sections.read();
			if let Some(i) = Self::locate(&sections, key) {
				return sections[i].set(key, offset, size);
			}
		}
		let mut sections = self.sections.write();
		// Another writer may have created the owning section while the
		// shared lock was released.
		let i = match Self::locate(&sections, key) {
			Some(i) => i,
			None => Self::create_section(&mut sections, key),
		};
		sections[i].set(key, offset, size)
	}

	/// Returns the previous size of the needle, or 0 if it was not
	/// present or already tombstoned.
	pub fn delete(&self, key: NeedleId) -> Size {
		let sections = self.sections.read();
		Self::locate(&sections, key).map_or(0, |i| sections[i].delete(key))
	}

	/// Snapshot of the needle, or None if no section covers the key. A
	/// tombstoned needle is returned with size 0; callers treat it as
	/// deleted.
	pub fn get(&self, key: NeedleId) -> Option<NeedleValue> {
		let sections = self.sections.read();
		Self::locate(&sections, key).and_then(|i| sections[i].get(key))
	}

	/// Calls `f` for every stored needle, stopping at the first error,
	/// which is returned verbatim. Sections are visited in start order,
	/// overflow entries before packed ones within a section; no other
	/// ordering is guaranteed. Sections not currently being visited may
	/// be mutated concurrently.
	pub fn visit<E, F: FnMut(NeedleValue) -> Result<(), E>>(&self, mut f: F) -> Result<(), E> {
		let sections = self.sections.read();
		for section in sections.iter() {
			section.visit(&mut f)?;
		}
		Ok(())
	}

	/// Repacks the map as if all live needles had been inserted in
	/// ascending id order: every overflow map is emptied and every
	/// section but the last is filled to capacity. Useful after loading
	/// a disordered index file. Takes exclusive access for the whole
	/// operation and temporarily buffers all entries.
	pub fn optimize(&self) {
		let mut sections = self.sections.write();
		let mut overflow = 0;
		for section in sections.iter() {
			overflow += section.occupancy().1;
		}
		let mut entries = Vec::new();
		for section in sections.iter_mut() {
			section.collect_into(&mut entries);
		}
		log::debug!(
			target: "needle-map",
			"Optimizing {} entries in {} sections, {} in overflow",
			entries.len(),
			sections.len(),
			overflow,
		);
		entries.sort_unstable_by_key(|value| value.key);
		*sections = Vec::new();
		for value in &entries {
			let i = match Self::locate(&sections, value.key) {
				Some(i) => i,
				None => Self::create_section(&mut sections, value.key),
			};
			sections[i].set(value.key, value.offset, value.size);
		}
		let (total, repacked) = (entries.len(), sections.len());
		// The transient buffer can be a large share of the map; release
		// it before reporting.
		drop(entries);
		log::debug!(
			target: "needle-map",
			"Repacked {} entries into {} sections, 0 in overflow",
			total,
			repacked,
		);
	}

	pub fn stats(&self) -> MapStats {
		let sections = self.sections.read();
		let mut stats = MapStats { sections: sections.len(), ..Default::default() };
		for section in sections.iter() {
			let (packed, overflow, tombstones) = section.occupancy();
			stats.packed_entries += packed;
			stats.overflow_entries += overflow;
			stats.tombstones += tombstones;
		}
		stats
	}
}

impl Default for CompactMap {
	fn default() -> CompactMap {
		CompactMap::new()
	}
}

#[cfg(test)]
mod test {
	use std::collections::HashMap;
	use std::sync::Arc;

	use rand::rngs::SmallRng;
	use rand::seq::SliceRandom;
	use rand::SeedableRng;

	use super::*;
	use crate::section::SECTION_BATCH;

	fn map() -> CompactMap {
		env_logger::try_init().ok();
		CompactMap::new()
	}

	fn fill_section(map: &CompactMap, start: u64) {
		for key in start..start + SECTION_BATCH as u64 {
			map.set(key, key * 8, 1);
		}
	}

	fn assert_coverage(map: &CompactMap) {
		let sections = map.sections.read();
		for window in sections.windows(2) {
			assert!(window[0].start() < window[1].start());
		}
		let mut live = 0;
		for (i, section) in sections.iter().enumerate() {
			let visited: Result<(), ()> = section.visit(&mut |value| {
				assert!(value.key >= section.start());
				assert!(value.key <= section.end_hint());
				// No other section covers this key.
				for (j, other) in sections.iter().enumerate() {
					if i != j {
						assert!(other.get(value.key).is_none());
					}
				}
				live += 1;
				Ok(())
			});
			assert!(visited.is_ok());
		}
		assert!(live > 0 || sections.is_empty());
	}

	#[test]
	fn monotonic_fill_uses_one_section() {
		let map = map();
		map.set(1, 0x10, 5);
		map.set(2, 0x20, 6);
		map.set(3, 0x30, 7);
		let stats = map.stats();
		assert_eq!(stats.sections, 1);
		assert_eq!(stats.packed_entries, 3);
		assert_eq!(stats.overflow_entries, 0);
		assert_eq!(map.get(2), Some(NeedleValue { key: 2, offset: 0x20, size: 6 }));
	}

	#[test]
	fn key_past_full_section_creates_new_section() {
		let map = map();
		fill_section(&map, 1);
		let next = SECTION_BATCH as u64 + 1;
		map.set(next, 0x40, 8);
		let stats = map.stats();
		assert_eq!(stats.sections, 2);
		assert_eq!(stats.packed_entries, SECTION_BATCH + 1);
		assert_eq!(stats.overflow_entries, 0);
		let sections = map.sections.read();
		assert_eq!(sections[1].start(), next);
	}

	#[test]
	fn out_of_order_key_in_full_section_routes_to_overflow() {
		let map = map();
		// Ids spaced out so a smaller id can arrive inside the range.
		for key in 0..SECTION_BATCH as u64 {
			map.set(10 + key * 10, key, 1);
		}
		map.set(15, 0xd, 1);
		let stats = map.stats();
		assert_eq!(stats.sections, 1);
		assert_eq!(stats.overflow_entries, 1);
		assert_eq!(map.get(15), Some(NeedleValue { key: 15, offset: 0xd, size: 1 }));
		assert_eq!(map.get(20), Some(NeedleValue { key: 20, offset: 1, size: 1 }));
	}

	#[test]
	fn get_and_delete_miss_when_no_section_owns_the_key() {
		let map = map();
		assert_eq!(map.get(7), None);
		assert_eq!(map.delete(7), 0);

		fill_section(&map, 1);
		// Past the end of a full section, before any next section.
		let gap = SECTION_BATCH as u64 + 50;
		assert_eq!(map.get(gap), None);
		assert_eq!(map.delete(gap), 0);
	}

	#[test]
	fn set_returns_prior_value() {
		let map = map();
		assert_eq!(map.set(10, 0xa, 1), (0, 0));
		assert_eq!(map.set(10, 0xb, 2), (0xa, 1));
		assert_eq!(map.get(10), Some(NeedleValue { key: 10, offset: 0xb, size: 2 }));
	}

	#[test]
	fn delete_then_get_returns_tombstone() {
		let map = map();
		map.set(10, 0xa, 5);
		assert_eq!(map.delete(10), 5);
		let value = map.get(10).unwrap();
		assert!(value.is_tombstone());
		assert_eq!(value.offset, 0xa);
		assert_eq!(map.delete(10), 0);
	}

	#[test]
	fn smaller_key_creates_new_first_section() {
		let map = map();
		map.set(1000, 0xa, 1);
		map.set(5, 0x5, 2);
		let stats = map.stats();
		assert_eq!(stats.sections, 2);
		{
			let sections = map.sections.read();
			assert_eq!(sections[0].start(), 5);
			assert_eq!(sections[1].start(), 1000);
		}
		assert_eq!(map.get(5), Some(NeedleValue { key: 5, offset: 0x5, size: 2 }));
		assert_eq!(map.get(1000), Some(NeedleValue { key: 1000, offset: 0xa, size: 1 }));
		assert_coverage(&map);
	}

	#[test]
	fn key_between_full_section_and_next_creates_middle_section() {
		let map = map();
		fill_section(&map, 1);
		let far = 10 * SECTION_BATCH as u64;
		map.set(far, 0xf, 1);
		// Between the first (full) section's end and the far section.
		let mid = 2 * SECTION_BATCH as u64;
		map.set(mid, 0xe, 2);
		let sections = map.sections.read();
		assert_eq!(sections.len(), 3);
		assert_eq!(sections[1].start(), mid);
		drop(sections);
		assert_eq!(map.get(mid), Some(NeedleValue { key: mid, offset: 0xe, size: 2 }));
		assert_eq!(map.get(far), Some(NeedleValue { key: far, offset: 0xf, size: 1 }));
	}

	#[test]
	fn visit_emits_each_needle_once() {
		let map = map();
		let mut expected = HashMap::new();
		for key in (1..=60u64).rev() {
			map.set(key, key * 8, key as Size);
			expected.insert(key, (key * 8, key as Size));
		}
		map.delete(30);
		expected.insert(30, (30 * 8, 0));

		let mut seen = HashMap::new();
		let visited: Result<(), ()> = map.visit(|value| {
			assert!(seen.insert(value.key, (value.offset, value.size)).is_none());
			Ok(())
		});
		assert!(visited.is_ok());
		// Tombstoned needles are emitted with size 0; live needles match
		// their last set exactly.
		assert_eq!(seen.len(), expected.len());
		for (key, value) in &expected {
			assert_eq!(seen.get(key), Some(value));
		}
	}

	#[test]
	fn visit_propagates_the_first_error() {
		let map = map();
		for key in 1..=10u64 {
			map.set(key, key, 1);
		}
		let mut emitted = 0;
		let result = map.visit(|_| {
			emitted += 1;
			if emitted == 4 {
				Err("stop")
			} else {
				Ok(())
			}
		});
		assert_eq!(result, Err("stop"));
		assert_eq!(emitted, 4);
	}

	#[test]
	fn optimize_restores_dense_layout() {
		let map = map();
		let mut rng = SmallRng::seed_from_u64(42);
		let mut keys: Vec<u64> = (1..=2 * SECTION_BATCH as u64 + 17).collect();
		keys.shuffle(&mut rng);
		for &key in &keys {
			map.set(key, key * 8, (key % 1000) as Size + 1);
		}
		let before = map.stats();
		assert!(before.overflow_entries > 0);

		map.optimize();

		let stats = map.stats();
		assert_eq!(stats.overflow_entries, 0);
		assert_eq!(stats.packed_entries, keys.len());
		assert_eq!(stats.sections, 3);
		{
			let sections = map.sections.read();
			for section in sections.iter().take(stats.sections - 1) {
				let (packed, _, _) = section.occupancy();
				assert_eq!(packed, SECTION_BATCH);
			}
		}
		for &key in &keys {
			assert_eq!(
				map.get(key),
				Some(NeedleValue { key, offset: key * 8, size: (key % 1000) as Size + 1 }),
			);
		}
		assert_coverage(&map);
	}

	#[test]
	fn optimize_preserves_tombstones_and_deletions() {
		let map = map();
		for key in (1..=100u64).rev() {
			map.set(key, key, key as Size);
		}
		map.set(1000, 0x3e8, 7);
		// Out of order within the last section: overflow.
		map.set(500, 0x1f4, 8);
		map.delete(10); // packed slot, tombstoned in place
		map.delete(500); // overflow entry, removed outright
		map.optimize();

		for key in 1..=100u64 {
			let value = map.get(key).unwrap();
			if key == 10 {
				assert!(value.is_tombstone());
			} else {
				assert_eq!(value.size, key as Size);
			}
		}
		assert_eq!(map.get(1000), Some(NeedleValue { key: 1000, offset: 0x3e8, size: 7 }));
		// A needle removed from overflow does not reappear.
		assert_eq!(map.get(500), None);
		assert_eq!(map.stats().overflow_entries, 0);
	}

	#[test]
	fn concurrent_readers_and_writers() {
		let map = Arc::new(map());
		let writers: Vec<_> = (0..4u64)
			.map(|w| {
				let map = map.clone();
				std::thread::spawn(move || {
					let start = w * SECTION_BATCH as u64 * 2 + 1;
					for key in start..start + 20_000 {
						map.set(key, key * 8, 1);
					}
				})
			})
			.collect();
		let readers: Vec<_> = (0..4u64)
			.map(|r| {
				let map = map.clone();
				std::thread::spawn(move || {
					let mut hits = 0u64;
					for key in (r * 1000 + 1)..(r * 1000 + 20_000) {
						if map.get(key).is_some() {
							hits += 1;
						}
					}
					hits
				})
			})
			.collect();
		for writer in writers {
			writer.join().unwrap();
		}
		for reader in readers {
			reader.join().unwrap();
		}
		for w in 0..4u64 {
			let start = w * SECTION_BATCH as u64 * 2 + 1;
			for key in start..start + 20_000 {
				assert_eq!(map.get(key), Some(NeedleValue { key, offset: key * 8, size: 1 }));
			}
		}
		assert_coverage(&map);
	}
}

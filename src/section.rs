// This file is dual licensed as MIT OR Apache-2.0, at your option.

// In-memory layout of a needle section.
//
// A section covers a contiguous range of needle ids with two containers:
//
// packed: fixed-capacity vector, strictly increasing by id. Filled by
// in-order appends and never reallocated. Deleting a packed needle
// tombstones the slot in place (size 0) instead of shifting neighbours.
//
// overflow: hash map taking the ids that arrive out of order, or after
// packed has filled up.
//
// An id lives in at most one of the two containers. `start` is the id
// that created the section and never changes; `end` is the largest id
// ever set. Both are readable without the section lock so the map can
// route keys while other sections are being written.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

/// Packed slots per section.
pub const SECTION_BATCH: usize = 100_000;

pub type NeedleId = u64;
pub type Offset = u64;
pub type Size = u32;

/// Location record of a single needle. A size of 0 marks a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleValue {
	pub key: NeedleId,
	pub offset: Offset,
	pub size: Size,
}

impl NeedleValue {
	pub fn is_tombstone(&self) -> bool {
		self.size == 0
	}
}

enum SlotSearch {
	Hit(usize),
	Miss,
	// Empty packed vector, or key greater than the last packed id.
	PastMax,
}

struct SectionInner {
	packed: Vec<NeedleValue>,
	overflow: HashMap<NeedleId, NeedleValue>,
}

pub struct CompactSection {
	start: NeedleId,
	// Mirrors of lock-guarded state, maintained under the write lock and
	// read relaxed by the router.
	end: AtomicU64,
	full: AtomicBool,
	inner: RwLock<SectionInner>,
}

impl CompactSection {
	pub fn new(start: NeedleId) -> CompactSection {
		CompactSection {
			start,
			end: AtomicU64::new(start),
			full: AtomicBool::new(false),
			inner: RwLock::new(SectionInner {
				packed: Vec::with_capacity(SECTION_BATCH),
				overflow: HashMap::new(),
			}),
		}
	}

	pub fn start(&self) -> NeedleId {
		self.start
	}

	pub(crate) fn end_hint(&self) -> NeedleId {
		self.end.load(Ordering::Relaxed)
	}

	pub(crate) fn is_full(&self) -> bool {
		self.full.load(Ordering::Relaxed)
	}

	// Returns the previous offset and size of the needle, or (0, 0) if it
	// was not present.
	pub fn set(&self, key: NeedleId, offset: Offset, size: Size) -> (Offset, Size) {
		let mut inner = self.inner.write();
		if key > self.end.load(Ordering::Relaxed) {
			self.end.store(key, Ordering::Relaxed);
		}
		match Self::search(&inner.packed, key) {
			SlotSearch::Hit(i) => {
				let slot = &mut inner.packed[i];
				let old = (slot.offset, slot.size);
				slot.offset = offset;
				slot.size = size;
				old
			}
			SlotSearch::PastMax if inner.packed.len() < SECTION_BATCH => {
				inner.packed.push(NeedleValue { key, offset, size });
				if inner.packed.len() == SECTION_BATCH {
					self.full.store(true, Ordering::Relaxed);
				}
				(0, 0)
			}
			_ => inner
				.overflow
				.insert(key, NeedleValue { key, offset, size })
				.map_or((0, 0), |old| (old.offset, old.size)),
		}
	}

	// Returns the previous size of the needle, or 0 if it was not present
	// or already tombstoned.
	pub fn delete(&self, key: NeedleId) -> Size {
		let mut inner = self.inner.write();
		let mut old = 0;
		if let SlotSearch::Hit(i) = Self::search(&inner.packed, key) {
			if inner.packed[i].size > 0 {
				old = inner.packed[i].size;
				inner.packed[i].size = 0;
			}
		}
		if let Some(value) = inner.overflow.remove(&key) {
			old = value.size;
		}
		old
	}

	// A tombstoned packed slot is still present: the returned value has
	// size 0 and callers treat it as deleted.
	pub fn get(&self, key: NeedleId) -> Option<NeedleValue> {
		let inner = self.inner.read();
		if let Some(value) = inner.overflow.get(&key) {
			return Some(*value);
		}
		match Self::search(&inner.packed, key) {
			SlotSearch::Hit(i) => Some(inner.packed[i]),
			_ => None,
		}
	}

	fn search(packed: &[NeedleValue], key: NeedleId) -> SlotSearch {
		match packed.last() {
			None => return SlotSearch::PastMax,
			Some(last) if last.key < key => return SlotSearch::PastMax,
			_ => {}
		}
		match packed.binary_search_by_key(&key, |value| value.key) {
			Ok(i) => SlotSearch::Hit(i),
			Err(_) => SlotSearch::Miss,
		}
	}

	// Overflow needles first, then the packed slots that were not
	// superseded by an overflow entry for the same id.
	pub(crate) fn visit<E, F: FnMut(NeedleValue) -> Result<(), E>>(&self, f: &mut F) -> Result<(), E> {
		let inner = self.inner.read();
		for value in inner.overflow.values() {
			f(*value)?;
		}
		for value in &inner.packed {
			if !inner.overflow.contains_key(&value.key) {
				f(*value)?;
			}
		}
		Ok(())
	}

	// Same emission order as `visit`, without taking the lock. Only
	// callable with exclusive access to the section.
	pub(crate) fn collect_into(&mut self, out: &mut Vec<NeedleValue>) {
		let inner = self.inner.get_mut();
		for value in inner.overflow.values() {
			out.push(*value);
		}
		for value in &inner.packed {
			if !inner.overflow.contains_key(&value.key) {
				out.push(*value);
			}
		}
	}

	// (packed slots, overflow entries, tombstoned packed slots)
	pub(crate) fn occupancy(&self) -> (usize, usize, usize) {
		let inner = self.inner.read();
		let tombstones = inner.packed.iter().filter(|value| value.size == 0).count();
		(inner.packed.len(), inner.overflow.len(), tombstones)
	}
}

// This file is dual licensed as MIT OR Apache-2.0, at your option.

//! Compact in-memory needle index for blob storage volumes.
//!
//! Maps a fixed-width needle id to the offset and size of the blob in
//! the volume file. Entries live in fixed-capacity sections of sorted
//! packed slots, so a mostly increasing id stream (the common case when
//! replaying an append-only volume) costs no per-entry allocation; ids
//! that arrive out of order are absorbed by per-section overflow maps
//! and can be folded back into packed slots with [`CompactMap::optimize`].
//!
//! The index is volatile: it is rebuilt from the volume's index file at
//! startup and discarded at shutdown.

mod compact_map;
mod section;

pub use compact_map::{CompactMap, MapStats};
pub use section::{CompactSection, NeedleId, NeedleValue, Offset, Size, SECTION_BATCH};

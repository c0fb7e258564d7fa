mod entry;

pub use self::entry::{CacheEntry, CacheUpdate};
pub(crate) use self::entry::{EntryRow, NewEntryRow, path_to_text, size_to_row};

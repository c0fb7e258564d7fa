//! Consistency tokens.
//!
//! An etag is 32 lowercase hex characters taken from a BLAKE3 digest.

use std::path::Path;
use tidemark_storage::{EntryInfo, EntryKind};
use time::OffsetDateTime;

const ETAG_LENGTH: usize = 32;

fn finish(hasher: &blake3::Hasher) -> String {
    hasher.finalize().to_hex().as_str()[..ETAG_LENGTH].to_string()
}

/// Etag for an entry as found on its storage.
///
/// Uses the backend's native token when there is one, otherwise derives one
/// from the entry's metadata at one-second resolution (the resolution the
/// cache stores), so an unchanged entry always derives the same etag.
pub fn derive(storage: &str, info: &EntryInfo) -> String {
    if let Some(etag) = &info.etag {
        return etag.clone();
    }
    let size = match info.kind {
        EntryKind::File => info.size,
        EntryKind::Directory => 0,
    };
    let mut hasher = blake3::Hasher::new();
    hasher.update(storage.as_bytes());
    hasher.update(&[0]);
    hasher.update(info.path.as_os_str().as_encoded_bytes());
    hasher.update(&[0]);
    hasher.update(info.kind.to_string().as_bytes());
    hasher.update(&size.to_le_bytes());
    hasher.update(&info.modified.unix_timestamp().to_le_bytes());
    finish(&hasher)
}

/// A fresh etag for a directory whose subtree changed at `timestamp`.
///
/// Chained from the previous etag, so it differs from it even when two
/// propagations happen within the same timestamp.
pub fn mint(previous: &str, path: &Path, timestamp: OffsetDateTime) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(previous.as_bytes());
    hasher.update(&[0]);
    hasher.update(path.as_os_str().as_encoded_bytes());
    hasher.update(&[0]);
    hasher.update(&timestamp.unix_timestamp_nanos().to_le_bytes());
    finish(&hasher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_derive_is_stable_within_a_second() {
        let at = OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000);
        let a = EntryInfo::file("foo.txt", 6, at);
        let b = EntryInfo::file("foo.txt", 6, at + Duration::milliseconds(300));
        assert_eq!(derive("memory::memory", &a), derive("memory::memory", &b));
        assert_eq!(derive("memory::memory", &a).len(), ETAG_LENGTH);
    }

    #[test]
    fn test_derive_changes_with_metadata() {
        let at = OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000);
        let base = derive("memory::memory", &EntryInfo::file("foo.txt", 6, at));
        assert_ne!(base, derive("memory::other", &EntryInfo::file("foo.txt", 6, at)));
        assert_ne!(base, derive("memory::memory", &EntryInfo::file("foo.txt", 7, at)));
        assert_ne!(base, derive("memory::memory", &EntryInfo::file("foo.txt", 6, at + Duration::seconds(1))));
        assert_ne!(base, derive("memory::memory", &EntryInfo::directory("foo.txt", at)));
    }

    #[test]
    fn test_native_etag_wins() {
        let info = EntryInfo::file("foo.txt", 6, OffsetDateTime::UNIX_EPOCH).with_etag("\"abc\"");
        assert_eq!(derive("memory::memory", &info), "\"abc\"");
    }

    #[test]
    fn test_mint_always_moves_on() {
        let now = OffsetDateTime::now_utc();
        let first = mint("", Path::new("/foo"), now);
        let second = mint(&first, Path::new("/foo"), now);
        assert_ne!(first, second);
        assert_ne!(first, mint("", Path::new("/bar"), now));
        assert_eq!(first.len(), ETAG_LENGTH);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

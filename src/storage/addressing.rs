//! Hash addressing.
//!
//! Blobs are laid out flat under 256 shard buckets:
//! ```text
//! {root}/
//!   {hash[0..2]}/     # shard, "00" ..= "ff"
//!     {hash}
//! ```

use once_cell::sync::Lazy;

use crate::error::{StorageError, StorageResult};

/// The 256 shard bucket names, `"00"` to `"ff"` in order.
pub static SHARDS: Lazy<Vec<String>> = Lazy::new(|| (0..=255u8).map(|b| format!("{:02x}", b)).collect());

/// Reject hashes that cannot be addressed.
pub fn validate_hash(hash: &str) -> StorageResult<()> {
    if hash.len() < 2 || !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(StorageError::InvalidHash(hash.to_string()));
    }
    Ok(())
}

/// Shard bucket of a hash. Callers must validate the hash first.
pub fn shard_of(hash: &str) -> &str {
    &hash[..2]
}

/// Backend-relative path of a blob: `shard/hash`.
pub fn hash_to_path(hash: &str) -> StorageResult<String> {
    validate_hash(hash)?;
    Ok(format!("{}/{}", shard_of(hash), hash))
}

/// Whether an entry named `name` found under `shard` belongs there.
pub fn belongs_to_shard(shard: &str, name: &str) -> bool {
    name.len() >= 2 && name.is_char_boundary(2) && &name[..2] == shard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shards_cover_all_buckets() {
        assert_eq!(SHARDS.len(), 256);
        assert_eq!(SHARDS[0], "00");
        assert_eq!(SHARDS[0x3c], "3c");
        assert_eq!(SHARDS[255], "ff");
    }

    #[test]
    fn test_hash_to_path() {
        let hash = "3ac5b1f0c1e5a3f2d7a0e0c9d1b2a3c4d5e6f7a8";
        let path = hash_to_path(hash).unwrap();
        assert!(path.starts_with("3a/"));
        assert!(path.ends_with(hash));
        assert_eq!(path, format!("3a/{}", hash));
    }

    #[test]
    fn test_invalid_hashes() {
        assert!(hash_to_path("a").is_err());
        assert!(hash_to_path("").is_err());
        assert!(hash_to_path("AB12").is_err());
        assert!(hash_to_path("../etc/passwd").is_err());
        assert!(matches!(validate_hash("zz"), Err(StorageError::InvalidHash(_))));
    }

    #[test]
    fn test_belongs_to_shard() {
        assert!(belongs_to_shard("ab", "abcdef"));
        assert!(!belongs_to_shard("ab", "acdef0"));
        assert!(!belongs_to_shard("ab", "a"));
        assert!(!belongs_to_shard("ab", "é1"));
    }
}

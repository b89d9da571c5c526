//! Object key layouts.
//!
//! Downstream consumers only understand these exact layouts, so they are
//! reproduced byte for byte:
//!
//! - sharded: `06/f5/d3/06f5d3ec-8ebf-4d32-8c1c-41e27e40b7fd`
//! - legacy:  `06/f5/d3/06f5d3ec-8ebf-4d32-8c1c-41e27e40b7fd/06f5d3ec-8ebf-4d32-8c1c-41e27e40b7fd.data`
//! - verbatim: the identifier is already a key

use thiserror::Error;
use uuid::Uuid;

/// Width of each shard segment.
pub const SHARD_WIDTH: usize = 2;
/// Number of shard segments before the leaf.
pub const SHARD_DEPTH: usize = 3;
/// File suffix of the legacy layout.
pub const LEGACY_SUFFIX: &str = ".data";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("identifier `{0}` is too short to shard")]
    TooShort(String),
    #[error("identifier `{0}` contains characters that cannot appear in a key")]
    InvalidCharacters(String),
    #[error("illegal sharded key `{0}`")]
    IllegalKey(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyLayout {
    Sharded,
    LegacySuffixed,
    Verbatim,
}

impl KeyLayout {
    /// Map an identifier onto its storage key under this layout.
    pub fn storage_key(self, id: &str) -> Result<String, KeyError> {
        match self {
            KeyLayout::Sharded => sharded_key(id),
            KeyLayout::LegacySuffixed => {
                Ok(format!("{}/{}{}", sharded_key(id)?, id, LEGACY_SUFFIX))
            }
            KeyLayout::Verbatim => {
                if id.is_empty() {
                    return Err(KeyError::TooShort(id.to_string()));
                }
                Ok(id.to_string())
            }
        }
    }
}

/// `id[0:2]/id[2:4]/id[4:6]/id`.
pub fn sharded_key(id: &str) -> Result<String, KeyError> {
    if id.bytes().any(|b| b == b'/' || b.is_ascii_control()) {
        return Err(KeyError::InvalidCharacters(id.to_string()));
    }
    let mut key = String::with_capacity(id.len() + SHARD_DEPTH * (SHARD_WIDTH + 1));
    for depth in 0..SHARD_DEPTH {
        let segment = id
            .get(depth * SHARD_WIDTH..(depth + 1) * SHARD_WIDTH)
            .ok_or_else(|| KeyError::TooShort(id.to_string()))?;
        key.push_str(segment);
        key.push('/');
    }
    key.push_str(id);
    Ok(key)
}

/// Recover the identifier from a sharded key, checking that the shard
/// segments agree with it and that it is a UUID.
pub fn identifier_from_key(key: &str) -> Result<String, KeyError> {
    let illegal = || KeyError::IllegalKey(key.to_string());
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() != SHARD_DEPTH + 1 {
        return Err(illegal());
    }
    let id = segments[SHARD_DEPTH];
    for (depth, segment) in segments[..SHARD_DEPTH].iter().enumerate() {
        if id.get(depth * SHARD_WIDTH..(depth + 1) * SHARD_WIDTH) != Some(*segment) {
            return Err(illegal());
        }
    }
    Uuid::parse_str(id).map_err(|_| illegal())?;
    Ok(id.to_string())
}

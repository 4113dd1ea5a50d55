//! A hash map from fixed-size keys to `i64` values that keeps its buckets on disk.
//!
//! Keys are hashed into a fixed number of buckets (sized at creation for the expected number of
//! entries). Each bucket is a single page stored in a [crate::datafile::Collection]; only the
//! location of each bucket is kept in memory. A lookup therefore costs exactly one page read,
//! regardless of the size of the map.
//!
//! # Format
//!
//! Each bucket is stored as a 4096-byte page (big-endian), keyed in the collection by the index
//! of the bucket:
//!
//! ```text
//! +--------------+-------------+----------------------+---------+---------+-----+---------+
//! | Index (i32)  | Count (i32) | Next Location (i64)  | Entry 0 | Entry 1 | ... | Padding |
//! +--------------+-------------+----------------------+---------+---------+-----+---------+
//!
//! Entry = Key Hash (i32) | Key Version (i32) | Key (K::SIZE bytes) | Value (i64)
//! ```
//!
//! `Next Location` is always `0` (buckets never chain to an overflow bucket): a bucket that
//! would exceed `(4096 - 16) / (K::SIZE + 16)` entries fails the write session with
//! [Error::BucketFull]. The number of buckets is chosen so that the map is at most half full
//! when holding `map_size` entries.
//!
//! # Writing
//!
//! Changes are made in write sessions. [HalfDiskHashMap::put] only records a change in memory.
//! [HalfDiskHashMap::end_writing] applies all changes to each affected bucket, stores the new
//! version of each bucket in the collection, and publishes its location. Only one write session
//! can be active at a time.
//!
//! # Reading
//!
//! [HalfDiskHashMap::get] loads the location of the key's bucket, reads the bucket page into a
//! stack buffer, and scans it for the key (comparing hashes before keys). Reads never lock and can
//! run concurrently with a write session and with a merge.
//!
//! # Merging
//!
//! Every write session produces a new file and leaves old versions of rewritten buckets behind.
//! [HalfDiskHashMap::merge] compacts the oldest files into one, relocating each bucket that was
//! not rewritten in the meantime.
//!
//! # Example
//!
//! ```rust
//! use ledger_storage::hdhm::{Config, HalfDiskHashMap};
//! use prometheus_client::registry::Registry;
//!
//! let cfg = Config {
//!     map_size: 1_000,
//!     directory: std::env::temp_dir().join("ledger_storage_hdhm_doc"),
//!     name: "example".into(),
//! };
//! let map = HalfDiskHashMap::<u64>::init(cfg, &mut Registry::default()).unwrap();
//!
//! // Write a batch of changes
//! map.start_writing().unwrap();
//! map.put(1, 100).unwrap();
//! map.put(2, 200).unwrap();
//! map.end_writing().unwrap();
//!
//! // Read them back
//! assert_eq!(map.get(&1, -1).unwrap(), 100);
//! assert_eq!(map.get(&3, -1).unwrap(), -1);
//!
//! // Remove all data
//! map.destroy().unwrap();
//! ```

mod bucket;
mod storage;
pub use storage::{HalfDiskHashMap, Stats};

use crate::datafile;
use bytes::{Buf, BufMut};
use std::{hash::Hash, path::PathBuf};
use thiserror::Error;

/// Errors that can occur when interacting with a [HalfDiskHashMap].
#[derive(Debug, Error)]
pub enum Error {
    #[error("data file error: {0}")]
    DataFile(#[from] datafile::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key too large: {0}")]
    KeyTooLarge(usize),
    #[error("invalid map size: {0}")]
    InvalidMapSize(u64),
    #[error("bucket full: {0}")]
    BucketFull(i32),
    #[error("bucket mismatch: expected {0}, found {1}")]
    BucketMismatch(u32, i32),
    #[error("bucket corrupt: {0} has {1} entries")]
    BucketCorrupt(u32, i32),
    #[error("unsupported key version: {0}")]
    UnsupportedKeyVersion(i32),
    #[error("write session already active")]
    WriteSessionActive,
    #[error("no active write session")]
    NoWriteSession,
}

/// Configuration for a [HalfDiskHashMap].
#[derive(Clone, Debug)]
pub struct Config {
    /// Expected number of entries in the map.
    pub map_size: u64,

    /// Directory holding the files of the map.
    pub directory: PathBuf,

    /// Prefix of the name of every file of the map.
    pub name: String,
}

/// A key with a fixed-size serialization.
pub trait VirtualKey: Eq + Hash + Clone + Send + Sync {
    /// Size of the serialized key.
    const SIZE: usize;

    /// Version of the serialization written by [VirtualKey::write].
    const VERSION: i32 = 1;

    /// Hash of the key (stable across processes).
    fn hash_code(&self) -> i32;

    /// Write exactly [VirtualKey::SIZE] bytes to `buf`.
    fn write(&self, buf: &mut impl BufMut);

    /// Read a key serialized with `version`.
    fn read(buf: &mut impl Buf, version: i32) -> Result<Self, Error>
    where
        Self: Sized;

    /// Returns true if `buf` holds this key serialized with `version`.
    fn equals(&self, mut buf: &[u8], version: i32) -> bool {
        Self::read(&mut buf, version).is_ok_and(|key| key == *self)
    }
}

impl VirtualKey for u64 {
    const SIZE: usize = u64::BITS as usize / 8;

    fn hash_code(&self) -> i32 {
        (self ^ (self >> 32)) as i32
    }

    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(*self);
    }

    fn read(buf: &mut impl Buf, version: i32) -> Result<Self, Error> {
        if version != Self::VERSION {
            return Err(Error::UnsupportedKeyVersion(version));
        }
        if buf.remaining() < Self::SIZE {
            return Err(Error::KeyTooLarge(Self::SIZE));
        }
        Ok(buf.get_u64())
    }

    fn equals(&self, buf: &[u8], version: i32) -> bool {
        version == Self::VERSION && buf.get(..Self::SIZE) == Some(&self.to_be_bytes()[..])
    }
}

impl<const N: usize> VirtualKey for [u8; N] {
    const SIZE: usize = N;

    fn hash_code(&self) -> i32 {
        self.iter()
            .fold(1i32, |hash, b| hash.wrapping_mul(31).wrapping_add(*b as i8 as i32))
    }

    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(self);
    }

    fn read(buf: &mut impl Buf, version: i32) -> Result<Self, Error> {
        if version != Self::VERSION {
            return Err(Error::UnsupportedKeyVersion(version));
        }
        if buf.remaining() < N {
            return Err(Error::KeyTooLarge(N));
        }
        let mut key = [0u8; N];
        buf.copy_to_slice(&mut key);
        Ok(key)
    }

    fn equals(&self, buf: &[u8], version: i32) -> bool {
        version == Self::VERSION && buf.get(..N) == Some(&self[..])
    }
}

/// Mix the high bits of `hash` into the low bits (which select the bucket).
fn spread(hash: i32) -> i32 {
    hash ^ ((hash as u32) >> 16) as i32
}

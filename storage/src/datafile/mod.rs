//! A collection of append-only data files addressed by opaque locations.
//!
//! Records are appended to a single file per write session and addressed by a `location`
//! (returned when the record is stored) that identifies both the file and the offset of the
//! record in it. Files never change once completed: updating a key means storing a new record
//! and forgetting the old location. Old records are reclaimed by merging files, which copies the
//! latest record of every key into a new file and reports each `(old, new)` location pair so that
//! any index built over the collection can be updated before the old files are removed.
//!
//! # Format
//!
//! Each file is named `<name>_<index>.dat` and stores a sequence of records followed by zero
//! padding (to a 4096-byte boundary) and a single 4096-byte footer page. All integers are
//! big-endian.
//!
//! ```text
//! +---------------------+---------------------+-----+---------+-------------+
//! | Record 0            | Record 1            | ... | Padding | Footer      |
//! +---------------------+---------------------+-----+---------+-------------+
//!
//! Record = Key (i64) | Length (u32) | Data (Length bytes)
//!
//! Footer = Magic (u32) | Index (u32) | Generation (u64) | Merged From (u64) |
//!          Created (u64, ms) | Min Valid Key (i64) | Max Valid Key (i64) |
//!          Item Count (u64) | Data Size (u64) | Flags (u8) | CRC32 (u32) | Zero padding
//! ```
//!
//! A file without a valid footer was never completed and is removed on `init`.
//!
//! # Locations
//!
//! A location packs the index of the file and the byte offset of the record within it:
//!
//! ```text
//! location = ((index + 1) << 40) | offset
//! ```
//!
//! No valid location is ever `0`, so `0` can be used to mean "no location".
//!
//! # Generations
//!
//! Every completed file records the recency of the data it holds. A file written by a session
//! has a `generation` equal to its index. A file written by a merge inherits the greatest
//! generation of its inputs (and records the smallest in `merged_from`), so that replaying files
//! ordered by generation (merge files after the session file of the same generation) always
//! applies older data first, no matter which index the merge file was given.
//!
//! # Concurrency
//!
//! Reads may run concurrently with a write session and with a merge. A read that races a merge
//! can find the file of its location already removed, in which case it fails with
//! [Error::FileMissing] (callers should look up the relocated record, which is published through
//! the merge callback before any input file is removed).
//!
//! # Example
//!
//! ```rust
//! use ledger_storage::datafile::{Collection, Config, DataFileCollection, DataToRead};
//! use prometheus_client::registry::Registry;
//!
//! let directory = std::env::temp_dir().join("ledger_storage_datafile_doc");
//! let cfg = Config { directory, name: "example".into() };
//! let collection = DataFileCollection::init(cfg, &mut Registry::default()).unwrap();
//!
//! // Store a record
//! collection.start_writing().unwrap();
//! let location = collection.store_data(42, b"hello").unwrap();
//! collection.end_writing(0, 100).unwrap();
//!
//! // Read it back
//! let mut buf = [0u8; 5];
//! let read = collection.read_data(location, &mut buf, DataToRead::Value).unwrap();
//! assert_eq!(&buf[..read], b"hello");
//!
//! // Remove all files
//! collection.destroy().unwrap();
//! ```

mod file;
pub use file::{DataFileReader, Metadata};
mod storage;
pub use storage::DataFileCollection;

use std::path::PathBuf;
use thiserror::Error;

/// Size of a page (the alignment of every file and the size of its footer).
pub const PAGE_SIZE: usize = 4096;

/// Number of bits of a location used for the offset of a record.
const OFFSET_BITS: u32 = 40;

/// First offset that can't be addressed by a location.
const MAX_OFFSET: u64 = 1 << OFFSET_BITS;

/// First file index that can't be addressed by a (positive) location.
const MAX_FILES: u32 = (1 << (63 - OFFSET_BITS)) - 1;

/// Errors that can occur when interacting with a data file collection.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid location: {0}")]
    InvalidLocation(i64),
    #[error("file missing: {0}")]
    FileMissing(u32),
    #[error("record corrupt at location: {0}")]
    RecordCorrupt(i64),
    #[error("buffer too small: needed {0}, got {1}")]
    BufferTooSmall(usize, usize),
    #[error("record too large: {0}")]
    RecordTooLarge(usize),
    #[error("file full: {0}")]
    FileFull(u32),
    #[error("file index exhausted")]
    FileIndexExhausted,
    #[error("write session already active")]
    WriteSessionActive,
    #[error("no active write session")]
    NoWriteSession,
    #[error("files to merge are not a contiguous run of completed files")]
    NonContiguousMerge,
}

/// Configuration for a [DataFileCollection].
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the files of the collection.
    pub directory: PathBuf,

    /// Prefix of the name of every file of the collection.
    pub name: String,
}

/// Part of a record to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataToRead {
    /// The key of the record (8 bytes, big-endian).
    Key,
    /// The data of the record.
    Value,
    /// The key of the record followed by its data.
    KeyValue,
}

/// The relocation of a record by a merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Move {
    /// Key the record was stored under.
    pub key: i64,
    pub old: i64,
    pub new: i64,
}

/// Encode the location of the record at `offset` in the file `index`.
pub fn location(index: u32, offset: u64) -> i64 {
    debug_assert!(index < MAX_FILES && offset < MAX_OFFSET);
    (((index as u64 + 1) << OFFSET_BITS) | offset) as i64
}

/// Returns the index of the file of `location` (or `None` if `location` is not valid).
pub fn file_index_of(location: i64) -> Option<u32> {
    if location <= 0 {
        return None;
    }
    u32::try_from((location >> OFFSET_BITS) - 1).ok()
}

/// Returns the offset of the record of `location` within its file.
pub fn offset_of(location: i64) -> u64 {
    location as u64 & (MAX_OFFSET - 1)
}

/// Storage of records addressed by locations.
///
/// Only one write session can be active at a time. Reads may run concurrently with the write
/// session and with merges.
pub trait Collection: Send + Sync {
    /// Handle to a completed file that can be merged.
    type File: Send + Sync;

    /// Start a write session.
    fn start_writing(&self) -> Result<(), Error>;

    /// Store `data` under `key`, returning its location.
    fn store_data(&self, key: i64, data: &[u8]) -> Result<i64, Error>;

    /// Complete the write session, marking keys outside of `[min_valid_key, max_valid_key]` as
    /// discardable by future merges.
    fn end_writing(&self, min_valid_key: i64, max_valid_key: i64) -> Result<(), Error>;

    /// Read (part of) the record at `location` into `buf`, returning the number of bytes read.
    fn read_data(&self, location: i64, buf: &mut [u8], mode: DataToRead) -> Result<usize, Error>;

    /// Returns the oldest completed files whose combined size does not exceed `max_total_size`.
    fn fully_written_files(&self, max_total_size: u64) -> Vec<Self::File>;

    /// Merge `files` into a single file.
    ///
    /// `files` must be a contiguous run of completed files (ordered oldest to newest), as returned
    /// by [Collection::fully_written_files]. Otherwise, [Error::NonContiguousMerge] is returned and
    /// nothing is changed.
    ///
    /// All moves are reported to `moves` after the new file is readable and before any merged
    /// file is removed.
    fn merge(&self, moves: &mut dyn FnMut(&[Move]), files: Vec<Self::File>) -> Result<(), Error>;

    /// Visit the key and location of every stored record, from oldest to newest.
    fn replay(&self, visitor: &mut dyn FnMut(i64, i64)) -> Result<(), Error>;

    /// Close the collection.
    fn close(self) -> Result<(), Error>
    where
        Self: Sized;

    /// Remove all data held by the collection.
    fn destroy(self) -> Result<(), Error>
    where
        Self: Sized;
}

use super::{
    bucket::{Bucket, Layout},
    spread, Config, Error, VirtualKey,
};
use crate::datafile::{
    self, Collection, DataFileCollection, DataToRead, Move, PAGE_SIZE,
};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{
    collections::HashMap,
    fmt, fs,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Mutex, MutexGuard,
    },
};
use tracing::{debug, trace, warn};

/// Buckets provide twice as many slots as the expected number of entries.
const LOADING_FACTOR_DIVISOR: u64 = 2;

/// Largest supported number of buckets.
const MAX_BUCKETS: u64 = 1 << 30;

/// Location of a bucket that has never been written.
const NON_EXISTENT_BUCKET: i64 = 0;

/// Changes of a write session, by bucket.
type Session<K> = HashMap<u32, HashMap<K, i64>>;

/// Dimensions of a [HalfDiskHashMap].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stats {
    pub map_size: u64,
    pub minimum_buckets: u64,
    pub num_of_buckets: u32,
    pub entries_per_bucket: usize,
    pub entry_size: usize,
    pub value_offset: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HalfDiskHashMap Stats {{")?;
        writeln!(f, "    map_size = {}", self.map_size)?;
        writeln!(f, "    minimum_buckets = {}", self.minimum_buckets)?;
        writeln!(f, "    num_of_buckets = {}", self.num_of_buckets)?;
        writeln!(f, "    entries_per_bucket = {}", self.entries_per_bucket)?;
        writeln!(f, "    entry_size = {}", self.entry_size)?;
        writeln!(f, "    value_offset = {}", self.value_offset)?;
        write!(f, "}}")
    }
}

/// A map from keys to `i64` values that keeps only the location of each bucket in memory.
pub struct HalfDiskHashMap<K: VirtualKey, C: Collection = DataFileCollection> {
    cfg: Config,
    layout: Layout,
    minimum_buckets: u64,
    num_of_buckets: u32,

    index: Box<[AtomicI64]>,
    collection: C,

    writing: AtomicBool,
    session: Mutex<Option<Session<K>>>,

    gets: Counter,
    puts: Counter,
    buckets_written: Counter,
    merges: Counter,
}

impl<K: VirtualKey> HalfDiskHashMap<K, DataFileCollection> {
    /// Initialize a new `HalfDiskHashMap` backed by files in `cfg.directory`.
    ///
    /// Metrics of the underlying files are registered with the `files` prefix.
    pub fn init(cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        let collection = DataFileCollection::init(
            datafile::Config {
                directory: cfg.directory.clone(),
                name: cfg.name.clone(),
            },
            registry.sub_registry_with_prefix("files"),
        )?;
        Self::with_collection(cfg, collection, registry)
    }
}

impl<K: VirtualKey, C: Collection> HalfDiskHashMap<K, C> {
    /// Initialize a new `HalfDiskHashMap` over an existing collection.
    ///
    /// The location of every bucket is recovered by replaying `collection`.
    pub fn with_collection(cfg: Config, collection: C, registry: &mut Registry) -> Result<Self, Error> {
        let layout = Layout::new(K::SIZE)?;
        if cfg.map_size == 0 {
            return Err(Error::InvalidMapSize(cfg.map_size));
        }
        let minimum_buckets = cfg
            .map_size
            .checked_mul(LOADING_FACTOR_DIVISOR)
            .map(|slots| slots.div_ceil(layout.entries_per_bucket as u64))
            .filter(|&minimum| minimum < MAX_BUCKETS)
            .ok_or(Error::InvalidMapSize(cfg.map_size))?;
        let num_of_buckets = (1u64 << (63 - minimum_buckets.leading_zeros())) * 2;
        let num_of_buckets =
            u32::try_from(num_of_buckets).map_err(|_| Error::InvalidMapSize(cfg.map_size))?;
        fs::create_dir_all(&cfg.directory)?;

        // Rebuild the index (later records of a bucket replace earlier ones)
        let index: Box<[AtomicI64]> = (0..num_of_buckets)
            .map(|_| AtomicI64::new(NON_EXISTENT_BUCKET))
            .collect();
        let mut ignored = 0u64;
        collection.replay(&mut |bucket, location| {
            match usize::try_from(bucket).ok().and_then(|bucket| index.get(bucket)) {
                Some(slot) => slot.store(location, Ordering::Relaxed),
                None => ignored += 1,
            }
        })?;
        if ignored > 0 {
            warn!(ignored, num_of_buckets, "ignored records of unknown buckets");
        }
        let buckets = index
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != NON_EXISTENT_BUCKET)
            .count();
        debug!(
            map = %cfg.name,
            buckets,
            num_of_buckets,
            entries_per_bucket = layout.entries_per_bucket,
            "initialized map"
        );

        // Initialize metrics
        let gets = Counter::default();
        let puts = Counter::default();
        let buckets_written = Counter::default();
        let merges = Counter::default();
        registry.register("gets", "Number of gets performed", gets.clone());
        registry.register("puts", "Number of puts performed", puts.clone());
        registry.register(
            "buckets_written",
            "Number of buckets written",
            buckets_written.clone(),
        );
        registry.register("merges", "Number of merges performed", merges.clone());

        Ok(Self {
            cfg,
            layout,
            minimum_buckets,
            num_of_buckets,

            index,
            collection,

            writing: AtomicBool::new(false),
            session: Mutex::new(None),

            gets,
            puts,
            buckets_written,
            merges,
        })
    }

    pub fn num_of_buckets(&self) -> u32 {
        self.num_of_buckets
    }

    pub fn entries_per_bucket(&self) -> usize {
        self.layout.entries_per_bucket
    }

    pub fn collection(&self) -> &C {
        &self.collection
    }

    pub fn stats(&self) -> Stats {
        Stats {
            map_size: self.cfg.map_size,
            minimum_buckets: self.minimum_buckets,
            num_of_buckets: self.num_of_buckets,
            entries_per_bucket: self.layout.entries_per_bucket,
            entry_size: self.layout.entry_size,
            value_offset: self.layout.value_offset,
        }
    }

    fn bucket_index(&self, hash: i32) -> u32 {
        (hash as u32) & (self.num_of_buckets - 1)
    }

    fn session(&self) -> MutexGuard<'_, Option<Session<K>>> {
        self.session.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Read the current page of `bucket` into `page`, returning false if the bucket has never been
    /// written.
    ///
    /// If the file holding the bucket is removed (by a merge) between loading its location and
    /// reading it, the read is retried at the location the bucket was moved to.
    fn read_bucket(&self, bucket: u32, page: &mut [u8]) -> Result<bool, Error> {
        let slot = &self.index[bucket as usize];
        let mut location = slot.load(Ordering::Acquire);
        loop {
            if location == NON_EXISTENT_BUCKET {
                return Ok(false);
            }
            match self.collection.read_data(location, page, DataToRead::Value) {
                Ok(read) => {
                    let stored = Bucket::new(self.layout, page);
                    if read != PAGE_SIZE {
                        return Err(Error::BucketMismatch(bucket, stored.index()));
                    }
                    stored.validate(bucket)?;
                    return Ok(true);
                }
                Err(datafile::Error::FileMissing(index)) => {
                    let current = slot.load(Ordering::Acquire);
                    if current == location {
                        return Err(datafile::Error::FileMissing(index).into());
                    }
                    trace!(bucket, from = location, to = current, "bucket relocated");
                    location = current;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Returns the value of `key` (or `not_found` if the map has no value for it).
    ///
    /// Changes of an active write session are not visible until the session ends.
    pub fn get(&self, key: &K, not_found: i64) -> Result<i64, Error> {
        self.gets.inc();
        let hash = spread(key.hash_code());
        let bucket = self.bucket_index(hash);
        let mut page = [0u8; PAGE_SIZE];
        if !self.read_bucket(bucket, &mut page)? {
            return Ok(not_found);
        }
        Ok(Bucket::new(self.layout, &mut page)
            .find_value(hash, key)
            .unwrap_or(not_found))
    }

    /// Start a write session.
    ///
    /// Only one session can be active at a time.
    pub fn start_writing(&self) -> Result<(), Error> {
        if self
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::WriteSessionActive);
        }
        *self.session() = Some(HashMap::new());
        Ok(())
    }

    /// Set the value of `key` (applied to disk at the end of the write session).
    pub fn put(&self, key: K, value: i64) -> Result<(), Error> {
        let bucket = self.bucket_index(spread(key.hash_code()));
        let mut session = self.session();
        let session = session.as_mut().ok_or(Error::NoWriteSession)?;
        session.entry(bucket).or_default().insert(key, value);
        self.puts.inc();
        Ok(())
    }

    /// Write all changes of the write session to disk and end it.
    ///
    /// The session is ended even if writing fails (in which case some changes may have been
    /// applied and the map should no longer be written to).
    pub fn end_writing(&self) -> Result<(), Error> {
        let Some(changes) = self.session().take() else {
            return Err(Error::NoWriteSession);
        };
        let result = self.flush(changes);
        self.writing.store(false, Ordering::Release);
        result
    }

    fn flush(&self, changes: Session<K>) -> Result<(), Error> {
        if changes.is_empty() {
            return Ok(());
        }
        let buckets = changes.len();
        self.collection.start_writing()?;
        let max_valid_key = self.num_of_buckets as i64;
        if let Err(err) = self.write_buckets(changes) {
            if let Err(end) = self.collection.end_writing(0, max_valid_key) {
                warn!(error = ?end, "failed to end write session");
            }
            return Err(err);
        }
        self.collection.end_writing(0, max_valid_key)?;
        debug!(map = %self.cfg.name, buckets, "wrote buckets");
        Ok(())
    }

    fn write_buckets(&self, changes: Session<K>) -> Result<(), Error> {
        let mut page = vec![0u8; PAGE_SIZE];
        for (index, changes) in changes {
            // Load the current version of the bucket
            let exists = self.read_bucket(index, &mut page)?;
            let mut bucket = Bucket::new(self.layout, &mut page);
            if !exists {
                bucket.reset(index as i32);
            }

            // Apply changes
            for (key, value) in &changes {
                if let Err(err) = bucket.put_value(spread(key.hash_code()), key, *value) {
                    warn!(?bucket, changes = changes.len(), "bucket overflow");
                    return Err(err);
                }
            }

            // Publish the new version
            let location = self.collection.store_data(index as i64, &page)?;
            self.index[index as usize].store(location, Ordering::Release);
            self.buckets_written.inc();
            trace!(bucket = index, location, "stored bucket");
        }
        Ok(())
    }

    /// Merge the oldest files (up to `max_total_size` bytes combined) into one, returning the
    /// number of files merged.
    ///
    /// Nothing is merged unless at least two files qualify. Reads and a write session may run
    /// concurrently with a merge.
    pub fn merge(&self, max_total_size: u64) -> Result<usize, Error> {
        let files = self.collection.fully_written_files(max_total_size);
        let count = files.len();
        if count < 2 {
            return Ok(0);
        }
        debug!(map = %self.cfg.name, files = count, "merging files");
        let mut relocated = 0u64;
        self.collection.merge(
            &mut |moves: &[Move]| {
                for m in moves {
                    let Some(slot) = usize::try_from(m.key)
                        .ok()
                        .and_then(|bucket| self.index.get(bucket))
                    else {
                        continue;
                    };

                    // Skip buckets that were rewritten since the merge started
                    if slot
                        .compare_exchange(m.old, m.new, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        relocated += 1;
                    }
                }
            },
            files,
        )?;
        self.merges.inc();
        debug!(map = %self.cfg.name, files = count, relocated, "merged files");
        Ok(count)
    }

    /// Log the size of every bucket changed by the active write session.
    pub fn debug_dump_session(&self) {
        let session = self.session();
        let Some(changes) = session.as_ref() else {
            debug!(map = %self.cfg.name, "no active write session");
            return;
        };
        let mut buckets: Vec<_> = changes.iter().map(|(b, c)| (*b, c.len())).collect();
        buckets.sort_unstable();
        debug!(
            map = %self.cfg.name,
            touched = buckets.len(),
            num_of_buckets = self.num_of_buckets,
            "write session"
        );
        for (bucket, count) in buckets {
            if count > self.layout.entries_per_bucket {
                debug!(
                    bucket,
                    count,
                    entries_per_bucket = self.layout.entries_per_bucket,
                    "session bucket overflows"
                );
            } else {
                debug!(bucket, count, "session bucket");
            }
        }
    }

    /// Close the map.
    ///
    /// Changes of an active write session are discarded.
    pub fn close(self) -> Result<(), Error> {
        if self.session().is_some() {
            warn!(map = %self.cfg.name, "closing with active write session");
        }
        self.collection.close()?;
        Ok(())
    }

    /// Remove all data of the map.
    pub fn destroy(self) -> Result<(), Error> {
        self.collection.destroy()?;
        Ok(())
    }
}

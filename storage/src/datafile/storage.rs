use super::{
    file::{align_to_page, sync_dir, DataFileReader, Metadata, RECORD_HEADER_SIZE},
    file_index_of, location, offset_of, Collection, Config, DataToRead, Error, Move, MAX_FILES,
    MAX_OFFSET,
};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};
use tracing::{debug, trace, warn};

/// Extension of every data file.
const EXTENSION: &str = "dat";

/// State of the active write session.
struct Writer {
    file: Arc<DataFileReader>,
    offset: u64,
    items: u64,
}

/// Implementation of [Collection] backed by page-aligned files in a single directory.
pub struct DataFileCollection {
    cfg: Config,

    files: RwLock<BTreeMap<u32, Arc<DataFileReader>>>,
    writer: Mutex<Option<Writer>>,
    next_index: AtomicU32,

    merging: Mutex<()>,

    tracked: Gauge,
    reads: Counter,
    writes: Counter,
    merges: Counter,
}

impl DataFileCollection {
    /// Initialize a new `DataFileCollection` instance.
    ///
    /// Every completed file in the directory is opened (but not read). Files that were never
    /// completed (an interrupted write session or merge) and files whose data is already held by
    /// a completed merge file (a merge interrupted before its inputs were removed) are removed.
    pub fn init(cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        fs::create_dir_all(&cfg.directory)?;

        // Open all completed files
        let mut files = BTreeMap::new();
        let mut next_index = 0;
        for entry in fs::read_dir(&cfg.directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(index) = Self::parse_name(&cfg.name, &entry.file_name().to_string_lossy())
            else {
                continue;
            };
            next_index = next_index.max(index + 1);
            let path = entry.path();
            match DataFileReader::open(index, path.clone())? {
                Some(file) => {
                    debug!(index, path = %path.display(), "loaded data file");
                    files.insert(index, Arc::new(file));
                }
                None => {
                    warn!(index, path = %path.display(), "removing incomplete data file");
                    fs::remove_file(&path)?;
                }
            }
        }

        // Remove files already merged into another file
        let covered: Vec<u32> = files
            .values()
            .filter(|file| {
                let Some(metadata) = file.metadata() else {
                    return false;
                };
                files.values().any(|other| {
                    other
                        .metadata()
                        .is_some_and(|other| other.covers(metadata))
                })
            })
            .map(|file| file.index())
            .collect();
        for index in covered {
            if let Some(file) = files.remove(&index) {
                warn!(index, path = %file.path().display(), "removing merged data file");
                file.remove()?;
            }
        }
        sync_dir(&cfg.directory)?;

        // Initialize metrics
        let tracked = Gauge::default();
        let reads = Counter::default();
        let writes = Counter::default();
        let merges = Counter::default();
        registry.register("files", "Number of data files", tracked.clone());
        registry.register("reads", "Number of records read", reads.clone());
        registry.register("writes", "Number of records written", writes.clone());
        registry.register("merges", "Number of merges", merges.clone());
        tracked.set(files.len() as i64);

        Ok(Self {
            cfg,

            files: RwLock::new(files),
            writer: Mutex::new(None),
            next_index: AtomicU32::new(next_index),

            merging: Mutex::new(()),

            tracked,
            reads,
            writes,
            merges,
        })
    }

    /// Parse the index of a data file from its name (`<name>_<index>.dat`).
    fn parse_name(name: &str, file_name: &str) -> Option<u32> {
        file_name
            .strip_prefix(name)?
            .strip_prefix('_')?
            .strip_suffix(EXTENSION)?
            .strip_suffix('.')?
            .parse()
            .ok()
    }

    fn path(&self, index: u32) -> PathBuf {
        self.cfg
            .directory
            .join(format!("{}_{index:08}.{EXTENSION}", self.cfg.name))
    }

    fn files(&self) -> RwLockReadGuard<'_, BTreeMap<u32, Arc<DataFileReader>>> {
        self.files.read().unwrap_or_else(|err| err.into_inner())
    }

    fn files_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<u32, Arc<DataFileReader>>> {
        self.files.write().unwrap_or_else(|err| err.into_inner())
    }

    fn writer(&self) -> MutexGuard<'_, Option<Writer>> {
        self.writer.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Create (and register) a new, empty file.
    fn create(&self) -> Result<Arc<DataFileReader>, Error> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        if index >= MAX_FILES {
            return Err(Error::FileIndexExhausted);
        }
        let file = Arc::new(DataFileReader::create(index, self.path(index))?);
        self.files_mut().insert(index, file.clone());
        self.tracked.inc();
        Ok(file)
    }

    /// Unregister and remove `file` from disk.
    fn remove(&self, file: &DataFileReader) -> Result<(), Error> {
        if self.files_mut().remove(&file.index()).is_some() {
            self.tracked.dec();
        }
        file.remove()
    }

    /// Returns all completed files, oldest first.
    fn completed(&self) -> Vec<Arc<DataFileReader>> {
        let mut files: Vec<_> = self
            .files()
            .values()
            .filter(|file| file.metadata().is_some())
            .cloned()
            .collect();
        files.sort_by_key(|file| file.order());
        files
    }

    /// Number of files (including one being written).
    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the latest record of every key (within the valid range of the newest file) in
    /// `inputs` into `output`, returning the moves performed.
    fn copy_latest(
        output: &DataFileReader,
        inputs: &[Arc<DataFileReader>],
        min_valid_key: i64,
        max_valid_key: i64,
    ) -> Result<(Vec<Move>, u64), Error> {
        let mut moves = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = 0;
        for input in inputs {
            // Find the latest record of each key in this file
            let mut latest = HashMap::new();
            input.for_each_record(|key, record, _| {
                if (min_valid_key..=max_valid_key).contains(&key) && !seen.contains(&key) {
                    latest.insert(key, record);
                }
                Ok(())
            })?;

            // Copy those records (preserving the order they were written in)
            input.for_each_record(|key, record, data| {
                if latest.get(&key) != Some(&record) {
                    return Ok(());
                }
                if offset + (RECORD_HEADER_SIZE + data.len()) as u64 > MAX_OFFSET {
                    return Err(Error::FileFull(output.index()));
                }
                let written = output.append(offset, key, data)?;
                moves.push(Move {
                    key,
                    old: location(input.index(), record),
                    new: location(output.index(), offset),
                });
                offset += written;
                Ok(())
            })?;
            seen.extend(latest.into_keys());
        }
        Ok((moves, offset))
    }

    /// Close the collection (removing nothing).
    ///
    /// An active write session is abandoned (the incomplete file is removed at the next `init`).
    pub fn close(self) -> Result<(), Error> {
        if let Some(writer) = self.writer().take() {
            warn!(index = writer.file.index(), "closing with active write session");
        }
        sync_dir(&self.cfg.directory)?;
        Ok(())
    }

    /// Remove all files owned by the collection.
    pub fn destroy(self) -> Result<(), Error> {
        self.writer().take();
        let files = std::mem::take(&mut *self.files_mut());
        for file in files.values() {
            file.remove()?;
        }
        self.tracked.set(0);
        match fs::remove_dir(&self.cfg.directory) {
            Ok(()) => {}
            Err(err) => debug!(error = %err, "data file directory not removed"),
        }
        Ok(())
    }
}

impl Collection for DataFileCollection {
    type File = Arc<DataFileReader>;

    fn start_writing(&self) -> Result<(), Error> {
        let mut writer = self.writer();
        if writer.is_some() {
            return Err(Error::WriteSessionActive);
        }
        let file = self.create()?;
        debug!(index = file.index(), "started write session");
        *writer = Some(Writer {
            file,
            offset: 0,
            items: 0,
        });
        Ok(())
    }

    fn store_data(&self, key: i64, data: &[u8]) -> Result<i64, Error> {
        let mut writer = self.writer();
        let writer = writer.as_mut().ok_or(Error::NoWriteSession)?;
        if writer.offset + (RECORD_HEADER_SIZE + data.len()) as u64 > MAX_OFFSET {
            return Err(Error::FileFull(writer.file.index()));
        }
        let location = location(writer.file.index(), writer.offset);
        writer.offset += writer.file.append(writer.offset, key, data)?;
        writer.items += 1;
        self.writes.inc();
        trace!(key, location, "stored record");
        Ok(location)
    }

    fn end_writing(&self, min_valid_key: i64, max_valid_key: i64) -> Result<(), Error> {
        let Writer {
            file,
            offset,
            items,
        } = self.writer().take().ok_or(Error::NoWriteSession)?;
        let generation = file.index() as u64;
        file.complete(Metadata {
            index: file.index(),
            generation,
            merged_from: generation,
            created_millis: 0,
            min_valid_key,
            max_valid_key,
            item_count: items,
            data_size: offset,
            is_merge: false,
        })?;
        sync_dir(&self.cfg.directory)?;
        debug!(index = file.index(), items, size = file.size(), "completed write session");
        Ok(())
    }

    fn read_data(&self, location: i64, buf: &mut [u8], mode: DataToRead) -> Result<usize, Error> {
        let index = file_index_of(location).ok_or(Error::InvalidLocation(location))?;
        let file = self
            .files()
            .get(&index)
            .cloned()
            .ok_or(Error::FileMissing(index))?;
        let read = file.read(offset_of(location), buf, mode)?;
        self.reads.inc();
        Ok(read)
    }

    fn fully_written_files(&self, max_total_size: u64) -> Vec<Self::File> {
        let mut total = 0u64;
        self.completed()
            .into_iter()
            .take_while(|file| {
                total = total.saturating_add(file.size());
                total <= max_total_size
            })
            .collect()
    }

    fn merge(&self, moves: &mut dyn FnMut(&[Move]), files: Vec<Self::File>) -> Result<(), Error> {
        let _merging = self.merging.lock().unwrap_or_else(|err| err.into_inner());

        // Ignore files that were already merged (or never completed)
        let mut inputs: Vec<_> = {
            let registered = self.files();
            files
                .into_iter()
                .filter(|file| {
                    file.metadata().is_some()
                        && registered
                            .get(&file.index())
                            .is_some_and(|registered| Arc::ptr_eq(registered, file))
                })
                .collect()
        };
        if inputs.is_empty() {
            return Ok(());
        }

        // Skipping a file would order older data after it (and cover it at the next init)
        let completed = self.completed();
        let mut positions: Vec<_> = inputs
            .iter()
            .filter_map(|input| {
                completed
                    .iter()
                    .position(|file| file.index() == input.index())
            })
            .collect();
        positions.sort_unstable();
        positions.dedup();
        if positions.len() != inputs.len()
            || positions
                .iter()
                .enumerate()
                .any(|(offset, &position)| position != positions[0] + offset)
        {
            return Err(Error::NonContiguousMerge);
        }

        inputs.sort_by_key(|file| std::cmp::Reverse(file.order()));
        let Some(newest) = inputs[0].metadata().cloned() else {
            return Ok(());
        };
        let merged_from = inputs
            .iter()
            .filter_map(|file| file.metadata().map(|metadata| metadata.merged_from))
            .min()
            .unwrap_or(newest.merged_from);

        // Copy surviving records into a new file
        let output = self.create()?;
        debug!(
            index = output.index(),
            inputs = inputs.len(),
            generation = newest.generation,
            "merging data files"
        );
        let copied =
            Self::copy_latest(&output, &inputs, newest.min_valid_key, newest.max_valid_key)
                .and_then(|(moves, data_size)| {
                    if moves.is_empty() {
                        return Ok(moves);
                    }
                    output.complete(Metadata {
                        index: output.index(),
                        generation: newest.generation,
                        merged_from,
                        created_millis: 0,
                        min_valid_key: newest.min_valid_key,
                        max_valid_key: newest.max_valid_key,
                        item_count: moves.len() as u64,
                        data_size,
                        is_merge: true,
                    })?;
                    Ok(moves)
                });
        let copied = match copied {
            Ok(copied) => copied,
            Err(err) => {
                self.remove(&output)?;
                return Err(err);
            }
        };
        if copied.is_empty() {
            self.remove(&output)?;
        } else {
            sync_dir(&self.cfg.directory)?;
        }

        // Publish the new locations before removing the old ones
        moves(&copied);
        for input in &inputs {
            self.remove(input)?;
        }
        sync_dir(&self.cfg.directory)?;
        self.merges.inc();
        debug!(
            index = output.index(),
            moved = copied.len(),
            size = align_to_page(output.metadata().map_or(0, |m| m.data_size)),
            removed = inputs.len(),
            "merged data files"
        );
        Ok(())
    }

    fn replay(&self, visitor: &mut dyn FnMut(i64, i64)) -> Result<(), Error> {
        for file in self.completed() {
            file.for_each_record(|key, offset, _| {
                visitor(key, location(file.index(), offset));
                Ok(())
            })?;
        }
        Ok(())
    }

    fn close(self) -> Result<(), Error> {
        DataFileCollection::close(self)
    }

    fn destroy(self) -> Result<(), Error> {
        DataFileCollection::destroy(self)
    }
}

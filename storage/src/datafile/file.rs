use super::{location, DataToRead, Error, PAGE_SIZE};
use bytes::{Buf, BufMut};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

/// Identifies a completed data file.
const FOOTER_MAGIC: u32 = 0x4441_5446;

/// Bytes of the footer covered by its checksum.
const FOOTER_DATA_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 8 + 8 + 8 + 8 + 1;

/// Set in the footer flags of files produced by a merge.
const FLAG_MERGE: u8 = 1;

/// Size of the header preceding the data of each record (key and data length).
pub(super) const RECORD_HEADER_SIZE: usize = 8 + 4;

/// Round `len` up to the next page boundary.
pub(super) fn align_to_page(len: u64) -> u64 {
    len.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

/// Syncs a directory to ensure directory entry changes are durable.
#[cfg(unix)]
pub(super) fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
pub(super) fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Description of a completed data file, persisted in its footer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// Index of the file in its collection (part of every location in the file).
    pub index: u32,
    /// Recency of the data in the file (higher is newer).
    pub generation: u64,
    /// Oldest generation folded into this file (equal to `generation` unless merged).
    pub merged_from: u64,
    /// Milliseconds since the Unix epoch at which the file was completed.
    pub created_millis: u64,
    pub min_valid_key: i64,
    pub max_valid_key: i64,
    pub item_count: u64,
    /// Bytes of records at the start of the file.
    pub data_size: u64,
    pub is_merge: bool,
}

impl Metadata {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(FOOTER_MAGIC);
        buf.put_u32(self.index);
        buf.put_u64(self.generation);
        buf.put_u64(self.merged_from);
        buf.put_u64(self.created_millis);
        buf.put_i64(self.min_valid_key);
        buf.put_i64(self.max_valid_key);
        buf.put_u64(self.item_count);
        buf.put_u64(self.data_size);
        buf.put_u8(if self.is_merge { FLAG_MERGE } else { 0 });
    }

    fn encode(&self) -> Vec<u8> {
        let mut page = Vec::with_capacity(PAGE_SIZE);
        self.write(&mut page);
        let crc = crc32fast::hash(&page);
        page.put_u32(crc);
        page.resize(PAGE_SIZE, 0);
        page
    }

    fn decode(page: &[u8]) -> Option<Self> {
        let stored = u32::from_be_bytes(
            page[FOOTER_DATA_SIZE..FOOTER_DATA_SIZE + 4]
                .try_into()
                .ok()?,
        );
        if crc32fast::hash(&page[..FOOTER_DATA_SIZE]) != stored {
            return None;
        }
        let mut buf = &page[..FOOTER_DATA_SIZE];
        if buf.get_u32() != FOOTER_MAGIC {
            return None;
        }
        Some(Self {
            index: buf.get_u32(),
            generation: buf.get_u64(),
            merged_from: buf.get_u64(),
            created_millis: buf.get_u64(),
            min_valid_key: buf.get_i64(),
            max_valid_key: buf.get_i64(),
            item_count: buf.get_u64(),
            data_size: buf.get_u64(),
            is_merge: buf.get_u8() & FLAG_MERGE != 0,
        })
    }

    /// Returns true if this file holds (a merge of) all data of a file with metadata `other`.
    pub(super) fn covers(&self, other: &Metadata) -> bool {
        self.index != other.index
            && self.is_merge
            && self.merged_from <= other.merged_from
            && other.generation <= self.generation
    }
}

/// A single data file of a collection.
///
/// The file is readable as soon as it is created (records are written before the file is
/// completed). Once completed, its footer is persisted and [DataFileReader::metadata] is set.
pub struct DataFileReader {
    index: u32,
    path: PathBuf,
    file: File,
    metadata: OnceLock<Metadata>,
}

impl DataFileReader {
    /// Create a new (empty) file to append records to.
    pub(super) fn create(index: u32, path: PathBuf) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            index,
            path,
            file,
            metadata: OnceLock::new(),
        })
    }

    /// Open an existing file, returning `None` if it was never completed.
    pub(super) fn open(index: u32, path: PathBuf) -> Result<Option<Self>, Error> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < PAGE_SIZE as u64 || len % PAGE_SIZE as u64 != 0 {
            return Ok(None);
        }
        let mut page = vec![0u8; PAGE_SIZE];
        read_at(&file, &mut page, len - PAGE_SIZE as u64)?;
        let Some(metadata) = Metadata::decode(&page) else {
            return Ok(None);
        };
        if metadata.index != index || align_to_page(metadata.data_size) != len - PAGE_SIZE as u64
        {
            return Ok(None);
        }
        Ok(Some(Self {
            index,
            path,
            file,
            metadata: OnceLock::from(metadata),
        }))
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the metadata of the file, if it has been completed.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.get()
    }

    /// Size of the file on disk (records, padding, and footer) once completed.
    pub fn size(&self) -> u64 {
        self.metadata()
            .map(|metadata| align_to_page(metadata.data_size) + PAGE_SIZE as u64)
            .unwrap_or(0)
    }

    /// Order in which the data of files must be applied (oldest first).
    pub(super) fn order(&self) -> (u64, bool, u32) {
        match self.metadata() {
            Some(metadata) => (metadata.generation, metadata.is_merge, self.index),
            None => (u64::MAX, true, self.index),
        }
    }

    /// Append a record at `offset`, returning the number of bytes written.
    pub(super) fn append(&self, offset: u64, key: i64, data: &[u8]) -> Result<u64, Error> {
        let len = u32::try_from(data.len()).map_err(|_| Error::RecordTooLarge(data.len()))?;
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + data.len());
        record.put_i64(key);
        record.put_u32(len);
        record.put_slice(data);
        write_at(&self.file, &record, offset)?;
        Ok(record.len() as u64)
    }

    /// Pad the records to a page boundary, persist the footer, and sync the file.
    pub(super) fn complete(&self, mut metadata: Metadata) -> Result<(), Error> {
        let footer_offset = align_to_page(metadata.data_size);
        metadata.created_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_millis() as u64)
            .unwrap_or(0);
        self.file.set_len(footer_offset)?;
        write_at(&self.file, &metadata.encode(), footer_offset)?;
        self.file.sync_all()?;
        let _ = self.metadata.set(metadata);
        Ok(())
    }

    /// Read (part of) the record at `offset` into `buf`, returning the number of bytes filled.
    pub(super) fn read(&self, offset: u64, buf: &mut [u8], mode: DataToRead) -> Result<usize, Error> {
        let corrupt = || Error::RecordCorrupt(location(self.index, offset));
        let mut header = [0u8; RECORD_HEADER_SIZE];
        read_at(&self.file, &mut header, offset).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => corrupt(),
            _ => err.into(),
        })?;
        let mut cursor = &header[..];
        let key = cursor.get_i64();
        let len = cursor.get_u32() as usize;
        if let Some(metadata) = self.metadata() {
            if offset + (RECORD_HEADER_SIZE + len) as u64 > metadata.data_size {
                return Err(corrupt());
            }
        }

        let (key_len, needed) = match mode {
            DataToRead::Key => (8, 8),
            DataToRead::Value => (0, len),
            DataToRead::KeyValue => (8, 8 + len),
        };
        if buf.len() < needed {
            return Err(Error::BufferTooSmall(needed, buf.len()));
        }
        buf[..key_len].copy_from_slice(&key.to_be_bytes()[..key_len]);
        if needed > key_len {
            read_at(
                &self.file,
                &mut buf[key_len..needed],
                offset + RECORD_HEADER_SIZE as u64,
            )
            .map_err(|err| match err.kind() {
                io::ErrorKind::UnexpectedEof => corrupt(),
                _ => err.into(),
            })?;
        }
        Ok(needed)
    }

    /// Visit every record of a completed file in the order it was written.
    ///
    /// The visitor receives the key, the offset, and the data of each record.
    pub(super) fn for_each_record(
        &self,
        mut visitor: impl FnMut(i64, u64, &[u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let Some(metadata) = self.metadata() else {
            return Ok(());
        };

        // Use a dedicated handle so the scan never moves the cursor of the shared handle
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file.take(metadata.data_size));
        let mut offset = 0;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        let mut data = Vec::new();
        for _ in 0..metadata.item_count {
            reader
                .read_exact(&mut header)
                .map_err(|_| Error::RecordCorrupt(location(self.index, offset)))?;
            let mut cursor = &header[..];
            let key = cursor.get_i64();
            let len = cursor.get_u32() as usize;
            data.resize(len, 0);
            reader
                .read_exact(&mut data)
                .map_err(|_| Error::RecordCorrupt(location(self.index, offset)))?;
            visitor(key, offset, &data)?;
            offset += (RECORD_HEADER_SIZE + len) as u64;
        }
        Ok(())
    }

    /// Remove the file from disk.
    ///
    /// Handles that are still held can keep reading the (unlinked) file.
    pub(super) fn remove(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

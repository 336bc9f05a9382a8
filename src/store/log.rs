//! File-backed subscription store.
//!
//! Layout of a store directory:
//!
//! ```text
//! <path>/MANIFEST        magic + store version + frame version
//! <path>/LOCK            advisory lock, held by one connection at a time
//! <path>/<table>.log     append-only frames, one per insert or delete
//! ```
//!
//! Frame format: magic (4) | version (1) | payload length (u32 LE) |
//! MessagePack payload | CRC32 of payload (u32 LE).
//!
//! A frame cut short at the end of a file (crash mid-append) is ignored and
//! overwritten by the next append. A short frame that cannot be a partial last
//! write, or a bad frame anywhere, is an error and leaves the file untouched.

use crate::error::{DirectoryError, Result};
use crate::store::{StoreConnection, SubscriptionStore};
use crate::types::{Filter, SubscriptionRecord};
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes opening every log frame.
const FRAME_MAGIC: &[u8; 4] = b"SUB\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// Frame header size: magic + version + payload length.
const FRAME_HEADER_SIZE: usize = 4 + 1 + 4;

/// Frame trailer size: checksum.
const FRAME_TRAILER_SIZE: usize = 4;

/// Largest payload a frame may carry.
const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Don't bother compacting tables with fewer dead frames than this.
const COMPACT_MIN_DEAD: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
enum LogEntry {
    Insert(SubscriptionRecord),
    Delete(Filter),
}

/// Format details recorded in `MANIFEST`.
#[derive(Debug, PartialEq, Eq)]
struct Manifest {
    store_version: u8,
    frame_version: u8,
}

impl Manifest {
    const MAGIC: &'static [u8; 4] = b"SWB\0";
    const FILE: &'static str = "MANIFEST";
    const STORE_VERSION: u8 = 2;

    fn current() -> Self {
        Self {
            store_version: Self::STORE_VERSION,
            frame_version: FRAME_VERSION,
        }
    }

    fn to_bytes(&self) -> [u8; 6] {
        let [m0, m1, m2, m3] = *Self::MAGIC;
        [m0, m1, m2, m3, self.store_version, self.frame_version]
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 6 || &bytes[..4] != Self::MAGIC {
            return Err(DirectoryError::InvalidFormat("Invalid store manifest".into()));
        }
        Ok(Self {
            store_version: bytes[4],
            frame_version: bytes[5],
        })
    }

    /// Write the current manifest into `dir`, replacing any previous one whole.
    fn install(dir: &Path) -> Result<()> {
        let tmp_path = dir.join("MANIFEST.tmp");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&Self::current().to_bytes())?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, dir.join(Self::FILE))?;
        Ok(())
    }

    /// Read the manifest in `dir` and check this build can use the store.
    fn verify(dir: &Path) -> Result<()> {
        let manifest = Self::from_bytes(&fs::read(dir.join(Self::FILE))?)?;
        if manifest != Self::current() {
            return Err(DirectoryError::InvalidFormat(format!(
                "Unsupported store format: store v{}, frames v{}",
                manifest.store_version, manifest.frame_version
            )));
        }
        Ok(())
    }
}

/// Append-only, checksummed store on the local filesystem.
pub struct LogStore {
    /// Store directory.
    path: PathBuf,

    /// Serializes connections within this process; the file lock covers other processes.
    local: Mutex<()>,
}

impl LogStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().join(Manifest::FILE).exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Create a new store.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        Manifest::install(&path)?;

        Ok(Self {
            path,
            local: Mutex::new(()),
        })
    }

    /// Open an existing store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Manifest::verify(&path)?;

        Ok(Self {
            path,
            local: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn table_path(&self, table: &str) -> Result<PathBuf> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(DirectoryError::InvalidTable(table.to_string()));
        }
        Ok(self.path.join(format!("{}.log", table)))
    }

    /// Like [`SubscriptionStore::open_connection`], but fails with
    /// [`DirectoryError::Locked`] instead of waiting for another connection
    /// to close.
    pub fn try_open_connection(&self) -> Result<Box<dyn StoreConnection + '_>> {
        let guard = self.local.try_lock().ok_or(DirectoryError::Locked)?;

        let lock_file = self.lock_file()?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| DirectoryError::Locked)?;

        Ok(self.connection(guard, lock_file))
    }

    fn lock_file(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.path.join("LOCK"))?)
    }

    fn connection<'a>(
        &'a self,
        guard: MutexGuard<'a, ()>,
        lock_file: File,
    ) -> Box<dyn StoreConnection + 'a> {
        Box::new(LogConnection {
            store: self,
            _guard: guard,
            lock_file,
            tables: HashMap::new(),
        })
    }
}

impl SubscriptionStore for LogStore {
    fn open_connection(&self) -> Result<Box<dyn StoreConnection + '_>> {
        let guard = self.local.lock();

        let lock_file = self.lock_file()?;
        lock_file.lock_exclusive()?;

        Ok(self.connection(guard, lock_file))
    }
}

/// Replayed contents of one table file.
struct TableState {
    rows: Vec<SubscriptionRecord>,
    /// Frames in the file, live or not.
    frames: usize,
    /// Length of the well-formed prefix of the file.
    valid_len: u64,
    /// Bytes of a partial last frame following the prefix.
    torn: u64,
}

impl TableState {
    fn dead_frames(&self) -> usize {
        self.frames - self.rows.len()
    }
}

/// A connection holding the store lock. Table contents are cached for its
/// lifetime, which is safe because nobody else can write while it is open.
struct LogConnection<'a> {
    store: &'a LogStore,
    _guard: MutexGuard<'a, ()>,
    lock_file: File,
    tables: HashMap<String, TableState>,
}

impl LogConnection<'_> {
    fn load(&mut self, table: &str) -> Result<(PathBuf, &mut TableState)> {
        let path = self.store.table_path(table)?;

        if !self.tables.contains_key(table) {
            let state = replay(&path)?;
            self.tables.insert(table.to_string(), state);
        }

        let state = self
            .tables
            .get_mut(table)
            .ok_or_else(|| DirectoryError::Storage(format!("table {} not loaded", table)))?;
        Ok((path, state))
    }
}

impl StoreConnection for LogConnection<'_> {
    fn count(&mut self, table: &str, filter: &Filter) -> Result<u64> {
        let (_, state) = self.load(table)?;
        Ok(state.rows.iter().filter(|r| filter.matches(r)).count() as u64)
    }

    fn insert(&mut self, table: &str, record: &SubscriptionRecord) -> Result<()> {
        let (path, state) = self.load(table)?;
        let entry = LogEntry::Insert(record.clone());
        append(&path, state, &entry)?;
        state.rows.push(record.clone());
        Ok(())
    }

    fn delete(&mut self, table: &str, filter: &Filter) -> Result<u64> {
        let (path, state) = self.load(table)?;

        let matching = state.rows.iter().filter(|r| filter.matches(r)).count();
        if matching == 0 {
            return Ok(0);
        }

        append(&path, state, &LogEntry::Delete(filter.clone()))?;
        state.rows.retain(|r| !filter.matches(r));

        if state.dead_frames() >= COMPACT_MIN_DEAD && state.dead_frames() > state.rows.len() {
            compact(&path, state)?;
        }

        Ok(matching as u64)
    }

    fn query(&mut self, table: &str, filter: &Filter) -> Result<Vec<SubscriptionRecord>> {
        let (_, state) = self.load(table)?;
        Ok(state.rows.iter().filter(|r| filter.matches(r)).cloned().collect())
    }

    fn query_all(&mut self, table: &str) -> Result<Vec<SubscriptionRecord>> {
        let (_, state) = self.load(table)?;
        Ok(state.rows.clone())
    }
}

impl Drop for LogConnection<'_> {
    fn drop(&mut self) {
        // Closing the handle releases the lock too; unlocking first keeps it prompt.
        let _ = self.lock_file.unlock();
    }
}

/// Read a table file and rebuild its rows.
fn replay(path: &Path) -> Result<TableState> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut rows: Vec<SubscriptionRecord> = Vec::new();
    let mut frames = 0;
    let mut offset = 0usize;

    while offset < bytes.len() {
        let Some((entry, size)) = decode_frame(&bytes[offset..])? else {
            // A crash mid-append can only cut the last frame short.
            if holds_complete_frame(&bytes[offset + 1..]) {
                return Err(DirectoryError::Corruption(format!(
                    "frame at offset {} of {} overruns the frames after it",
                    offset,
                    path.display()
                )));
            }
            tracing::warn!(
                path = %path.display(),
                offset,
                torn = bytes.len() - offset,
                "ignoring torn frame at end of log"
            );
            break;
        };

        match entry {
            LogEntry::Insert(record) => rows.push(record),
            LogEntry::Delete(filter) => rows.retain(|r| !filter.matches(r)),
        }
        frames += 1;
        offset += size;
    }

    Ok(TableState {
        rows,
        frames,
        valid_len: offset as u64,
        torn: (bytes.len() - offset) as u64,
    })
}

/// Append one frame after the valid prefix, dropping the torn tail replay found.
fn append(path: &Path, state: &mut TableState, entry: &LogEntry) -> Result<()> {
    let frame = encode_frame(entry)?;

    let mut file = OpenOptions::new().create(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len != state.valid_len + state.torn {
        return Err(DirectoryError::Corruption(format!(
            "{} is {} bytes, replay saw {}",
            path.display(),
            len,
            state.valid_len + state.torn
        )));
    }
    if state.torn > 0 {
        file.set_len(state.valid_len)?;
        state.torn = 0;
    }
    file.seek(SeekFrom::Start(state.valid_len))?;
    file.write_all(&frame)?;
    file.sync_data()?;

    state.valid_len += frame.len() as u64;
    state.frames += 1;
    Ok(())
}

/// Rewrite the table with one insert frame per live row.
fn compact(path: &Path, state: &mut TableState) -> Result<()> {
    let tmp_path = path.with_extension("log.tmp");

    let mut buf = Vec::new();
    for record in &state.rows {
        buf.extend_from_slice(&encode_frame(&LogEntry::Insert(record.clone()))?);
    }

    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(&buf)?;
    tmp.sync_all()?;
    fs::rename(&tmp_path, path)?;

    tracing::debug!(
        path = %path.display(),
        dropped = state.dead_frames(),
        live = state.rows.len(),
        "compacted subscription log"
    );

    state.frames = state.rows.len();
    state.valid_len = buf.len() as u64;
    state.torn = 0;
    Ok(())
}

fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(entry)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(DirectoryError::Serialization(format!(
            "frame payload of {} bytes exceeds {}",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE);
    frame.extend_from_slice(FRAME_MAGIC);
    frame.push(FRAME_VERSION);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(frame)
}

/// Decode the frame at the start of `buf`.
///
/// Returns `None` if `buf` ends before the frame does.
fn decode_frame(buf: &[u8]) -> Result<Option<(LogEntry, usize)>> {
    let magic_len = buf.len().min(FRAME_MAGIC.len());
    if buf[..magic_len] != FRAME_MAGIC[..magic_len] {
        return Err(DirectoryError::InvalidFormat("Invalid frame magic".into()));
    }
    if buf.len() > 4 && buf[4] != FRAME_VERSION {
        return Err(DirectoryError::InvalidFormat(format!(
            "Unsupported frame version: {}",
            buf[4]
        )));
    }
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[5..9]);
    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(DirectoryError::Corruption(format!(
            "frame claims {} payload bytes, limit is {}",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let size = FRAME_HEADER_SIZE + payload_len + FRAME_TRAILER_SIZE;
    if buf.len() < size {
        return Ok(None);
    }

    let payload = &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload_len];

    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&buf[FRAME_HEADER_SIZE + payload_len..size]);
    let stored_checksum = u32::from_le_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(payload);

    if stored_checksum != computed_checksum {
        return Err(DirectoryError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    let entry: LogEntry = rmp_serde::from_slice(payload)?;
    Ok(Some((entry, size)))
}

/// Whether a complete, checksum-valid frame starts anywhere in `buf`.
fn holds_complete_frame(buf: &[u8]) -> bool {
    (0..buf.len())
        .filter(|&i| buf[i..].starts_with(FRAME_MAGIC))
        .any(|i| matches!(decode_frame(&buf[i..]), Ok(Some(_))))
}

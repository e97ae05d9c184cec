//! Session persistence: home DC, per-DC auth keys and salts, update state.
//!
//! The on-disk format is a small binary record:
//!
//! ```text
//! "TGCS" | version:u16 | home_dc:i32 | user | update state | dcs | sha256(everything before)
//! ```
//!
//! All integers are little-endian. A file whose checksum does not match, or
//! that ends early, is reported as [`io::ErrorKind::InvalidData`] and never
//! partially loaded.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::locked;

const MAGIC: &[u8; 4] = b"TGCS";
const VERSION: u16 = 1;
const CHECKSUM_LEN: usize = 32;
/// Salts older than the current one kept across restarts.
const MAX_SAVED_SALTS: usize = 8;

/// Bootstrap DC address table.
pub fn default_dc_addresses() -> BTreeMap<i32, String> {
    [
        (1, "149.154.175.53:443"),
        (2, "149.154.167.51:443"),
        (3, "149.154.175.100:443"),
        (4, "149.154.167.91:443"),
        (5, "91.108.56.130:443"),
    ]
    .into_iter()
    .map(|(id, addr)| (id, addr.to_string()))
    .collect()
}

/// Common update sequence state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UpdateState {
    pub pts: i32,
    pub qts: i32,
    pub date: i32,
    pub seq: i32,
}

/// What is known about one data center.
#[derive(Clone, PartialEq)]
pub struct DcEntry {
    pub dc_id: i32,
    pub addr: String,
    pub auth_key: Option<[u8; 256]>,
    pub salt: i64,
    /// Recently superseded salts, newest first.
    pub previous_salts: Vec<i64>,
    /// Server time minus local time, in seconds.
    pub time_offset: i32,
}

impl DcEntry {
    pub fn new(dc_id: i32, addr: impl Into<String>) -> Self {
        Self { dc_id, addr: addr.into(), auth_key: None, salt: 0, previous_salts: Vec::new(), time_offset: 0 }
    }
}

impl fmt::Debug for DcEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DcEntry")
            .field("dc_id", &self.dc_id)
            .field("addr", &self.addr)
            .field("auth_key", &self.auth_key.map(|_| "<256 bytes>"))
            .field("salt", &self.salt)
            .field("previous_salts", &self.previous_salts)
            .field("time_offset", &self.time_offset)
            .finish()
    }
}

/// Everything persisted between runs.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionData {
    pub home_dc_id: i32,
    pub dcs: Vec<DcEntry>,
    pub update_state: Option<UpdateState>,
    /// Id of the signed-in account, once known.
    pub user_id: Option<i64>,
}

impl SessionData {
    pub fn new(home_dc_id: i32, addresses: &BTreeMap<i32, String>) -> Self {
        Self {
            home_dc_id,
            dcs: addresses.iter().map(|(&id, addr)| DcEntry::new(id, addr.clone())).collect(),
            update_state: None,
            user_id: None,
        }
    }

    pub fn dc(&self, dc_id: i32) -> Option<&DcEntry> {
        self.dcs.iter().find(|d| d.dc_id == dc_id)
    }

    /// The entry for `dc_id`, created from `fallback_addr` if missing.
    pub fn dc_mut(&mut self, dc_id: i32, fallback_addr: impl FnOnce() -> Option<String>) -> Option<&mut DcEntry> {
        match self.dcs.iter().position(|d| d.dc_id == dc_id) {
            Some(i) => Some(&mut self.dcs[i]),
            None => {
                self.dcs.push(DcEntry::new(dc_id, fallback_addr()?));
                self.dcs.last_mut()
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(512);
        b.extend_from_slice(MAGIC);
        b.extend_from_slice(&VERSION.to_le_bytes());
        b.extend_from_slice(&self.home_dc_id.to_le_bytes());

        match self.user_id {
            Some(id) => {
                b.push(1);
                b.extend_from_slice(&id.to_le_bytes());
            }
            None => b.push(0),
        }
        match &self.update_state {
            Some(s) => {
                b.push(1);
                for v in [s.pts, s.qts, s.date, s.seq] {
                    b.extend_from_slice(&v.to_le_bytes());
                }
            }
            None => b.push(0),
        }

        b.extend_from_slice(&(self.dcs.len() as u16).to_le_bytes());
        for d in &self.dcs {
            b.extend_from_slice(&d.dc_id.to_le_bytes());
            let addr = d.addr.as_bytes();
            b.extend_from_slice(&(addr.len() as u16).to_le_bytes());
            b.extend_from_slice(addr);
            match &d.auth_key {
                Some(k) => {
                    b.push(1);
                    b.extend_from_slice(k);
                }
                None => b.push(0),
            }
            b.extend_from_slice(&d.salt.to_le_bytes());
            let previous = &d.previous_salts[..d.previous_salts.len().min(MAX_SAVED_SALTS)];
            b.push(previous.len() as u8);
            for salt in previous {
                b.extend_from_slice(&salt.to_le_bytes());
            }
            b.extend_from_slice(&d.time_offset.to_le_bytes());
        }

        let checksum = Sha256::digest(&b);
        b.extend_from_slice(&checksum);
        b
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < MAGIC.len() + 2 + CHECKSUM_LEN {
            return Err(invalid("session file truncated"));
        }
        let (body, checksum) = buf.split_at(buf.len() - CHECKSUM_LEN);
        if Sha256::digest(body).as_slice() != checksum {
            return Err(invalid("session checksum mismatch"));
        }

        let mut r = Reader { buf: body, pos: 0 };
        if r.take(4)? != MAGIC {
            return Err(invalid("not a session file"));
        }
        let version = r.u16()?;
        if version != VERSION {
            return Err(invalid(format!("unsupported session version {version}")));
        }

        let home_dc_id = r.i32()?;
        let user_id = if r.flag()? { Some(r.i64()?) } else { None };
        let update_state = if r.flag()? {
            Some(UpdateState { pts: r.i32()?, qts: r.i32()?, date: r.i32()?, seq: r.i32()? })
        } else {
            None
        };

        let count = r.u16()? as usize;
        let mut dcs = Vec::with_capacity(count);
        for _ in 0..count {
            let dc_id = r.i32()?;
            let len = r.u16()? as usize;
            let addr = String::from_utf8(r.take(len)?.to_vec()).map_err(|_| invalid("address is not UTF-8"))?;
            let auth_key = if r.flag()? {
                let mut key = [0u8; 256];
                key.copy_from_slice(r.take(256)?);
                Some(key)
            } else {
                None
            };
            let salt = r.i64()?;
            let n = r.take(1)?[0] as usize;
            let previous_salts = (0..n).map(|_| r.i64()).collect::<io::Result<_>>()?;
            let time_offset = r.i32()?;
            dcs.push(DcEntry { dc_id, addr, auth_key, salt, previous_salts, time_offset });
        }

        if r.pos != body.len() {
            return Err(invalid("trailing bytes in session file"));
        }
        Ok(Self { home_dc_id, dcs, update_state, user_id })
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len()).ok_or_else(|| invalid("session file truncated"))?;
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn flag(&mut self) -> io::Result<bool> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(invalid(format!("bad presence marker {other}"))),
        }
    }

    fn u16(&mut self) -> io::Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn i32(&mut self) -> io::Result<i32> {
        self.array().map(i32::from_le_bytes)
    }

    fn i64(&mut self) -> io::Result<i64> {
        self.array().map(i64::from_le_bytes)
    }
}

// ─── Stores ───────────────────────────────────────────────────────────────────

/// Where sessions are kept between runs.
///
/// `save` must be atomic: after a crash the store holds either the previous
/// or the new session, never a mix.
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` if nothing was saved yet.
    fn load(&self) -> io::Result<Option<SessionData>>;
    fn save(&self, session: &SessionData) -> io::Result<()>;
    fn delete(&self) -> io::Result<()>;
    /// Human-readable name for logs.
    fn name(&self) -> &str;
}

/// Binary session file, replaced atomically on every save.
pub struct FileSessionStore {
    path: PathBuf,
    name: String,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> io::Result<Option<SessionData>> {
        match fs::read(&self.path) {
            Ok(buf) => SessionData::decode(&buf).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, session: &SessionData) -> io::Result<()> {
        let tmp = self.tmp_path();
        {
            let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
            file.write_all(&session.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path)
    }

    fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => sync_parent(&self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent(_: &Path) -> io::Result<()> {
    Ok(())
}

/// Non-persistent store, useful for tests and throwaway clients.
#[derive(Default)]
pub struct MemorySessionStore {
    data: Mutex<Option<SessionData>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: SessionData) -> Self {
        Self { data: Mutex::new(Some(session)) }
    }

    /// The last saved session.
    pub fn snapshot(&self) -> Option<SessionData> {
        locked(&self.data).clone()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> io::Result<Option<SessionData>> {
        Ok(locked(&self.data).clone())
    }

    fn save(&self, session: &SessionData) -> io::Result<()> {
        *locked(&self.data) = Some(session.clone());
        Ok(())
    }

    fn delete(&self) -> io::Result<()> {
        *locked(&self.data) = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ─── SessionHandle ────────────────────────────────────────────────────────────

/// The live session shared by the client's tasks. Every change is written
/// through to the store.
///
/// Each change gets a version under the data lock; the store only ever
/// receives versions newer than the last one written, so a slow write of an
/// older snapshot cannot replace a newer one.
pub(crate) struct SessionHandle {
    data: Mutex<SessionData>,
    version: AtomicU64,
    store: Arc<dyn SessionStore>,
    written: Mutex<Written>,
}

#[derive(Default)]
struct Written {
    version: u64,
    deleted: bool,
}

impl SessionHandle {
    pub fn new(data: SessionData, store: Arc<dyn SessionStore>) -> Self {
        Self { data: Mutex::new(data), version: AtomicU64::new(0), store, written: Mutex::default() }
    }

    pub fn snapshot(&self) -> SessionData {
        locked(&self.data).clone()
    }

    pub fn read<T>(&self, f: impl FnOnce(&SessionData) -> T) -> T {
        f(&locked(&self.data))
    }

    fn apply<T>(&self, f: impl FnOnce(&mut SessionData) -> T) -> (T, u64, SessionData) {
        let mut data = locked(&self.data);
        let out = f(&mut data);
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        (out, version, data.clone())
    }

    fn write(&self, version: u64, snapshot: &SessionData) -> io::Result<()> {
        let mut written = locked(&self.written);
        if written.deleted || written.version >= version {
            return Ok(());
        }
        self.store.save(snapshot)?;
        written.version = version;
        Ok(())
    }

    /// Apply `f` and persist the result. After [`delete`](Self::delete) the
    /// change is kept in memory only.
    pub fn update<T>(&self, f: impl FnOnce(&mut SessionData) -> T) -> io::Result<T> {
        let (out, version, snapshot) = self.apply(f);
        self.write(version, &snapshot)?;
        Ok(out)
    }

    /// Apply `f` now and persist from the blocking pool. Bursts of changes
    /// collapse into the newest snapshot; failures are logged.
    pub fn update_in_background(self: &Arc<Self>, f: impl FnOnce(&mut SessionData)) {
        let ((), version, snapshot) = self.apply(f);
        let handle = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = handle.write(version, &snapshot) {
                tracing::warn!("[tgcore] failed to save session: {e}");
            }
        });
    }

    /// Persist the current state as is.
    pub fn flush(&self) -> io::Result<()> {
        self.update(|_| ())
    }

    pub fn delete(&self) -> io::Result<()> {
        let mut written = locked(&self.written);
        written.deleted = true;
        self.store.delete()
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }
}

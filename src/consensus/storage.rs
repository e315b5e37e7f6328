//! Durable substrate for the consensus engine.
//!
//! `consensus.db` is one crash-safe file: a fixed-capacity metadata block
//! (hard state, configuration, peer registry) followed by length-framed
//! log entries. A `MemStorage` cache fronts the file for reads; every
//! mutation writes through and fsyncs before the engine is allowed to
//! act on it. In particular, term and vote reach disk before any vote
//! response leaves the node.
//!
//! `snapshots/` holds materialized state-machine snapshots, rotated to a
//! configured retention count. The engine serves the latest one to peers
//! that have fallen behind the compacted log.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage};
use serde_derive::{Deserialize, Serialize};

use crate::error::NodeError;

const MAGIC: u32 = 0x6e75_6264;
const FORMAT_VERSION: u32 = 1;
/// Bytes reserved for the metadata block between the file header and the
/// first entry frame.
const META_CAPACITY: u64 = 4096;
const DATA_OFFSET: u64 = 8 + META_CAPACITY;

/// Everything in `consensus.db` besides the entry frames.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaBlock {
    /// eraftpb.HardState bytes.
    hard_state: Vec<u8>,
    /// eraftpb.ConfState bytes.
    conf_state: Vec<u8>,
    /// Raft id to node name. Addresses derive from names, so the name is
    /// all a node ever needs to reach a peer.
    peers: Vec<(u64, String)>,
}

pub struct LogStore {
    cache: MemStorage,
    file: File,
    path: PathBuf,
    meta: MetaBlock,
    /// Entry index to frame offset, for conflict truncation.
    positions: BTreeMap<u64, u64>,
    /// Last materialized snapshot, served to lagging peers.
    latest_snapshot: Snapshot,
}

impl LogStore {
    /// Opens or creates `consensus.db`, recovering the cache from the
    /// given snapshot (if any) plus the surviving entry frames. A torn
    /// tail from a crash mid-append is cut off.
    pub fn open(path: &Path, restored: Option<Snapshot>) -> Result<LogStore, NodeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| NodeError::fatal("couldn't open consensus.db", e))?;
        let len = file
            .metadata()
            .map_err(|e| NodeError::fatal("couldn't stat consensus.db", e))?
            .len();

        let mut store = LogStore {
            cache: MemStorage::new(),
            file,
            path: path.to_path_buf(),
            meta: MetaBlock::default(),
            positions: BTreeMap::new(),
            latest_snapshot: Snapshot::default(),
        };

        if len < DATA_OFFSET {
            if len > 0 {
                warn!("consensus.db shorter than its header, reinitializing");
            }
            store
                .file
                .set_len(0)
                .map_err(|e| NodeError::fatal("couldn't reset consensus.db", e))?;
            store.write_header()?;
            store.write_meta()?;
            // Reserve the metadata region so frames always start at the
            // same offset.
            store
                .file
                .set_len(DATA_OFFSET)
                .map_err(|e| NodeError::fatal("couldn't reserve metadata region", e))?;
        } else {
            store.read_header()?;
            store.read_meta()?;
        }

        if let Some(snap) = restored {
            if snap.get_metadata().index > 0 {
                store
                    .cache
                    .wl()
                    .apply_snapshot(snap.clone())
                    .map_err(|e| NodeError::fatal("couldn't load snapshot into log cache", e))?;
                store.latest_snapshot = snap;
            }
        }

        // The meta block's view of configuration and hard state may be
        // newer than the snapshot's.
        if !store.meta.conf_state.is_empty() {
            let cs = ConfState::parse_from_bytes(&store.meta.conf_state)
                .map_err(|e| NodeError::fatal("couldn't decode persisted conf state", e))?;
            store.cache.wl().set_conf_state(cs);
        }
        let snap_index = store.latest_snapshot.get_metadata().index;
        if !store.meta.hard_state.is_empty() {
            let mut hs = HardState::parse_from_bytes(&store.meta.hard_state)
                .map_err(|e| NodeError::fatal("couldn't decode persisted hard state", e))?;
            if hs.commit < snap_index {
                hs.set_commit(snap_index);
            }
            store.cache.wl().set_hardstate(hs);
        }

        store.replay()?;

        // A commit index past the recovered tail cannot be honored; the
        // leader re-advances it.
        let last = store.last_index_fatal()?;
        {
            let mut core = store.cache.wl();
            if core.hard_state().commit > last {
                core.mut_hard_state().set_commit(last);
            }
        }

        Ok(store)
    }

    /// Scans entry frames into the cache. Frames behind the snapshot base
    /// (an interrupted compaction) trigger a rewrite; a torn tail is
    /// truncated.
    fn replay(&mut self) -> Result<(), NodeError> {
        let file_len = self
            .file
            .metadata()
            .map_err(|e| NodeError::fatal("couldn't stat consensus.db", e))?
            .len();
        self.file
            .seek(SeekFrom::Start(DATA_OFFSET))
            .map_err(|e| NodeError::fatal("couldn't seek consensus.db", e))?;

        let mut frames: BTreeMap<u64, (u64, Entry)> = BTreeMap::new();
        let mut pos = DATA_OFFSET;
        let mut valid_until = DATA_OFFSET;
        loop {
            if pos + 4 > file_len {
                break;
            }
            let mut len_buf = [0u8; 4];
            if self.file.read_exact(&mut len_buf).is_err() {
                break;
            }
            let frame_len = u32::from_le_bytes(len_buf) as u64;
            if pos + 4 + frame_len > file_len {
                break;
            }
            let mut frame = vec![0u8; frame_len as usize];
            if self.file.read_exact(&mut frame).is_err() {
                break;
            }
            let entry = match Entry::parse_from_bytes(&frame) {
                Ok(e) => e,
                Err(_) => break,
            };
            frames.insert(entry.index, (pos, entry));
            pos += 4 + frame_len;
            valid_until = pos;
        }
        if valid_until < file_len {
            warn!("truncating torn tail of consensus.db at offset {valid_until}");
            self.file
                .set_len(valid_until)
                .map_err(|e| NodeError::fatal("couldn't truncate consensus.db", e))?;
        }

        let first_valid = self
            .cache
            .first_index()
            .map_err(|e| NodeError::fatal("couldn't read log cache", e))?;
        let mut expected = self.last_index_fatal()? + 1;
        let mut run = Vec::new();
        let mut needs_rewrite = false;
        for (&idx, (pos, entry)) in &frames {
            if idx < first_valid {
                needs_rewrite = true;
                continue;
            }
            if idx == expected {
                run.push(entry.clone());
                self.positions.insert(idx, *pos);
                expected += 1;
            } else {
                // A gap means the frames past it are unreachable.
                needs_rewrite = true;
                break;
            }
        }
        if !run.is_empty() {
            self.cache
                .wl()
                .append(&run)
                .map_err(|e| NodeError::fatal("couldn't rebuild log cache", e))?;
        }
        if needs_rewrite {
            self.rewrite()?;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), NodeError> {
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&MAGIC.to_le_bytes()))
            .and_then(|_| self.file.write_all(&FORMAT_VERSION.to_le_bytes()))
            .map_err(|e| NodeError::fatal("couldn't write consensus.db header", e))
    }

    fn read_header(&mut self) -> Result<(), NodeError> {
        let mut buf = [0u8; 8];
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_exact(&mut buf))
            .map_err(|e| NodeError::fatal("couldn't read consensus.db header", e))?;
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if magic != MAGIC {
            return Err(NodeError::Fatal("not a consensus.db file".to_string()));
        }
        if version != FORMAT_VERSION {
            return Err(NodeError::Fatal(format!(
                "unsupported consensus.db version {version}"
            )));
        }
        Ok(())
    }

    fn write_meta(&mut self) -> Result<(), NodeError> {
        let buf =
            bincode::serialize(&self.meta).map_err(|e| NodeError::fatal("couldn't encode metadata", e))?;
        if buf.len() as u64 + 4 > META_CAPACITY {
            return Err(NodeError::Fatal(
                "consensus.db metadata block overflow".to_string(),
            ));
        }
        self.file
            .seek(SeekFrom::Start(8))
            .and_then(|_| self.file.write_all(&(buf.len() as u32).to_le_bytes()))
            .and_then(|_| self.file.write_all(&buf))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| NodeError::fatal("couldn't persist metadata", e))
    }

    fn read_meta(&mut self) -> Result<(), NodeError> {
        let mut len_buf = [0u8; 4];
        self.file
            .seek(SeekFrom::Start(8))
            .and_then(|_| self.file.read_exact(&mut len_buf))
            .map_err(|e| NodeError::fatal("couldn't read metadata", e))?;
        let len = u32::from_le_bytes(len_buf) as u64;
        if len + 4 > META_CAPACITY {
            return Err(NodeError::Fatal("malformed metadata block".to_string()));
        }
        let mut buf = vec![0u8; len as usize];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| NodeError::fatal("couldn't read metadata", e))?;
        self.meta = bincode::deserialize(&buf)
            .map_err(|e| NodeError::fatal("couldn't decode metadata", e))?;
        Ok(())
    }

    fn last_index_fatal(&self) -> Result<u64, NodeError> {
        self.cache
            .last_index()
            .map_err(|e| NodeError::fatal("couldn't read log cache", e))
    }

    /// Appends entries to the cache and the file. A conflicting suffix
    /// from a deposed leader is cut before the new frames land; the write
    /// is fsynced before returning.
    pub fn append(&mut self, entries: &[Entry]) -> Result<(), NodeError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.cache
            .wl()
            .append(entries)
            .map_err(|e| NodeError::fatal("couldn't append to log cache", e))?;

        let first = entries[0].index;
        if let Some((_, &cut)) = self.positions.range(first..).next() {
            self.file
                .set_len(cut)
                .map_err(|e| NodeError::fatal("couldn't truncate conflicting log suffix", e))?;
            self.positions.split_off(&first);
        }

        let mut pos = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| NodeError::fatal("couldn't seek consensus.db", e))?;
        for entry in entries {
            let bytes = entry
                .write_to_bytes()
                .map_err(|e| NodeError::fatal("couldn't encode log entry", e))?;
            self.file
                .write_all(&(bytes.len() as u32).to_le_bytes())
                .and_then(|_| self.file.write_all(&bytes))
                .map_err(|e| NodeError::fatal("couldn't append to consensus.db", e))?;
            self.positions.insert(entry.index, pos);
            pos += 4 + bytes.len() as u64;
        }
        self.file
            .sync_data()
            .map_err(|e| NodeError::fatal("couldn't sync consensus.db", e))
    }

    /// Persists the hard state. Must complete before the ready step that
    /// produced it sends any message.
    pub fn set_hard_state(&mut self, hs: &HardState) -> Result<(), NodeError> {
        self.cache.wl().set_hardstate(hs.clone());
        self.meta.hard_state = hs
            .write_to_bytes()
            .map_err(|e| NodeError::fatal("couldn't encode hard state", e))?;
        self.write_meta()
    }

    /// Advances the in-memory commit index. The commit position recovers
    /// from the leader after a restart, so this does not fsync.
    pub fn set_commit(&mut self, commit: u64) {
        let mut core = self.cache.wl();
        if commit > core.hard_state().commit {
            core.mut_hard_state().set_commit(commit);
        }
    }

    /// Raises the commit index to cover entries the state machine already
    /// holds, after a restart where the fsynced commit lagged the applied
    /// position.
    pub fn align_commit(&mut self, applied: u64) -> Result<(), NodeError> {
        let last = self.last_index_fatal()?;
        let target = applied.min(last);
        let mut core = self.cache.wl();
        if core.hard_state().commit < target {
            core.mut_hard_state().set_commit(target);
        }
        Ok(())
    }

    pub fn set_conf_state(&mut self, cs: ConfState) -> Result<(), NodeError> {
        self.meta.conf_state = cs
            .write_to_bytes()
            .map_err(|e| NodeError::fatal("couldn't encode conf state", e))?;
        self.cache.wl().set_conf_state(cs);
        self.write_meta()
    }

    pub fn register_peer(&mut self, ord: u64, name: &str) -> Result<(), NodeError> {
        if self.meta.peers.iter().any(|(o, n)| *o == ord && n == name) {
            return Ok(());
        }
        self.meta.peers.retain(|(o, _)| *o != ord);
        self.meta.peers.push((ord, name.to_string()));
        self.write_meta()
    }

    pub fn peer_name(&self, ord: u64) -> Option<&str> {
        self.meta
            .peers
            .iter()
            .find(|(o, _)| *o == ord)
            .map(|(_, n)| n.as_str())
    }

    pub fn voters(&self) -> Vec<u64> {
        self.cache
            .initial_state()
            .map(|s| s.conf_state.voters.clone())
            .unwrap_or_default()
    }

    /// Current voter set as `(raft id, node name)` pairs.
    pub fn servers(&self) -> Vec<(u64, String)> {
        self.voters()
            .into_iter()
            .map(|ord| {
                let name = self
                    .peer_name(ord)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("node{ord}"));
                (ord, name)
            })
            .collect()
    }

    /// Writes the initial configuration as a synthetic snapshot at
    /// `(index 1, term 1)`. Returns `None` when a configuration already
    /// exists; the caller persists the returned snapshot so a restart
    /// recovers the same state.
    pub fn bootstrap(&mut self, servers: &[(u64, String)]) -> Result<Option<Snapshot>, NodeError> {
        if !self.voters().is_empty() {
            return Ok(None);
        }
        let mut snapshot = Snapshot::default();
        {
            let meta = snapshot.mut_metadata();
            meta.index = 1;
            meta.term = 1;
            meta.mut_conf_state().voters = servers.iter().map(|(ord, _)| *ord).collect();
        }
        self.cache
            .wl()
            .apply_snapshot(snapshot.clone())
            .map_err(|e| NodeError::fatal("couldn't bootstrap log cache", e))?;
        self.latest_snapshot = snapshot.clone();
        self.meta.conf_state = snapshot
            .get_metadata()
            .get_conf_state()
            .write_to_bytes()
            .map_err(|e| NodeError::fatal("couldn't encode conf state", e))?;
        let hs = self.cache.rl().hard_state().clone();
        self.meta.hard_state = hs
            .write_to_bytes()
            .map_err(|e| NodeError::fatal("couldn't encode hard state", e))?;
        for (ord, name) in servers {
            self.meta.peers.retain(|(o, _)| o != ord);
            self.meta.peers.push((*ord, name.clone()));
        }
        self.write_meta()?;
        info!(
            "bootstrapped configuration with voters {:?}",
            servers.iter().map(|(_, n)| n.as_str()).collect::<Vec<_>>()
        );
        Ok(Some(snapshot))
    }

    /// Installs a snapshot received from the leader: the cache resets to
    /// its metadata and the now-obsolete log prefix is dropped.
    pub fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), NodeError> {
        self.cache
            .wl()
            .apply_snapshot(snapshot.clone())
            .map_err(|e| NodeError::transient("couldn't apply snapshot", e))?;
        self.latest_snapshot = snapshot.clone();
        self.meta.conf_state = snapshot
            .get_metadata()
            .get_conf_state()
            .write_to_bytes()
            .map_err(|e| NodeError::fatal("couldn't encode conf state", e))?;
        let hs = self.cache.rl().hard_state().clone();
        self.meta.hard_state = hs
            .write_to_bytes()
            .map_err(|e| NodeError::fatal("couldn't encode hard state", e))?;
        self.write_meta()?;
        self.rewrite()
    }

    /// Materializes a snapshot of the state machine at `applied` with the
    /// current term and configuration.
    pub fn build_snapshot(&mut self, applied: u64, data: Vec<u8>) -> Result<Snapshot, NodeError> {
        let mut snapshot = self
            .cache
            .snapshot(applied, 0)
            .map_err(|e| NodeError::transient("couldn't build snapshot", e))?;
        snapshot.set_data(data.into());
        self.latest_snapshot = snapshot.clone();
        Ok(snapshot)
    }

    /// Drops entries up to and including `to_index` from the cache and
    /// rewrites the file without them.
    pub fn compact(&mut self, to_index: u64) -> Result<(), NodeError> {
        self.cache
            .wl()
            .compact(to_index)
            .map_err(|e| NodeError::fatal("couldn't compact log cache", e))?;
        self.rewrite()
    }

    /// Rewrites `consensus.db` from the cache: tmp file, fsync, rename.
    fn rewrite(&mut self) -> Result<(), NodeError> {
        let first = self
            .cache
            .first_index()
            .map_err(|e| NodeError::fatal("couldn't read log cache", e))?;
        let last = self.last_index_fatal()?;
        let entries = if last >= first {
            self.cache
                .entries(first, last + 1, None, GetEntriesContext::empty(false))
                .map_err(|e| NodeError::fatal("couldn't read log cache", e))?
        } else {
            Vec::new()
        };

        let tmp_path = self.path.with_extension("db.tmp");
        let meta_buf =
            bincode::serialize(&self.meta).map_err(|e| NodeError::fatal("couldn't encode metadata", e))?;
        if meta_buf.len() as u64 + 4 > META_CAPACITY {
            return Err(NodeError::Fatal(
                "consensus.db metadata block overflow".to_string(),
            ));
        }
        let mut positions = BTreeMap::new();
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|e| NodeError::fatal("couldn't create consensus.db.tmp", e))?;
            tmp.write_all(&MAGIC.to_le_bytes())
                .and_then(|_| tmp.write_all(&FORMAT_VERSION.to_le_bytes()))
                .and_then(|_| tmp.write_all(&(meta_buf.len() as u32).to_le_bytes()))
                .and_then(|_| tmp.write_all(&meta_buf))
                .map_err(|e| NodeError::fatal("couldn't write consensus.db.tmp", e))?;
            tmp.set_len(DATA_OFFSET)
                .map_err(|e| NodeError::fatal("couldn't reserve metadata region", e))?;
            let mut pos = tmp
                .seek(SeekFrom::Start(DATA_OFFSET))
                .map_err(|e| NodeError::fatal("couldn't seek consensus.db.tmp", e))?;
            for entry in &entries {
                let bytes = entry
                    .write_to_bytes()
                    .map_err(|e| NodeError::fatal("couldn't encode log entry", e))?;
                tmp.write_all(&(bytes.len() as u32).to_le_bytes())
                    .and_then(|_| tmp.write_all(&bytes))
                    .map_err(|e| NodeError::fatal("couldn't write consensus.db.tmp", e))?;
                positions.insert(entry.index, pos);
                pos += 4 + bytes.len() as u64;
            }
            tmp.sync_data()
                .map_err(|e| NodeError::fatal("couldn't sync consensus.db.tmp", e))?;
        }
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| NodeError::fatal("couldn't replace consensus.db", e))?;
        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| NodeError::fatal("couldn't reopen consensus.db", e))?;
        self.positions = positions;
        Ok(())
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.cache.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.cache.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.cache.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.cache.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.cache.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        // The cache cannot serve snapshot data (the state machine owns
        // it); hand out the last materialized snapshot instead.
        if self.latest_snapshot.get_metadata().index < request_index {
            return Err(raft::Error::Store(
                raft::StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(self.latest_snapshot.clone())
    }
}

/// Retained snapshot files, newest first, rotated on save.
pub struct SnapshotStore {
    dir: PathBuf,
    retained: usize,
}

impl SnapshotStore {
    pub fn open(dir: PathBuf, retained: usize) -> Result<SnapshotStore, NodeError> {
        fs::create_dir_all(&dir)
            .map_err(|e| NodeError::fatal("couldn't create snapshots dir", e))?;
        Ok(SnapshotStore { dir, retained })
    }

    /// Persists a snapshot (tmp file, fsync, rename) and prunes beyond
    /// the retention count.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), NodeError> {
        let meta = snapshot.get_metadata();
        let name = format!("{:020}-{:020}.snap", meta.index, meta.term);
        let tmp_path = self.dir.join(format!("{name}.tmp"));
        let bytes = snapshot
            .write_to_bytes()
            .map_err(|e| NodeError::fatal("couldn't encode snapshot", e))?;
        {
            let mut tmp = File::create(&tmp_path)
                .map_err(|e| NodeError::fatal("couldn't create snapshot file", e))?;
            tmp.write_all(&bytes)
                .and_then(|_| tmp.sync_data())
                .map_err(|e| NodeError::fatal("couldn't write snapshot file", e))?;
        }
        fs::rename(&tmp_path, self.dir.join(&name))
            .map_err(|e| NodeError::fatal("couldn't finalize snapshot file", e))?;
        self.prune();
        Ok(())
    }

    /// Snapshot files as `(index, term, path)`, newest first.
    pub fn list(&self) -> Result<Vec<(u64, u64, PathBuf)>, NodeError> {
        let mut found = Vec::new();
        let dir = fs::read_dir(&self.dir)
            .map_err(|e| NodeError::fatal("couldn't list snapshots dir", e))?;
        for item in dir {
            let item = item.map_err(|e| NodeError::fatal("couldn't list snapshots dir", e))?;
            let path = item.path();
            let stem = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => match name.strip_suffix(".snap") {
                    Some(stem) => stem.to_string(),
                    None => continue,
                },
                None => continue,
            };
            let mut parts = stem.splitn(2, '-');
            let index = parts.next().and_then(|p| p.parse::<u64>().ok());
            let term = parts.next().and_then(|p| p.parse::<u64>().ok());
            if let (Some(index), Some(term)) = (index, term) {
                found.push((index, term, path));
            }
        }
        found.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        Ok(found)
    }

    /// Most recent readable snapshot, skipping corrupt files.
    pub fn load_latest(&self) -> Result<Option<Snapshot>, NodeError> {
        for (index, term, path) in self.list()? {
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    warn!("couldn't read snapshot {index}-{term}: {e}");
                    continue;
                }
            };
            match Snapshot::parse_from_bytes(&bytes) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => warn!("skipping corrupt snapshot {index}-{term}: {e}"),
            }
        }
        Ok(None)
    }

    fn prune(&self) {
        let list = match self.list() {
            Ok(l) => l,
            Err(e) => {
                warn!("couldn't prune snapshots: {e}");
                return;
            }
        };
        for (index, term, path) in list.into_iter().skip(self.retained) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("couldn't remove old snapshot {index}-{term}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.set_data(data.to_vec().into());
        e
    }

    fn bootstrap_servers() -> Vec<(u64, String)> {
        (1..=3).map(|i| (i, format!("node{i}"))).collect()
    }

    #[test]
    fn bootstrap_once_then_resume() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("consensus.db");
        let snapshot = {
            let mut store = LogStore::open(&path, None).unwrap();
            let snapshot = store.bootstrap(&bootstrap_servers()).unwrap().unwrap();
            assert_eq!(store.voters(), vec![1, 2, 3]);
            assert!(store.bootstrap(&bootstrap_servers()).unwrap().is_none());
            snapshot
        };
        let store = LogStore::open(&path, Some(snapshot)).unwrap();
        assert_eq!(store.voters(), vec![1, 2, 3]);
        assert_eq!(store.peer_name(2), Some("node2"));
    }

    #[test]
    fn appended_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("consensus.db");
        let snapshot = {
            let mut store = LogStore::open(&path, None).unwrap();
            let snapshot = store.bootstrap(&bootstrap_servers()).unwrap().unwrap();
            store
                .append(&[entry(2, 1, b"a"), entry(3, 1, b"b"), entry(4, 2, b"c")])
                .unwrap();
            snapshot
        };
        let store = LogStore::open(&path, Some(snapshot)).unwrap();
        assert_eq!(store.last_index().unwrap(), 4);
        let got = store
            .entries(2, 5, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[2].term, 2);
        assert_eq!(got[0].data.as_ref(), b"a");
    }

    #[test]
    fn hard_state_is_durable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("consensus.db");
        let snapshot = {
            let mut store = LogStore::open(&path, None).unwrap();
            let snapshot = store.bootstrap(&bootstrap_servers()).unwrap().unwrap();
            let mut hs = store.initial_state().unwrap().hard_state;
            hs.term = 7;
            hs.vote = 2;
            store.set_hard_state(&hs).unwrap();
            snapshot
        };
        let store = LogStore::open(&path, Some(snapshot)).unwrap();
        let hs = store.initial_state().unwrap().hard_state;
        assert_eq!(hs.term, 7);
        assert_eq!(hs.vote, 2);
    }

    #[test]
    fn conflicting_suffix_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("consensus.db");
        let snapshot = {
            let mut store = LogStore::open(&path, None).unwrap();
            let snapshot = store.bootstrap(&bootstrap_servers()).unwrap().unwrap();
            store
                .append(&[entry(2, 1, b"a"), entry(3, 1, b"b"), entry(4, 1, b"c")])
                .unwrap();
            // A new leader overwrites indices 3 and 4.
            store
                .append(&[entry(3, 2, b"x"), entry(4, 2, b"y")])
                .unwrap();
            snapshot
        };
        let store = LogStore::open(&path, Some(snapshot)).unwrap();
        assert_eq!(store.last_index().unwrap(), 4);
        let got = store
            .entries(3, 5, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got[0].term, 2);
        assert_eq!(got[0].data.as_ref(), b"x");
        assert_eq!(got[1].data.as_ref(), b"y");
    }

    #[test]
    fn compaction_drops_the_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("consensus.db");
        let snaps = SnapshotStore::open(dir.path().join("snapshots"), 3).unwrap();
        {
            let mut store = LogStore::open(&path, None).unwrap();
            store.bootstrap(&bootstrap_servers()).unwrap().unwrap();
            store
                .append(&[
                    entry(2, 1, b"a"),
                    entry(3, 1, b"b"),
                    entry(4, 1, b"c"),
                    entry(5, 1, b"d"),
                ])
                .unwrap();
            store.set_commit(4);
            let snapshot = store.build_snapshot(4, b"image".to_vec()).unwrap();
            snaps.save(&snapshot).unwrap();
            store.compact(4).unwrap();
            assert_eq!(store.first_index().unwrap(), 5);
        }
        let restored = snaps.load_latest().unwrap().unwrap();
        assert_eq!(restored.get_metadata().index, 4);
        assert_eq!(restored.data.as_ref(), b"image");
        let store = LogStore::open(&path, Some(restored)).unwrap();
        assert_eq!(store.first_index().unwrap(), 5);
        assert_eq!(store.last_index().unwrap(), 5);
        let got = store
            .entries(5, 6, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got[0].data.as_ref(), b"d");
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("consensus.db");
        let snapshot = {
            let mut store = LogStore::open(&path, None).unwrap();
            let snapshot = store.bootstrap(&bootstrap_servers()).unwrap().unwrap();
            store
                .append(&[entry(2, 1, b"aaaa"), entry(3, 1, b"bbbb")])
                .unwrap();
            snapshot
        };
        // Simulate a crash mid-append.
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let store = LogStore::open(&path, Some(snapshot)).unwrap();
        assert_eq!(store.last_index().unwrap(), 2);
        let got = store
            .entries(2, 3, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got[0].data.as_ref(), b"aaaa");
    }

    #[test]
    fn snapshot_store_rotates() {
        let dir = TempDir::new().unwrap();
        let snaps = SnapshotStore::open(dir.path().to_path_buf(), 3).unwrap();
        for i in 1..=5u64 {
            let mut snapshot = Snapshot::default();
            snapshot.mut_metadata().index = i * 10;
            snapshot.mut_metadata().term = 1;
            snapshot.set_data(format!("image{i}").into_bytes().into());
            snaps.save(&snapshot).unwrap();
        }
        let list = snaps.list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].0, 50);
        assert_eq!(list[2].0, 30);
        let latest = snaps.load_latest().unwrap().unwrap();
        assert_eq!(latest.data.as_ref(), b"image5");
    }

    #[test]
    fn peer_registry_is_durable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("consensus.db");
        {
            let mut store = LogStore::open(&path, None).unwrap();
            store.register_peer(4, "node4").unwrap();
        }
        let store = LogStore::open(&path, None).unwrap();
        assert_eq!(store.peer_name(4), Some("node4"));
    }
}

//! Transactional storage over an append-only log.
//!
//! Writes go to an in-memory byte store immediately and are staged as a
//! delta. `checkpoint(level)` appends the delta as one record followed by a
//! final mark. Opening replays the log and keeps only what was committed by a
//! checkpoint whose level is at most the configured rollback level; a tail of
//! deeper checkpoints is discarded and cut off with a final mark.

use crate::entry::{Decoded, LogRecord, Operation, RecordKind};
use crate::error::WalError;
use crate::storage::{InMemoryStorage, Storage};
use crate::stream::LogStream;
use crate::{FINAL_MARK, MAX_LEVEL};
use bytes::{BufMut, BytesMut};

/// Fsync policy for checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// Fsync after every checkpoint (safest, slowest).
    #[default]
    EveryCheckpoint,
    /// Fsync after N checkpoints, and always on level 0.
    EveryN(u32),
    /// Never fsync automatically (caller must call sync).
    Never,
}

/// Log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
    /// Highest checkpoint level kept when replaying.
    pub rollback_level: u8,
    /// Minimum log size in bytes before `shrink_if_needed` rewrites it.
    pub shrink_threshold: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            fsync_policy: FsyncPolicy::default(),
            rollback_level: MAX_LEVEL,
            shrink_threshold: 0,
        }
    }
}

impl LogConfig {
    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }

    pub fn with_rollback_level(mut self, level: u8) -> Self {
        self.rollback_level = level;
        self
    }

    pub fn with_shrink_threshold(mut self, bytes: u64) -> Self {
        self.shrink_threshold = bytes;
        self
    }
}

/// I/O statistics for the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStats {
    /// Records written since open.
    pub records_written: u64,
    /// Bytes written since open, including shrink rewrites.
    pub bytes_written: u64,
    /// Number of shrink rewrites.
    pub shrinks: u64,
    /// Fsync operations.
    pub fsyncs: u64,
    /// Records discarded by rollback when the log was opened.
    pub rolled_back: u64,
}

/// Key/value storage whose changes are committed to a log by checkpoints.
pub struct StreamStorage<S: LogStream> {
    stream: S,
    config: LogConfig,
    store: InMemoryStorage,
    pending: Vec<Operation>,
    /// Offset of the final mark, where the next record goes.
    tail: u64,
    /// Data records currently in the log.
    records: u64,
    checkpoints_since_sync: u32,
    stats: LogStats,
}

impl<S: LogStream> StreamStorage<S> {
    /// Opens the log and replays it up to `config.rollback_level`.
    pub fn open(mut stream: S, config: LogConfig) -> Result<Self, WalError> {
        let data = stream.read_all()?;
        let replay = replay(&data, config.rollback_level)?;

        if replay.discarded > 0 {
            tracing::info!(
                "Rolled back {} log record(s) above level {}",
                replay.discarded,
                config.rollback_level
            );
        }

        // Make sure the valid tail is terminated where the committed data ends.
        if !data.is_empty() && data.get(replay.tail as usize) != Some(&FINAL_MARK) {
            stream.write_at(replay.tail, &[FINAL_MARK])?;
            stream.sync()?;
        }

        Ok(Self {
            stream,
            config,
            store: replay.store,
            pending: Vec::new(),
            tail: replay.tail,
            records: replay.records,
            checkpoints_since_sync: 0,
            stats: LogStats {
                rolled_back: replay.discarded,
                ..LogStats::default()
            },
        })
    }

    /// Commits staged changes as one record of the given level.
    ///
    /// A record is written even when nothing changed, so the log always
    /// carries the checkpoint position for later rollback.
    pub fn checkpoint(&mut self, level: u8) -> Result<(), WalError> {
        let payload = Operation::encode_all(&self.pending);
        let record = LogRecord::data(level, payload)?;

        let mut buf = BytesMut::new();
        record.encode(&mut buf)?;
        let record_len = buf.len() as u64;
        buf.put_u8(FINAL_MARK);

        self.stream.write_at(self.tail, &buf)?;
        self.tail += record_len;
        self.records += 1;
        self.pending.clear();

        self.stats.records_written += 1;
        self.stats.bytes_written += buf.len() as u64;

        self.checkpoints_since_sync += 1;
        let sync = match self.config.fsync_policy {
            FsyncPolicy::EveryCheckpoint => true,
            FsyncPolicy::EveryN(n) => level == 0 || self.checkpoints_since_sync >= n,
            FsyncPolicy::Never => false,
        };
        if sync {
            self.sync()?;
        }

        tracing::trace!("Checkpoint level {} at offset {}", level, self.tail);
        Ok(())
    }

    /// Rewrites the log as a single level-0 snapshot of the committed state.
    ///
    /// Fails if there are staged changes: only a checkpointed state can
    /// become the new baseline.
    pub fn shrink(&mut self) -> Result<(), WalError> {
        if !self.pending.is_empty() {
            return Err(WalError::InvalidState(format!(
                "cannot shrink with {} uncommitted operation(s)",
                self.pending.len()
            )));
        }

        let payload = Operation::encode_all(&self.store.to_operations());
        let record = LogRecord::data(0, payload)?;

        let mut buf = BytesMut::new();
        record.encode(&mut buf)?;
        let record_len = buf.len() as u64;
        buf.put_u8(FINAL_MARK);

        let before = self.tail;
        self.stream.replace(&buf)?;
        self.tail = record_len;
        self.records = 1;
        self.checkpoints_since_sync = 0;

        self.stats.shrinks += 1;
        self.stats.bytes_written += buf.len() as u64;

        tracing::debug!("Shrunk log from {} to {} bytes", before, self.tail);
        Ok(())
    }

    /// Shrinks when the log holds more than one record and has grown past
    /// the configured threshold. Returns whether a rewrite happened.
    pub fn shrink_if_needed(&mut self) -> Result<bool, WalError> {
        if self.records <= 1 || self.tail < self.config.shrink_threshold {
            return Ok(false);
        }
        self.shrink()?;
        Ok(true)
    }

    /// Discards staged changes and restores the last committed state.
    pub fn rollback(&mut self) -> Result<(), WalError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let data = self.stream.read_all()?;
        let end = (self.tail as usize).min(data.len());
        let replay = replay(&data[..end], MAX_LEVEL)?;
        self.store = replay.store;
        self.pending.clear();
        Ok(())
    }

    /// Forces a sync to durable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.stream.sync()?;
        self.checkpoints_since_sync = 0;
        self.stats.fsyncs += 1;
        Ok(())
    }

    /// Returns whether there are staged, uncommitted changes.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Returns the size of the valid log tail in bytes.
    pub fn log_len(&self) -> u64 {
        self.tail
    }

    /// Returns the number of data records in the log.
    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Returns the I/O statistics.
    pub fn stats(&self) -> LogStats {
        self.stats
    }

    /// Returns the committed-plus-staged content.
    pub fn store(&self) -> &InMemoryStorage {
        &self.store
    }

    /// Returns the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }
}

impl<S: LogStream> Storage for StreamStorage<S> {
    fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.store.get(key)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.store.set(key, value);
        self.pending.push(Operation::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    fn remove(&mut self, key: &[u8]) {
        self.store.remove(key);
        self.pending.push(Operation::Remove { key: key.to_vec() });
    }

    fn remove_all(&mut self, prefix: &[u8]) {
        self.store.remove_all(prefix);
        self.pending.push(Operation::RemoveAll {
            prefix: prefix.to_vec(),
        });
    }
}

struct Replay {
    store: InMemoryStorage,
    tail: u64,
    records: u64,
    discarded: u64,
}

/// Replays `data`, committing records up to the last one whose level is at
/// most `rollback_level`.
fn replay(data: &[u8], rollback_level: u8) -> Result<Replay, WalError> {
    let mut store = InMemoryStorage::new();
    let mut staged: Vec<Vec<Operation>> = Vec::new();
    let mut offset = 0usize;
    let mut tail = 0u64;
    let mut records = 0u64;

    loop {
        match LogRecord::decode(&data[offset..], offset as u64)? {
            Decoded::Final | Decoded::End => break,
            Decoded::Record { record, len } => {
                let record_offset = offset as u64;
                offset += len;

                let level = match record.kind {
                    RecordKind::Skip => continue,
                    RecordKind::Data { level } => level,
                };

                staged.push(Operation::decode_all(&record.payload, record_offset)?);
                if level <= rollback_level {
                    for ops in staged.drain(..) {
                        records += 1;
                        for op in &ops {
                            store.apply(op);
                        }
                    }
                    tail = offset as u64;
                }
            }
        }
    }

    Ok(Replay {
        store,
        tail,
        records,
        discarded: staged.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{FileStream, MemoryStream};
    use tempfile::TempDir;

    fn open(stream: &MemoryStream) -> StreamStorage<MemoryStream> {
        StreamStorage::open(stream.clone(), LogConfig::default()).unwrap()
    }

    #[test]
    fn test_checkpoint_and_reopen() {
        let stream = MemoryStream::new();
        {
            let mut storage = open(&stream);
            storage.set(b"a", b"1");
            storage.set(b"b", b"2");
            storage.checkpoint(2).unwrap();
            storage.remove(b"a");
            storage.checkpoint(2).unwrap();
        }

        let storage = open(&stream);
        assert!(storage.get(b"a").is_none());
        assert_eq!(storage.get(b"b"), Some(&b"2"[..]));
        assert_eq!(storage.record_count(), 2);
        assert_eq!(*stream.to_vec().last().unwrap(), FINAL_MARK);
    }

    #[test]
    fn test_uncommitted_changes_are_lost() {
        let stream = MemoryStream::new();
        {
            let mut storage = open(&stream);
            storage.set(b"a", b"1");
            storage.checkpoint(0).unwrap();
            storage.set(b"a", b"2");
            assert!(storage.has_pending());
        }

        let storage = open(&stream);
        assert_eq!(storage.get(b"a"), Some(&b"1"[..]));
    }

    #[test]
    fn test_rollback_level_discards_deeper_tail() {
        let stream = MemoryStream::new();
        {
            let mut storage = open(&stream);
            storage.set(b"k", b"stable");
            storage.checkpoint(0).unwrap();
            storage.set(b"k", b"transition");
            storage.checkpoint(2).unwrap();
        }

        let config = LogConfig::default().with_rollback_level(0);
        let mut storage = StreamStorage::open(stream.clone(), config).unwrap();
        assert_eq!(storage.get(b"k"), Some(&b"stable"[..]));
        assert_eq!(storage.stats().rolled_back, 1);

        // The discarded tail stays dead even for a full replay afterwards.
        storage.set(b"other", b"x");
        storage.checkpoint(2).unwrap();
        drop(storage);

        let storage = open(&stream);
        assert_eq!(storage.get(b"k"), Some(&b"stable"[..]));
        assert_eq!(storage.get(b"other"), Some(&b"x"[..]));
    }

    #[test]
    fn test_remove_subtree_is_logged() {
        let stream = MemoryStream::new();
        {
            let mut storage = open(&stream);
            storage.set(&[7, 1], b"a");
            storage.set(&[7, 2], b"b");
            storage.set(&[8], b"c");
            storage.checkpoint(1).unwrap();
            storage.remove_all(&[7]);
            storage.checkpoint(1).unwrap();
        }

        let storage = open(&stream);
        assert_eq!(storage.store().len(), 1);
        assert!(storage.get(&[8]).is_some());
    }

    #[test]
    fn test_shrink_keeps_content() {
        let stream = MemoryStream::new();
        {
            let mut storage = open(&stream);
            for i in 0..20u8 {
                storage.set(&[1], &[i]);
                storage.checkpoint(2).unwrap();
            }
            let before = storage.log_len();
            storage.checkpoint(0).unwrap();
            assert!(storage.shrink_if_needed().unwrap());
            assert!(storage.log_len() < before);
            assert_eq!(storage.record_count(), 1);
        }

        let storage = open(&stream);
        assert_eq!(storage.get(&[1]), Some(&[19u8][..]));
        assert_eq!(stream.len(), storage.log_len() + 1);
    }

    #[test]
    fn test_shrink_with_pending_fails() {
        let stream = MemoryStream::new();
        let mut storage = open(&stream);
        storage.set(b"a", b"1");
        assert!(matches!(storage.shrink(), Err(WalError::InvalidState(_))));
    }

    #[test]
    fn test_shrink_threshold() {
        let stream = MemoryStream::new();
        let config = LogConfig::default().with_shrink_threshold(1024);
        let mut storage = StreamStorage::open(stream, config).unwrap();
        storage.set(b"a", b"1");
        storage.checkpoint(0).unwrap();
        storage.checkpoint(0).unwrap();
        assert!(!storage.shrink_if_needed().unwrap());
    }

    #[test]
    fn test_rollback_restores_committed_state() {
        let stream = MemoryStream::new();
        let mut storage = open(&stream);
        storage.set(b"a", b"1");
        storage.checkpoint(0).unwrap();

        storage.set(b"a", b"2");
        storage.remove_all(&[]);
        storage.rollback().unwrap();

        assert_eq!(storage.get(b"a"), Some(&b"1"[..]));
        assert!(!storage.has_pending());
    }

    #[test]
    fn test_skip_blocks_are_ignored() {
        let mut buf = BytesMut::new();
        LogRecord::skip(8).encode(&mut buf).unwrap();
        let ops = vec![Operation::Set {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        }];
        LogRecord::data(0, Operation::encode_all(&ops))
            .unwrap()
            .encode(&mut buf)
            .unwrap();
        buf.put_u8(FINAL_MARK);
        buf.put_slice(b"stale garbage after the final mark");

        let storage = open(&MemoryStream::from_bytes(buf.to_vec()));
        assert_eq!(storage.get(b"k"), Some(&b"v"[..]));
    }

    #[test]
    fn test_truncated_log_is_fatal() {
        let stream = MemoryStream::new();
        {
            let mut storage = open(&stream);
            storage.set(b"key", b"a value that makes the record long enough");
            storage.checkpoint(0).unwrap();
        }
        let mut data = stream.to_vec();
        data.truncate(data.len() - 10);

        let result = StreamStorage::open(MemoryStream::from_bytes(data), LogConfig::default());
        assert!(matches!(result, Err(WalError::TruncatedRecord { .. })));
    }

    #[test]
    fn test_file_backed_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.log");
        {
            let stream = FileStream::open(&path).unwrap();
            let mut storage = StreamStorage::open(stream, LogConfig::default()).unwrap();
            storage.set(b"x", b"1");
            storage.checkpoint(0).unwrap();
            storage.set(b"y", b"2");
            storage.checkpoint(1).unwrap();
            storage.shrink().unwrap();
            assert!(storage.stats().fsyncs >= 2);
        }

        let stream = FileStream::open(&path).unwrap();
        let storage = StreamStorage::open(stream, LogConfig::default()).unwrap();
        assert_eq!(storage.get(b"x"), Some(&b"1"[..]));
        assert_eq!(storage.get(b"y"), Some(&b"2"[..]));
    }
}

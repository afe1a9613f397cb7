use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProtoError, Result};
use crate::handle::Handle;
use crate::message::ParamUpdate;

/// What an activity-log entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogKind {
    /// A checkpoint of type `chk_handle` was taken.
    Checkpoint { chk_handle: Handle, tag: String },
    /// Parameter values sampled at application step `seq_num`.
    ParamSnapshot { seq_num: i64 },
}

/// One activity-log entry as it travels to a steerer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub key: u64,
    pub kind: LogKind,
    pub params: Vec<ParamUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    record: LogRecord,
    delivered: bool,
}

/// Keys still owed to a newly attached steerer regardless of delivered flags.
#[derive(Debug, Clone, Copy)]
struct Resend {
    cursor: u64,
    through: u64,
}

/// Append-mostly history of checkpoint and parameter events.
///
/// Keys increase strictly and are never reused. Each entry remembers whether
/// it reached the steerer; [`ActivityLog::request_resend_all`] overrides the
/// flags once so that a late-attaching steerer gets the whole history.
#[derive(Debug, Default)]
pub struct ActivityLog {
    entries: Vec<StoredEntry>,
    next_key: u64,
    unsent: usize,
    resend: Option<Resend>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event at the tail and return its key.
    pub fn append(&mut self, kind: LogKind, params: Vec<ParamUpdate>) -> Result<u64> {
        self.entries
            .try_reserve(1)
            .map_err(|_| ProtoError::Capacity(self.entries.len() + 1))?;
        let key = self.next_key;
        self.next_key = following_key(key)?;
        self.entries.push(StoredEntry {
            record: LogRecord { key, kind, params },
            delivered: false,
        });
        self.unsent += 1;
        Ok(key)
    }

    /// Store a record received from the application (steerer mirror).
    ///
    /// Records already present are skipped, so redelivery is harmless.
    /// Mirror records count as delivered. Returns whether it was new.
    pub fn merge(&mut self, record: LogRecord) -> Result<bool> {
        let pos = match self.position(record.key) {
            Ok(_) => return Ok(false),
            Err(pos) => pos,
        };
        let after = following_key(record.key)?;
        self.entries
            .try_reserve(1)
            .map_err(|_| ProtoError::Capacity(self.entries.len() + 1))?;
        self.next_key = self.next_key.max(after);
        self.entries.insert(
            pos,
            StoredEntry {
                record,
                delivered: true,
            },
        );
        Ok(true)
    }

    pub fn mark_delivered(&mut self, key: u64) -> Result<()> {
        let idx = self
            .position(key)
            .map_err(|_| ProtoError::UnknownLogKey(key))?;
        let entry = &mut self.entries[idx];
        if !entry.delivered {
            entry.delivered = true;
            self.unsent -= 1;
        }
        if let Some(resend) = self.resend.as_mut() {
            if key >= resend.cursor {
                resend.cursor = key.saturating_add(1);
            }
            if resend.cursor > resend.through {
                debug!(through = resend.through, "log resend complete");
                self.resend = None;
            }
        }
        Ok(())
    }

    pub fn mark_all_delivered(&mut self) {
        for entry in &mut self.entries {
            entry.delivered = true;
        }
        self.unsent = 0;
        self.resend = None;
    }

    /// Make every existing entry pending again for the next delivery pass.
    pub fn request_resend_all(&mut self) {
        if let (Some(first), Some(last)) = (self.entries.first(), self.entries.last()) {
            self.resend = Some(Resend {
                cursor: first.record.key,
                through: last.record.key,
            });
        }
    }

    /// Whether a full resend is in progress.
    pub fn send_all(&self) -> bool {
        self.resend.is_some()
    }

    /// Up to `limit` pending entries, oldest first. Does not mark anything.
    pub fn entries_pending(&self, limit: usize) -> Vec<&LogRecord> {
        self.entries
            .iter()
            .filter(|e| self.is_pending(e))
            .take(limit)
            .map(|e| &e.record)
            .collect()
    }

    /// Number of entries the next delivery passes still owe the steerer.
    pub fn num_unsent(&self) -> usize {
        let forced = match self.resend {
            Some(_) => self
                .entries
                .iter()
                .filter(|e| e.delivered && self.is_pending(e))
                .count(),
            None => 0,
        };
        self.unsent + forced
    }

    /// Up to `n` most recent entries, newest first.
    pub fn reverse_query(&self, n: usize) -> Vec<&LogRecord> {
        self.entries.iter().rev().take(n).map(|e| &e.record).collect()
    }

    pub fn get(&self, key: u64) -> Option<&LogRecord> {
        self.position(key).ok().map(|idx| &self.entries[idx].record)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LogRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the log as JSON lines, one entry per line.
    pub fn write_jsonl<W: Write>(&self, mut out: W) -> Result<()> {
        for entry in &self.entries {
            serde_json::to_writer(&mut out, entry)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    /// Rebuild a log written by [`ActivityLog::write_jsonl`].
    pub fn read_jsonl<R: BufRead>(input: R) -> Result<Self> {
        let mut log = Self::new();
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: StoredEntry = serde_json::from_str(&line)?;
            if entry.record.key < log.next_key {
                return Err(ProtoError::InvalidArgument(format!(
                    "log key {} out of order",
                    entry.record.key
                )));
            }
            log.next_key = following_key(entry.record.key)?;
            if !entry.delivered {
                log.unsent += 1;
            }
            log.entries.push(entry);
        }
        Ok(log)
    }

    fn is_pending(&self, entry: &StoredEntry) -> bool {
        !entry.delivered
            || self.resend.is_some_and(|r| {
                entry.record.key >= r.cursor && entry.record.key <= r.through
            })
    }

    fn position(&self, key: u64) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&key, |e| e.record.key)
    }
}

/// Key allocated after `key`; the last representable key cannot be stored.
fn following_key(key: u64) -> Result<u64> {
    key.checked_add(1)
        .ok_or_else(|| ProtoError::InvalidArgument(format!("log key {key} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(log: &mut ActivityLog, seq_num: i64) -> u64 {
        log.append(
            LogKind::ParamSnapshot { seq_num },
            vec![ParamUpdate::new(Handle::new(0), format!("{seq_num}.00"))],
        )
        .unwrap()
    }

    fn keys(records: &[&LogRecord]) -> Vec<u64> {
        records.iter().map(|r| r.key).collect()
    }

    #[test]
    fn keys_strictly_increase() {
        let mut log = ActivityLog::new();
        let a = snapshot(&mut log, 1);
        let b = log
            .append(
                LogKind::Checkpoint {
                    chk_handle: Handle::new(2000),
                    tag: "chk-1".into(),
                },
                Vec::new(),
            )
            .unwrap();
        assert!(b > a);
        assert_eq!(log.num_unsent(), 2);
    }

    #[test]
    fn pending_pages_through_oldest_first() {
        let mut log = ActivityLog::new();
        for seq in 0..5 {
            snapshot(&mut log, seq);
        }

        let first = keys(&log.entries_pending(2));
        assert_eq!(first, vec![0, 1]);
        assert_eq!(keys(&log.entries_pending(2)), first, "not marked yet");

        for key in first {
            log.mark_delivered(key).unwrap();
        }
        assert_eq!(keys(&log.entries_pending(2)), vec![2, 3]);
        assert_eq!(log.num_unsent(), 3);
    }

    #[test]
    fn mark_delivered_unknown_key() {
        let mut log = ActivityLog::new();
        assert!(matches!(
            log.mark_delivered(3),
            Err(ProtoError::UnknownLogKey(3))
        ));
    }

    #[test]
    fn mark_delivered_is_idempotent() {
        let mut log = ActivityLog::new();
        let key = snapshot(&mut log, 0);
        log.mark_delivered(key).unwrap();
        log.mark_delivered(key).unwrap();
        assert_eq!(log.num_unsent(), 0);
    }

    #[test]
    fn resend_all_ignores_flags_once() {
        let mut log = ActivityLog::new();
        for seq in 0..3 {
            snapshot(&mut log, seq);
        }
        log.mark_all_delivered();
        assert!(log.entries_pending(10).is_empty());

        log.request_resend_all();
        assert!(log.send_all());
        assert_eq!(log.num_unsent(), 3);
        let late = snapshot(&mut log, 3);
        assert_eq!(keys(&log.entries_pending(10)), vec![0, 1, 2, 3]);

        for key in [0, 1] {
            log.mark_delivered(key).unwrap();
        }
        assert!(log.send_all());
        assert_eq!(keys(&log.entries_pending(10)), vec![2, 3]);

        log.mark_delivered(2).unwrap();
        assert!(!log.send_all());
        assert_eq!(keys(&log.entries_pending(10)), vec![late]);

        log.mark_delivered(late).unwrap();
        assert!(log.entries_pending(10).is_empty());
        assert_eq!(log.num_unsent(), 0);
    }

    #[test]
    fn reverse_query_newest_first_without_marking() {
        let mut log = ActivityLog::new();
        for seq in 0..4 {
            snapshot(&mut log, seq);
        }
        assert_eq!(keys(&log.reverse_query(2)), vec![3, 2]);
        assert_eq!(keys(&log.reverse_query(10)), vec![3, 2, 1, 0]);
        assert_eq!(log.num_unsent(), 4);
    }

    #[test]
    fn merge_skips_known_keys() {
        let mut app = ActivityLog::new();
        for seq in 0..3 {
            snapshot(&mut app, seq);
        }
        let mut mirror = ActivityLog::new();
        let records: Vec<LogRecord> = app.iter().cloned().collect();

        for record in records.iter().rev() {
            assert!(mirror.merge(record.clone()).unwrap());
        }
        assert!(!mirror.merge(records[1].clone()).unwrap());
        assert_eq!(mirror.len(), 3);
        assert_eq!(keys(&mirror.reverse_query(3)), vec![2, 1, 0]);
        assert_eq!(mirror.num_unsent(), 0);
    }

    #[test]
    fn merge_rejects_last_key() {
        let mut mirror = ActivityLog::new();
        let record = LogRecord {
            key: u64::MAX,
            kind: LogKind::ParamSnapshot { seq_num: 0 },
            params: Vec::new(),
        };
        assert!(matches!(
            mirror.merge(record),
            Err(ProtoError::InvalidArgument(_))
        ));
        assert!(mirror.is_empty());
    }

    #[test]
    fn jsonl_rejects_last_key() {
        let line = format!(
            r#"{{"record":{{"key":{},"kind":{{"type":"param_snapshot","seq_num":1}},"params":[]}},"delivered":true}}"#,
            u64::MAX
        );
        assert!(matches!(
            ActivityLog::read_jsonl(line.as_bytes()),
            Err(ProtoError::InvalidArgument(_))
        ));
    }

    #[test]
    fn iter_runs_both_ways() {
        let mut log = ActivityLog::new();
        for seq in 0..3 {
            snapshot(&mut log, seq);
        }
        let newest: Vec<u64> = log.iter().rev().map(|r| r.key).collect();
        assert_eq!(newest, vec![2, 1, 0]);
    }

    #[test]
    fn jsonl_roundtrip_keeps_flags() {
        let mut log = ActivityLog::new();
        snapshot(&mut log, 0);
        log.append(
            LogKind::Checkpoint {
                chk_handle: Handle::new(2000),
                tag: "line\nbreak".into(),
            },
            Vec::new(),
        )
        .unwrap();
        log.mark_delivered(0).unwrap();

        let mut buf = Vec::new();
        log.write_jsonl(&mut buf).unwrap();
        assert_eq!(buf.iter().filter(|&&b| b == b'\n').count(), 2);

        let restored = ActivityLog::read_jsonl(buf.as_slice()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.num_unsent(), 1);
        assert_eq!(restored.get(1), log.get(1));

        let mut restored = restored;
        assert_eq!(snapshot(&mut restored, 9), 2);
    }

    #[test]
    fn jsonl_rejects_out_of_order_keys() {
        let text = concat!(
            r#"{"record":{"key":4,"kind":{"type":"param_snapshot","seq_num":1},"params":[]},"delivered":false}"#,
            "\n",
            r#"{"record":{"key":2,"kind":{"type":"param_snapshot","seq_num":2},"params":[]},"delivered":false}"#,
            "\n"
        );
        assert!(ActivityLog::read_jsonl(text.as_bytes()).is_err());
    }
}

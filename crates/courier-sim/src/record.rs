// Recorded calls and their versioned on-disk format.
use bytes::Bytes;
use courier_common::{Error, Result};
use courier_wire::base64_body;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const RECORDING_FORMAT_VERSION: u32 = 1;

/// One intercepted call.
///
/// `id` is allocated when the call starts, so a stream opened before a unary
/// call keeps the lower id even though it is committed later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub id: u64,
    pub timestamp_ms: u64,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(with = "base64_body")]
    pub request: Bytes,
    pub outcome: RecordedOutcome,
    /// Time from call start to the unary result, or to the stream being opened.
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordedOutcome {
    Response {
        #[serde(with = "base64_body")]
        body: Bytes,
    },
    Error {
        error: Error,
    },
    Stream(StreamTranscript),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTranscript {
    /// Frames received from the broker, offsets measured from stream open.
    pub inbound: Vec<RecordedFrame>,
    /// Frames the caller wrote, kept for inspection; replay ignores them.
    pub outbound: Vec<RecordedFrame>,
    pub end: StreamEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedFrame {
    pub offset_ms: u64,
    #[serde(with = "base64_body")]
    pub body: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEnd {
    /// The broker finished the stream.
    Eof,
    /// The broker failed the stream.
    Error { error: Error },
    /// The caller closed or dropped the stream first.
    #[default]
    Closed,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordingFile {
    version: u32,
    entries: Vec<RecordEntry>,
}

pub(crate) fn write_file(path: &Path, entries: Vec<RecordEntry>) -> Result<()> {
    let file = RecordingFile {
        version: RECORDING_FORMAT_VERSION,
        entries,
    };
    let json = serde_json::to_vec_pretty(&file)
        .map_err(|err| Error::Simulation(format!("serialize recordings: {err}")))?;
    std::fs::write(path, json)
        .map_err(|err| Error::Simulation(format!("write {}: {err}", path.display())))
}

pub(crate) fn read_file(path: &Path) -> Result<Vec<RecordEntry>> {
    let contents = std::fs::read(path)
        .map_err(|err| Error::Simulation(format!("read {}: {err}", path.display())))?;
    let file: RecordingFile = serde_json::from_slice(&contents)
        .map_err(|err| Error::Simulation(format!("parse {}: {err}", path.display())))?;
    if file.version != RECORDING_FORMAT_VERSION {
        return Err(Error::Simulation(format!(
            "{} has recording format version {}, expected {RECORDING_FORMAT_VERSION}",
            path.display(),
            file.version
        )));
    }
    let mut entries = file.entries;
    entries.sort_by_key(|entry| entry.id);
    Ok(entries)
}

struct Slot {
    entry: RecordEntry,
    consumed: bool,
}

/// The ordered log plus replay consumption marks.
#[derive(Default)]
pub(crate) struct RecordLog {
    slots: Vec<Slot>,
    next_id: u64,
}

impl RecordLog {
    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Insert keeping the log ordered by id.
    pub(crate) fn commit(&mut self, entry: RecordEntry) {
        let index = self
            .slots
            .partition_point(|slot| slot.entry.id < entry.id);
        self.slots.insert(
            index,
            Slot {
                entry,
                consumed: false,
            },
        );
    }

    /// Exact request match first, then the first unconsumed entry of the operation.
    pub(crate) fn take_match(&mut self, operation: &str, request: &[u8]) -> Option<RecordEntry> {
        let exact = self.slots.iter().position(|slot| {
            !slot.consumed
                && slot.entry.operation == operation
                && slot.entry.request.as_ref() == request
        });
        let index = exact.or_else(|| {
            self.slots
                .iter()
                .position(|slot| !slot.consumed && slot.entry.operation == operation)
        })?;
        let slot = &mut self.slots[index];
        slot.consumed = true;
        Some(slot.entry.clone())
    }

    pub(crate) fn reset_consumed(&mut self) {
        for slot in &mut self.slots {
            slot.consumed = false;
        }
    }

    pub(crate) fn replace(&mut self, entries: Vec<RecordEntry>) {
        self.next_id = entries.iter().map(|entry| entry.id + 1).max().unwrap_or(0);
        self.slots = entries
            .into_iter()
            .map(|entry| Slot {
                entry,
                consumed: false,
            })
            .collect();
    }

    pub(crate) fn entries(&self) -> Vec<RecordEntry> {
        self.slots.iter().map(|slot| slot.entry.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, operation: &str, request: &'static [u8]) -> RecordEntry {
        RecordEntry {
            id,
            timestamp_ms: 0,
            operation: operation.to_string(),
            key: None,
            request: Bytes::from_static(request),
            outcome: RecordedOutcome::Response {
                body: Bytes::from(id.to_string()),
            },
            elapsed_ms: 0,
        }
    }

    #[test]
    fn commit_keeps_id_order() {
        let mut log = RecordLog::default();
        log.commit(entry(2, "op", b"b"));
        log.commit(entry(0, "op", b"a"));
        log.commit(entry(1, "op", b"c"));
        let ids: Vec<u64> = log.entries().iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn exact_match_beats_earlier_entry() {
        let mut log = RecordLog::default();
        log.commit(entry(0, "op", b"first"));
        log.commit(entry(1, "op", b"second"));
        assert_eq!(log.take_match("op", b"second").map(|e| e.id), Some(1));
        // Falls back to the first unconsumed entry of the operation.
        assert_eq!(log.take_match("op", b"other").map(|e| e.id), Some(0));
        assert!(log.take_match("op", b"second").is_none());
        log.reset_consumed();
        assert_eq!(log.take_match("op", b"second").map(|e| e.id), Some(1));
    }

    #[test]
    fn other_operations_never_match() {
        let mut log = RecordLog::default();
        log.commit(entry(0, "publish", b"x"));
        assert!(log.take_match("pull", b"x").is_none());
    }

    #[test]
    fn replace_continues_ids_after_loaded_entries() {
        let mut log = RecordLog::default();
        log.replace(vec![entry(4, "op", b"x"), entry(7, "op", b"y")]);
        assert_eq!(log.allocate_id(), 8);
    }

    #[test]
    fn outcome_serializes_with_type_tag() {
        let outcome = RecordedOutcome::Stream(StreamTranscript {
            inbound: vec![RecordedFrame {
                offset_ms: 3,
                body: Bytes::from_static(b"hi"),
            }],
            outbound: Vec::new(),
            end: StreamEnd::Eof,
        });
        let json = serde_json::to_string(&outcome).expect("serialize");
        assert!(json.starts_with(r#"{"type":"stream""#), "{json}");
        assert!(json.contains(r#""body":"aGk=""#));
        let parsed: RecordedOutcome = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, outcome);
    }
}

//! Receivers of finalized trial records.

use crate::error::SinkError;
use crate::trial::TrialRecord;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Anything that wants each finished trial.
pub trait TrialSink: Send {
    fn publish(&mut self, record: &TrialRecord) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Appends one JSON object per trial to a file.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Opens `path` for appending, creating it if needed.
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl TrialSink for JsonLinesSink {
    fn publish(&mut self, record: &TrialRecord) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TrialRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TrialRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TrialSink for MemorySink {
    fn publish(&mut self, record: &TrialRecord) -> Result<(), SinkError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::{EndReason, Outcome, TrialParams};

    fn record(index: u64) -> TrialRecord {
        TrialRecord {
            index,
            params: TrialParams::go(2.0),
            outcome: Some(Outcome::Hit),
            success: Some(true),
            aborted: false,
            ended_by: EndReason::Completed,
            started_at: 0.0,
            ended_at: 3.0,
            events: Vec::new(),
            licks: Vec::new(),
            rewards: Vec::new(),
            stimulus_changes: Vec::new(),
            cumulative_volume: 0.008,
            cumulative_rewards: 1,
        }
    }

    #[test]
    fn json_lines_append_one_record_per_line() {
        let path = std::env::temp_dir().join(format!("doc-sink-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let mut sink = JsonLinesSink::create(&path).unwrap();
            sink.publish(&record(0)).unwrap();
            sink.publish(&record(1)).unwrap();
            sink.flush().unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: TrialRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back.index, 1);
        assert_eq!(back.outcome, Some(Outcome::Hit));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn memory_sink_clones_share_records() {
        let sink = MemorySink::new();
        let mut handle = sink.clone();
        handle.publish(&record(0)).unwrap();
        assert_eq!(sink.len(), 1);
        assert!(!sink.is_empty());
    }
}

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Everything the pipeline reports about one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageEntered {
        stage: String,
    },
    GenerationFailed {
        stage: String,
        kind: String,
        message: String,
    },
    OrientationAnomaly {
        expected: [u32; 2],
        actual: [u32; 2],
    },
    GenerationFinished {
        width: u32,
        height: u32,
        scale: f32,
    },
}

/// One JSONL row: the event plus the invocation it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub invocation_id: String,
    pub ts: String,
    #[serde(flatten)]
    pub event: PipelineEvent,
}

/// Append-only JSONL log of one generation invocation.
///
/// The file is opened on the first event and kept open; each row is flushed
/// before `emit` returns. The log is diagnostic only and the pipeline never
/// branches on a write failure.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: Arc<PathBuf>,
    invocation_id: Arc<str>,
    sink: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, invocation_id: impl Into<String>) -> Self {
        let invocation_id: String = invocation_id.into();
        Self {
            path: Arc::new(path.into()),
            invocation_id: Arc::from(invocation_id),
            sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Opens a log under a freshly generated invocation id.
    pub fn fresh(path: impl Into<PathBuf>) -> Self {
        Self::new(path, uuid::Uuid::new_v4().to_string())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn emit(&self, event: PipelineEvent) -> anyhow::Result<EventRecord> {
        let record = EventRecord {
            invocation_id: self.invocation_id.to_string(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            event,
        };
        let line = serde_json::to_string(&record)?;

        let mut sink = self
            .sink
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if sink.is_none() {
            *sink = Some(self.open()?);
        }
        if let Some(writer) = sink.as_mut() {
            writeln!(writer, "{line}")?;
            writer.flush()?;
        }
        Ok(record)
    }

    fn open(&self) -> anyhow::Result<BufWriter<File>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_path())?;
        Ok(BufWriter::new(file))
    }
}

/// Reads every row of an event log back, oldest first.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<EventRecord>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::Value;

    use super::*;

    #[test]
    fn stage_rows_are_tagged_and_timestamped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "inv-42");

        let written = log.emit(PipelineEvent::StageEntered {
            stage: "budget_fitting".to_string(),
        })?;

        let raw: Value = serde_json::from_str(std::fs::read_to_string(&path)?.trim_end())?;
        assert_eq!(raw["type"], "stage_entered");
        assert_eq!(raw["stage"], "budget_fitting");
        assert_eq!(raw["invocation_id"], "inv-42");
        DateTime::parse_from_rfc3339(raw["ts"].as_str().unwrap_or_default())?;
        assert_eq!(read_events(&path)?, vec![written]);
        Ok(())
    }

    #[test]
    fn failure_and_anomaly_rows_keep_their_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "inv-7");

        log.emit(PipelineEvent::OrientationAnomaly {
            expected: [1024, 1024],
            actual: [1024, 768],
        })?;
        log.emit(PipelineEvent::GenerationFailed {
            stage: "submitting".to_string(),
            kind: "remote_error".to_string(),
            message: "rate limited".to_string(),
        })?;

        let rows = std::fs::read_to_string(&path)?;
        let rows: Vec<Value> = rows
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(rows[0]["type"], "orientation_anomaly");
        assert_eq!(rows[0]["actual"], serde_json::json!([1024, 768]));
        assert_eq!(rows[1]["type"], "generation_failed");
        assert_eq!(rows[1]["kind"], "remote_error");
        assert_eq!(rows[1]["stage"], "submitting");
        Ok(())
    }

    #[test]
    fn clones_share_one_file_and_fresh_logs_get_new_ids() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let log = EventLog::fresh(&path);
        let clone = log.clone();
        assert_ne!(log.invocation_id(), EventLog::fresh(&path).invocation_id());

        log.emit(PipelineEvent::StageEntered {
            stage: "preparing".to_string(),
        })?;
        clone.emit(PipelineEvent::GenerationFinished {
            width: 1024,
            height: 1024,
            scale: 1.0,
        })?;

        let rows = read_events(&path)?;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.invocation_id == log.invocation_id()));
        assert!(matches!(
            rows[1].event,
            PipelineEvent::GenerationFinished { width: 1024, .. }
        ));
        Ok(())
    }
}

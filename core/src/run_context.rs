/// Per-run diagnostics: JSONL event log, reasoning traces and metrics.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Something worth recording during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RunEvent {
    #[serde(rename_all = "camelCase")]
    PhaseStarted { phase: String, chunks: usize },
    #[serde(rename_all = "camelCase")]
    PhaseFinished { phase: String },
    #[serde(rename_all = "camelCase")]
    ChunkTranslated { chunk: usize, lines: usize },
    #[serde(rename_all = "camelCase")]
    ChunkSkipped { chunk: usize },
    #[serde(rename_all = "camelCase")]
    CheckFailed {
        chunk: usize,
        check: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ChunkValidated { chunk: usize, corrected: bool },
    #[serde(rename_all = "camelCase")]
    ChunkRejected {
        chunk: usize,
        check: String,
        lines: Vec<usize>,
    },
    #[serde(rename_all = "camelCase")]
    ServiceRetry {
        attempt: u32,
        kind: String,
        delay_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    CorrectionAttempt {
        label: String,
        strategy: String,
        accepted: bool,
    },
    #[serde(rename_all = "camelCase")]
    Saved {
        document: String,
        entries: usize,
        changed: bool,
    },
    #[serde(rename_all = "camelCase")]
    SaveFailed { document: String, error: String },
    #[serde(rename_all = "camelCase")]
    TaskFailed { chunk: usize, error: String },
    #[serde(rename_all = "camelCase")]
    ReconstructionMismatch { key: String, expected: usize, actual: usize },
    #[serde(rename_all = "camelCase")]
    QualityWarning { key: String, kind: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    #[serde(flatten)]
    pub event: RunEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub chunks_translated: u64,
    pub chunks_skipped: u64,
    pub chunks_validated: u64,
    pub chunks_corrected: u64,
    pub chunks_rejected: u64,
    pub lines_rejected: u64,
    pub service_retries: u64,
    pub correction_attempts: u64,
    pub correction_successes: u64,
    pub reasoning_traces: u64,
    pub saves: u64,
    pub save_errors: u64,
    pub task_failures: u64,
    pub reconstruction_mismatches: u64,
    pub quality_warnings: u64,
    pub failures_by_check: HashMap<String, u64>,
}

impl RunMetrics {
    fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::ChunkTranslated { .. } => self.chunks_translated += 1,
            RunEvent::ChunkSkipped { .. } => self.chunks_skipped += 1,
            RunEvent::CheckFailed { check, .. } => {
                *self.failures_by_check.entry(check.clone()).or_insert(0) += 1;
            }
            RunEvent::ChunkValidated { corrected, .. } => {
                self.chunks_validated += 1;
                if *corrected {
                    self.chunks_corrected += 1;
                }
            }
            RunEvent::ChunkRejected { lines, .. } => {
                self.chunks_rejected += 1;
                self.lines_rejected += lines.len() as u64;
            }
            RunEvent::ServiceRetry { .. } => self.service_retries += 1,
            RunEvent::CorrectionAttempt { accepted, .. } => {
                self.correction_attempts += 1;
                if *accepted {
                    self.correction_successes += 1;
                }
            }
            RunEvent::Saved { .. } => self.saves += 1,
            RunEvent::SaveFailed { .. } => self.save_errors += 1,
            RunEvent::TaskFailed { .. } => self.task_failures += 1,
            RunEvent::ReconstructionMismatch { .. } => self.reconstruction_mismatches += 1,
            RunEvent::QualityWarning { .. } => self.quality_warnings += 1,
            RunEvent::PhaseStarted { .. } | RunEvent::PhaseFinished { .. } => {}
        }
    }

    pub fn correction_success_rate(&self) -> f64 {
        if self.correction_attempts == 0 {
            0.0
        } else {
            self.correction_successes as f64 / self.correction_attempts as f64
        }
    }
}

/// Created once per run and shared by every component that reports diagnostics.
pub struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    event_log: Mutex<Option<BufWriter<File>>>,
    reasoning_log: Mutex<Option<BufWriter<File>>>,
    metrics: Mutex<RunMetrics>,
}

impl RunContext {
    /// A context that only keeps metrics in memory.
    pub fn detached() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            event_log: Mutex::new(None),
            reasoning_log: Mutex::new(None),
            metrics: Mutex::new(RunMetrics::default()),
        }
    }

    /// Opens `run-<date>-<id>.jsonl` and `reasoning-<date>-<id>.log` under `dir`.
    pub fn with_log_dir<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let context = Self::detached();
        fs::create_dir_all(dir.as_ref())?;
        let stamp = format!(
            "{}-{}",
            context.started_at.format("%Y%m%d"),
            &context.run_id.simple().to_string()[..8]
        );
        let events = open_append(&dir.as_ref().join(format!("run-{stamp}.jsonl")))?;
        let reasoning = open_append(&dir.as_ref().join(format!("reasoning-{stamp}.log")))?;
        if let Ok(mut guard) = context.event_log.lock() {
            *guard = Some(events);
        }
        if let Ok(mut guard) = context.reasoning_log.lock() {
            *guard = Some(reasoning);
        }
        Ok(context)
    }

    pub fn default_log_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ebook-translator")
            .join("logs")
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record(&self, event: RunEvent) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.apply(&event);
        }

        if let Ok(mut guard) = self.event_log.lock() {
            if let Some(writer) = guard.as_mut() {
                let entry = RunLogEntry {
                    timestamp: Utc::now(),
                    run_id: self.run_id,
                    event,
                };
                if let Ok(json) = serde_json::to_string(&entry) {
                    let _ = writeln!(writer, "{json}");
                    let _ = writer.flush();
                }
            }
        }
    }

    /// Keeps a reasoning-mode trace apart from the final answer.
    pub fn log_reasoning(&self, label: &str, reasoning: &str, answer: &str) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.reasoning_traces += 1;
        }
        log::debug!("reasoning trace for {label}: {} chars", reasoning.len());

        if let Ok(mut guard) = self.reasoning_log.lock() {
            if let Some(writer) = guard.as_mut() {
                let rule = "=".repeat(80);
                let _ = writeln!(
                    writer,
                    "{rule}\n[{}] {label}\n{rule}\nREASONING:\n{reasoning}\n{rule}\nRESPONSE:\n{answer}\n",
                    Utc::now().to_rfc3339()
                );
                let _ = writer.flush();
            }
        }
    }

    pub fn metrics(&self) -> RunMetrics {
        self.metrics
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn export_metrics_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.metrics())
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::detached()
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn metrics_follow_recorded_events() {
        let context = RunContext::detached();
        context.record(RunEvent::ChunkTranslated { chunk: 0, lines: 3 });
        context.record(RunEvent::CheckFailed {
            chunk: 0,
            check: "line_count".into(),
            message: "missing <2/>".into(),
        });
        context.record(RunEvent::ChunkValidated {
            chunk: 0,
            corrected: true,
        });
        context.record(RunEvent::ChunkRejected {
            chunk: 1,
            check: "punctuation".into(),
            lines: vec![4, 5],
        });
        context.record(RunEvent::CorrectionAttempt {
            label: "chunk 0".into(),
            strategy: "normal".into(),
            accepted: true,
        });

        let metrics = context.metrics();
        assert_eq!(metrics.chunks_translated, 1);
        assert_eq!(metrics.chunks_corrected, 1);
        assert_eq!(metrics.chunks_rejected, 1);
        assert_eq!(metrics.lines_rejected, 2);
        assert_eq!(metrics.failures_by_check.get("line_count"), Some(&1));
        assert_eq!(metrics.correction_success_rate(), 1.0);
    }

    #[test]
    fn writes_jsonl_events_and_reasoning_separately() {
        let dir = tempdir().unwrap();
        let context = RunContext::with_log_dir(dir.path()).unwrap();
        context.record(RunEvent::Saved {
            document: "ch1.xhtml".into(),
            entries: 2,
            changed: true,
        });
        context.log_reasoning("chunk 3", "thinking about <3/>", "<3/>Bonjour");

        let mut events = None;
        let mut reasoning = None;
        for entry in fs::read_dir(dir.path()).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if name.starts_with("run-") {
                events = Some(fs::read_to_string(&path).unwrap());
            } else if name.starts_with("reasoning-") {
                reasoning = Some(fs::read_to_string(&path).unwrap());
            }
        }

        let events = events.expect("event log");
        let entry: RunLogEntry = serde_json::from_str(events.lines().next().unwrap()).unwrap();
        assert_eq!(entry.run_id, context.run_id());
        assert!(matches!(entry.event, RunEvent::Saved { entries: 2, .. }));
        assert!(events.contains("\"event\":\"saved\""));

        let reasoning = reasoning.expect("reasoning log");
        assert!(reasoning.contains("thinking about <3/>"));
        assert!(!events.contains("thinking about"));
        assert_eq!(context.metrics().reasoning_traces, 1);
    }
}

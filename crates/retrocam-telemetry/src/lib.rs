use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use retrocam_core::{TelemetryEvent, TelemetrySink};
use serde::Serialize;

pub const SINK_ENV: &str = "RETROCAM_TELEMETRY_SINK";
pub const FILE_ENV: &str = "RETROCAM_TELEMETRY_FILE";
pub const ENDPOINT_ENV: &str = "RETROCAM_TELEMETRY_ENDPOINT";

pub fn sink_from_env() -> Option<Box<dyn TelemetrySink>> {
    let mode = std::env::var(SINK_ENV).ok()?;
    sink_for_mode(
        &mode,
        std::env::var(FILE_ENV).ok(),
        std::env::var(ENDPOINT_ENV).ok(),
    )
}

fn sink_for_mode(mode: &str, file: Option<String>, endpoint: Option<String>) -> Option<Box<dyn TelemetrySink>> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "stdout" => Some(Box::new(StdoutSink)),
        "log" => Some(Box::new(LogSink)),
        "file" => {
            let path = file.filter(|v| !v.trim().is_empty())?;
            Some(Box::new(FileSink::new(PathBuf::from(path))))
        }
        "http" => {
            let endpoint = endpoint.filter(|v| !v.trim().is_empty())?;
            let sink = HttpSink::new(endpoint);
            log::debug!("posting telemetry to {}", sink.endpoint());
            Some(Box::new(sink))
        }
        _ => None,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryEnvelope {
    event_type: String,
    stage: Option<String>,
    duration_ms: Option<u64>,
    detail: Option<String>,
}

impl From<&TelemetryEvent> for TelemetryEnvelope {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            event_type: format!("{:?}", event.event_type),
            stage: event.stage.map(|stage| stage.label().to_string()),
            duration_ms: event.duration_ms,
            detail: event.detail.clone(),
        }
    }
}

fn envelope_line(event: &TelemetryEvent) -> Option<String> {
    match serde_json::to_string(&TelemetryEnvelope::from(event)) {
        Ok(line) => Some(line),
        Err(err) => {
            log::warn!("unserializable telemetry event {:?}: {}", event.event_type, err);
            None
        }
    }
}

/// One JSON line per event on stdout.
pub struct StdoutSink;

impl TelemetrySink for StdoutSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{}", line);
        }
    }
}

/// Forwards events to the `log` facade under the `telemetry` target.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            log::info!(target: "telemetry", "{}", line);
        }
    }
}

/// Appends JSON lines to a file opened on the first event.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating telemetry directory {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening telemetry file {}", self.path.display()))
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut guard = self.file.lock().map_err(|_| anyhow!("telemetry file lock poisoned"))?;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        if let Some(file) = guard.as_mut() {
            writeln!(file, "{}", line).context("writing telemetry line")?;
        }
        Ok(())
    }
}

impl TelemetrySink for FileSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            if let Err(err) = self.append(&line) {
                log::warn!("dropping {:?} telemetry event: {:#}", event.event_type, err);
            }
        }
    }
}

/// Posts events from a background thread so `emit` never blocks the caller
/// or touches an async runtime.
pub struct HttpSink {
    endpoint: String,
    queue: Sender<TelemetryEnvelope>,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        let (queue, pending) = mpsc::channel::<TelemetryEnvelope>();
        let target = endpoint.clone();
        std::thread::spawn(move || {
            let client = Client::new();
            for payload in pending {
                if let Err(err) = client.post(&target).json(&payload).send() {
                    log::warn!("telemetry post to {} failed: {}", target, err);
                }
            }
        });
        Self { endpoint, queue }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl TelemetrySink for HttpSink {
    fn emit(&self, event: TelemetryEvent) {
        if self.queue.send(TelemetryEnvelope::from(&event)).is_err() {
            log::warn!("telemetry worker for {} is gone", self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrocam_core::{PipelineStage, TelemetryEventType};

    fn event() -> TelemetryEvent {
        TelemetryEvent {
            event_type: TelemetryEventType::StageSuccess,
            stage: Some(PipelineStage::Resample),
            duration_ms: Some(12),
            detail: None,
        }
    }

    #[test]
    fn envelope_uses_stage_label() {
        let json = serde_json::to_value(TelemetryEnvelope::from(&event())).expect("envelope should serialize");
        assert_eq!(json["eventType"], "StageSuccess");
        assert_eq!(json["stage"], "resample");
        assert_eq!(json["durationMs"], 12);
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested").join("telemetry.jsonl");
        let sink = FileSink::new(path.clone());
        sink.emit(event());
        sink.emit(event());
        let contents = std::fs::read_to_string(&path).expect("telemetry file should exist");
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().all(|line| line.contains("\"stage\":\"resample\"")));
    }

    #[test]
    fn file_sink_opens_lazily() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let sink = FileSink::new(dir.path().join("late").join("telemetry.jsonl"));
        assert!(!sink.path().exists());
        sink.emit(event());
        assert!(sink.path().exists());
    }

    #[test]
    fn http_sink_keeps_endpoint() {
        let sink = HttpSink::new("http://127.0.0.1:9/events".to_string());
        assert_eq!(sink.endpoint(), "http://127.0.0.1:9/events");
    }

    #[test]
    fn unknown_or_incomplete_modes_disable_telemetry() {
        assert!(sink_for_mode("carrier-pigeon", None, None).is_none());
        assert!(sink_for_mode("file", Some("  ".to_string()), None).is_none());
        assert!(sink_for_mode("http", None, None).is_none());
        assert!(sink_for_mode(" STDOUT ", None, None).is_some());
        assert!(sink_for_mode("log", None, None).is_some());
    }
}

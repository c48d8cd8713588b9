use std::io::Write;
use std::path::{Path, PathBuf};

use rein_core::AgentEvent;

pub fn sessions_dir() -> PathBuf {
    home_dir().join(".rein").join("sessions")
}

pub fn rein_dir() -> PathBuf {
    home_dir().join(".rein")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
}

/// Appends one JSON line per event to `~/.rein/sessions/<timestamp>.jsonl`.
pub struct SessionLogger {
    file: std::io::BufWriter<std::fs::File>,
    path: PathBuf,
}

impl SessionLogger {
    pub fn create(dir: &Path, model: &str, cwd: &Path, task: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let now = chrono::Local::now();
        let path = dir.join(format!("{}.jsonl", now.format("%Y%m%d_%H%M%S")));
        let file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        let mut logger = Self { file, path };
        logger.write_json(&serde_json::json!({
            "type": "session_start",
            "session_id": uuid::Uuid::new_v4().to_string(),
            "ts": now.to_rfc3339(),
            "model": model,
            "cwd": cwd.to_string_lossy(),
            "task": task,
        }))?;
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_json(&mut self, value: &serde_json::Value) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.file, value)?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    /// Text deltas are skipped; the full reply is visible on stdout.
    pub fn log_event(&mut self, event: &AgentEvent) {
        if matches!(event, AgentEvent::TextDelta { .. }) {
            return;
        }
        let mut value = serde_json::to_value(event).unwrap_or_default();
        if let serde_json::Value::Object(ref mut map) = value {
            map.insert(
                "ts".into(),
                serde_json::Value::String(chrono::Local::now().to_rfc3339()),
            );
        }
        if let Err(e) = self.write_json(&value) {
            tracing::warn!(error = %e, path = %self.path.display(), "session log write failed");
        }
    }
}

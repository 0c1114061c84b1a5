use crate::errors::ReplayError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), ReplayError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ReplayError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| ReplayError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ReplayError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| ReplayError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| ReplayError::Io(e.to_string()))
    }
}

struct RunLogger {
    file: Option<JsonlLogger>,
    verbose: bool,
    write_lock: Mutex<()>,
}

static RUN_LOGGER: OnceLock<Mutex<Option<Arc<RunLogger>>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<Arc<RunLogger>>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Route run events to `path` (when given) and mirror them on stderr.
/// Debug events reach stderr only when `verbose` is set.
pub fn init_run_logger(path: Option<&Path>, verbose: bool) {
    let state = Arc::new(RunLogger {
        file: path.map(JsonlLogger::new),
        verbose,
        write_lock: Mutex::new(()),
    });
    if let Ok(mut slot) = logger_slot().lock() {
        *slot = Some(state);
    }
}

pub fn clear_run_logger() {
    if let Ok(mut slot) = logger_slot().lock() {
        *slot = None;
    }
}

/// Record one structured event. A no-op until `init_run_logger` is called;
/// log I/O failures never fail the caller.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let state = match logger_slot().lock() {
        Ok(guard) => guard.as_ref().map(Arc::clone),
        Err(_) => None,
    };
    let Some(state) = state else {
        return;
    };
    let Ok(_guard) = state.write_lock.lock() else {
        return;
    };
    if level != "debug" || state.verbose {
        eprintln!("{}", structured_fallback_line(level, event_type, &payload));
    }
    if let Some(file) = &state.file {
        let _ = file.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

pub fn structured_fallback_line(level: &str, event_type: &str, payload: &Value) -> String {
    let mut line = format!("level={level} event={event_type}");
    if let Value::Object(fields) = payload {
        for (key, value) in fields {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            line.push_str(&format!(" {key}={}", rendered.replace('\n', "\\n")));
        }
    } else if !payload.is_null() {
        line.push_str(&format!(" payload={payload}"));
    }
    line
}

/// Banner framing a phase on the console, e.g.
/// `=============== STAGE RUN STARTING ===============`.
pub fn stage_banner(stage: &str, starting: bool) -> String {
    let message = if starting {
        format!(" STAGE {stage} STARTING ")
    } else {
        format!(" STAGE {stage} COMPLETED ")
    };
    format!("{message:=^60}")
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{stage_banner, structured_fallback_line, JsonlLogger, LogEvent};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("harness.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;

        logger
            .append(&LogEvent {
                level: "info",
                event_type: "fixture.download.started",
                payload: json!({"text": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"fixture.download.started\""));
        assert!(text.contains("..."));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn fallback_line_is_deterministic() {
        let line = structured_fallback_line(
            "info",
            "run.group.completed",
            &json!({"fixture": "a", "note": "x\ny", "runs": 2}),
        );
        assert_eq!(
            line,
            "level=info event=run.group.completed fixture=a note=x\\ny runs=2"
        );
    }

    #[test]
    fn stage_banner_is_centered_to_sixty_columns() {
        let banner = stage_banner("RUN", true);
        assert_eq!(banner.len(), 60);
        assert!(banner.contains(" STAGE RUN STARTING "));
        assert!(banner.starts_with('='));
    }
}

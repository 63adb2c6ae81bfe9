//! Indexing progress reporting.
//!
//! Reports observable progress during `ixh run work` so an operator sees
//! which run is being worked, how many batches and documents have landed,
//! and how the run ended. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts.

use std::io::Write;

use serde::Serialize;

/// A single progress event for an indexing run.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndexProgressEvent {
    /// Checkpoint resolved, first batch about to be pulled.
    Started {
        connector: String,
        run_id: i64,
        resumed: bool,
    },
    /// A batch completed and its checkpoint is durable.
    Batch {
        connector: String,
        run_id: i64,
        completed: u64,
        docs: u64,
    },
    /// The run reached a terminal status.
    Finished {
        connector: String,
        run_id: i64,
        status: String,
    },
}

/// Reports indexing progress. Implementations write to stderr (human or JSON).
pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// Human-friendly progress on stderr: "index fixture:docs  run 3  batch 12  1,234 docs".
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Started {
                connector,
                run_id,
                resumed,
            } => format!(
                "index {}  run {}  {}\n",
                connector,
                run_id,
                if *resumed { "resuming from checkpoint" } else { "starting" }
            ),
            IndexProgressEvent::Batch {
                connector,
                run_id,
                completed,
                docs,
            } => format!(
                "index {}  run {}  batch {}  {} docs\n",
                connector,
                run_id,
                format_number(*completed),
                format_number(*docs)
            ),
            IndexProgressEvent::Finished {
                connector,
                run_id,
                status,
            } => format!("index {}  run {}  {}\n", connector, run_id, status),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr, tagged
/// by `event`.
pub struct JsonProgress;

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

/// `1234567` → `"1,234,567"`.
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let lead = digits.len() % 3;
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thousands_separators() {
        assert_eq!(format_number(7), "7");
        assert_eq!(format_number(100), "100");
        assert_eq!(format_number(4096), "4,096");
        assert_eq!(format_number(15_000_000), "15,000,000");
    }

    #[test]
    fn json_events_are_tagged() {
        let event = IndexProgressEvent::Batch {
            connector: "fixture:docs".to_string(),
            run_id: 3,
            completed: 2,
            docs: 10,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "batch");
        assert_eq!(value["run_id"], 3);
        assert_eq!(value["docs"], 10);
    }
}

//! Job progress reporting.
//!
//! Every stage publishes its position through [`StageProgress`]. The job
//! tracker in [`crate::jobs`] turns those calls into a stage-weighted
//! percentage, persists it to the job record and echoes it to a
//! [`ProgressReporter`] (stderr for humans, JSON lines for scripts, or
//! nothing). Progress is emitted on **stderr** so stdout remains parseable.

use async_trait::async_trait;
use std::io::Write;

use crate::error::PipelineResult;
use crate::models::JobKind;

/// Pipeline stage, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Extract,
    Reconcile,
    Parse,
    Tags,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Reconcile => "reconcile",
            Stage::Parse => "parse",
            Stage::Tags => "tags",
        }
    }

    /// Percentage window `[start, end]` this stage occupies within a job.
    ///
    /// Extraction and reconciliation share the first third, parsing the
    /// second, tag extraction the last. A tag-only job spends its whole
    /// range in [`Stage::Tags`].
    pub fn window(&self, kind: JobKind) -> (f64, f64) {
        match (kind, self) {
            (JobKind::Extract, Stage::Extract) => (0.0, 15.0),
            (JobKind::Extract, Stage::Reconcile) => (15.0, 33.0),
            (JobKind::Extract, Stage::Parse) => (33.0, 66.0),
            (JobKind::Extract, Stage::Tags) => (66.0, 100.0),
            (JobKind::Tags, Stage::Tags) => (0.0, 100.0),
            (JobKind::Tags, _) => (0.0, 0.0),
        }
    }
}

/// Overall job percentage after `n` of `total` items of `stage`.
pub fn stage_percent(kind: JobKind, stage: Stage, n: u64, total: u64) -> f64 {
    let (start, end) = stage.window(kind);
    if total == 0 {
        return end;
    }
    let fraction = (n.min(total) as f64) / (total as f64);
    start + (end - start) * fraction
}

/// Sink the pipeline stages report into.
#[async_trait]
pub trait StageProgress: Send + Sync {
    /// Record that `n` of `total` items of `stage` are done.
    ///
    /// Returns `PipelineError::Cancelled` once the job was revoked, which
    /// stages propagate to stop at the next item boundary.
    async fn advance(&self, stage: Stage, n: u64, total: u64, text: &str) -> PipelineResult<()>;
}

/// Progress sink that discards everything. Used for direct library calls.
pub struct Silent;

#[async_trait]
impl StageProgress for Silent {
    async fn advance(&self, _: Stage, _: u64, _: u64, _: &str) -> PipelineResult<()> {
        Ok(())
    }
}

/// A single progress event, as echoed to the terminal.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A stage moved forward.
    Stage {
        job_id: String,
        stage: Stage,
        n: u64,
        total: u64,
        percent: f64,
        text: String,
    },
    /// The job reached a terminal state.
    Finished {
        job_id: String,
        state: String,
        message: String,
    },
}

/// Echoes job progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: "[ 42%] parse  1,234 / 5,000  parsed page 7".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let line = match event {
            ProgressEvent::Stage {
                stage,
                n,
                total,
                percent,
                text,
                ..
            } => format!(
                "[{:>3.0}%] {:<9} {} / {}  {}\n",
                percent,
                stage.as_str(),
                format_number(*n),
                format_number(*total),
                text
            ),
            ProgressEvent::Finished { state, message, .. } => {
                format!("[done] {}  {}\n", state, message)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        let obj = match event {
            ProgressEvent::Stage {
                job_id,
                stage,
                n,
                total,
                percent,
                text,
            } => serde_json::json!({
                "event": "progress",
                "job_id": job_id,
                "stage": stage.as_str(),
                "n": n,
                "total": total,
                "percent": percent,
                "text": text
            }),
            ProgressEvent::Finished {
                job_id,
                state,
                message,
            } => serde_json::json!({
                "event": "finished",
                "job_id": job_id,
                "state": state,
                "message": message
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

//! Comparison progress events and reporters.
//!
//! The orchestrator sends typed [`ProgressEvent`]s on an unbounded tokio
//! channel ([`ProgressSink`]). A dropped receiver never fails a job:
//! [`emit`] ignores send errors.
//!
//! The CLI drains the channel into a [`ProgressReporter`] chosen by
//! `--progress`. Reporters write to **stderr** so stdout remains parseable
//! for scripts.

use std::io::Write;

use relate_core::models::ComparisonJob;
use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Milestones of a single comparison.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    IndexingSource,
    IndexingTarget,
    Retrieval,
    Classification,
    Complete,
}

impl Stage {
    /// Percentage reported when the stage begins.
    pub fn percent(self) -> u8 {
        match self {
            Stage::IndexingSource => 10,
            Stage::IndexingTarget => 30,
            Stage::Retrieval => 50,
            Stage::Classification => 70,
            Stage::Complete => 100,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::IndexingSource => "indexing source",
            Stage::IndexingTarget => "indexing target",
            Stage::Retrieval => "retrieval",
            Stage::Classification => "classification",
            Stage::Complete => "complete",
        }
    }
}

/// Highest percentage reported while classification is still running.
pub const CLASSIFICATION_CEILING: u8 = 95;

/// Percentage for `done` of `total` classification units.
pub fn classification_percent(done: usize, total: usize) -> u8 {
    let start = Stage::Classification.percent() as usize;
    let span = (CLASSIFICATION_CEILING - Stage::Classification.percent()) as usize;
    if total == 0 {
        return CLASSIFICATION_CEILING;
    }
    (start + span * done.min(total) / total) as u8
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A comparison reached a milestone.
    Stage {
        source: String,
        target: String,
        stage: Stage,
        percent: u8,
        message: String,
    },
    /// An automatic sweep job changed state.
    Job(ComparisonJob),
}

pub type ProgressSink = UnboundedSender<ProgressEvent>;

/// Send `event` if a sink is attached.
pub fn emit(sink: Option<&ProgressSink>, event: ProgressEvent) {
    if let Some(sink) = sink {
        let _ = sink.send(event);
    }
}

/// Renders progress events.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: "compare a → b  [ 50%] retrieving candidates".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let line = match event {
            ProgressEvent::Stage {
                source,
                target,
                percent,
                message,
                ..
            } => format!("compare {} → {}  [{:>3}%] {}\n", source, target, percent, message),
            ProgressEvent::Job(job) => format!(
                "job {} → {}  {:<8} [{:>3}%] {}\n",
                job.source_corpus_id,
                job.target_corpus_id,
                job.status.as_str(),
                job.progress,
                job.message
            ),
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
        if let Ok(line) = serde_json::to_string(event) {
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

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Drain `rx` into `reporter` until every sender is dropped.
pub fn spawn_reporter(
    reporter: Box<dyn ProgressReporter>,
    mut rx: UnboundedReceiver<ProgressEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            reporter.report(&event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_stage_milestones_increase() {
        let stages = [
            Stage::IndexingSource,
            Stage::IndexingTarget,
            Stage::Retrieval,
            Stage::Classification,
            Stage::Complete,
        ];
        assert!(stages.windows(2).all(|w| w[0].percent() < w[1].percent()));
    }

    #[test]
    fn test_classification_percent_bounds() {
        assert_eq!(classification_percent(0, 10), 70);
        assert_eq!(classification_percent(5, 10), 82);
        assert_eq!(classification_percent(10, 10), 95);
        assert_eq!(classification_percent(11, 10), 95);
        assert_eq!(classification_percent(0, 0), 95);
    }

    #[test]
    fn test_event_json_shape() {
        let event = ProgressEvent::Stage {
            source: "a".into(),
            target: "b".into(),
            stage: Stage::Retrieval,
            percent: 50,
            message: "retrieving".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "stage");
        assert_eq!(value["stage"], "retrieval");

        let job = ProgressEvent::Job(ComparisonJob::new("a", "b"));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["event"], "job");
        assert_eq!(value["source_corpus_id"], "a");
    }

    #[test]
    fn test_emit_ignores_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        emit(Some(&tx), ProgressEvent::Job(ComparisonJob::new("a", "b")));
        emit(None, ProgressEvent::Job(ComparisonJob::new("a", "b")));
    }
}

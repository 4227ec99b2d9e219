//! Progress tracking for a package run
//!
//! `ProgressTracker` is the single owner of the run's counters. It is created
//! by the dispatcher and lent (`&mut`) to the executor, so every counter change
//! happens on the control thread. After each change the current fraction and
//! status line are pushed to a [`ProgressSink`].
//!
//! # Counters
//!
//! - `total`: fixed once preprocessing is done
//! - `completed`: never exceeds `total`
//! - `group_size`: entries in the step currently running, 0 between steps

use crate::types::Mode;
use serde::Serialize;
use std::io::Write;
use std::sync::mpsc::Sender;
use tracing::{debug, info};

/// Receiver of progress updates (installer UI, log, pipe)
pub trait ProgressSink: Send {
    /// Fraction of the run completed, in `[0, 1]`
    fn set_progress(&mut self, fraction: f64);
    /// Human-readable description of what is happening
    fn set_status(&mut self, status: &str);
}

/// A single update as seen by a sink
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "value", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress(f64),
    Status(String),
}

/// Sink that discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn set_progress(&mut self, _fraction: f64) {}
    fn set_status(&mut self, _status: &str) {}
}

/// Sink that writes updates to the tracing log
#[derive(Debug, Default)]
pub struct LogSink {
    last_status: String,
}

impl ProgressSink for LogSink {
    fn set_progress(&mut self, fraction: f64) {
        debug!("progress {:.1}%", fraction * 100.0);
    }

    fn set_status(&mut self, status: &str) {
        // Status is re-pushed on every counter change; only log transitions
        if status != self.last_status {
            info!("{}", status);
            self.last_status = status.to_string();
        }
    }
}

/// Sink that prints one JSON object per update on stdout
#[derive(Debug, Default)]
pub struct JsonLinesSink;

impl JsonLinesSink {
    fn emit(&self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        }
    }
}

impl ProgressSink for JsonLinesSink {
    fn set_progress(&mut self, fraction: f64) {
        self.emit(&ProgressEvent::Progress(fraction));
    }

    fn set_status(&mut self, status: &str) {
        self.emit(&ProgressEvent::Status(status.to_string()));
    }
}

/// Sink that forwards updates over a channel, e.g. to a UI thread
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn set_progress(&mut self, fraction: f64) {
        // Receiver gone means nobody is watching; the run goes on
        let _ = self.tx.send(ProgressEvent::Progress(fraction));
    }

    fn set_status(&mut self, status: &str) {
        let _ = self.tx.send(ProgressEvent::Status(status.to_string()));
    }
}

/// Counters of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    pub total: usize,
    pub completed: usize,
    pub group_size: usize,
    pub mode: Mode,
    /// Latest status line reported by the backend itself
    pub custom_message: Option<String>,
}

/// Owner of [`ProgressState`] and the sink it reports to
pub struct ProgressTracker {
    state: ProgressState,
    /// Inside a "package changes" / "hooks" section of backend output
    in_package_changes: bool,
    /// Fraction at the start of the running command, re-pushed on backend status lines
    baseline: f64,
    finished: bool,
    sink: Box<dyn ProgressSink>,
}

impl ProgressTracker {
    pub fn new(sink: Box<dyn ProgressSink>) -> Self {
        Self {
            state: ProgressState::default(),
            in_package_changes: false,
            baseline: 0.0,
            finished: false,
            sink,
        }
    }

    /// Tracker that reports nowhere
    pub fn detached() -> Self {
        Self::new(Box::new(NullSink))
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn total(&self) -> usize {
        self.state.total
    }

    pub fn completed(&self) -> usize {
        self.state.completed
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Start a run with `total` entries to process.
    pub fn init(&mut self, total: usize) {
        self.state = ProgressState {
            total,
            ..ProgressState::default()
        };
        self.in_package_changes = false;
        self.baseline = 0.0;
        self.finished = false;
        self.push();
    }

    /// A step of `size` entries starts under `mode`.
    pub fn begin_group(&mut self, mode: Mode, size: usize) {
        self.state.mode = mode;
        self.state.group_size = size;
        self.begin_command();
        self.push();
    }

    /// Reset the backend-output state before a new backend command.
    ///
    /// The baseline is taken from the counters as they are now, before the
    /// command's entries are counted as completed.
    pub fn begin_command(&mut self) {
        self.in_package_changes = false;
        self.baseline = self.fraction().unwrap_or(0.0);
    }

    /// The current operation is over.
    pub fn end_group(&mut self) {
        self.state.group_size = 0;
        self.state.mode = Mode::None;
        self.push();
    }

    /// Count `n` more entries as completed.
    pub fn advance(&mut self, n: usize) {
        self.state.completed = (self.state.completed + n).min(self.state.total);
        self.push();
    }

    /// `completed / total`, or `None` while there is nothing to count.
    pub fn fraction(&self) -> Option<f64> {
        if self.state.total == 0 {
            return None;
        }
        Some(self.state.completed as f64 / self.state.total as f64)
    }

    pub fn status(&self) -> String {
        if let Some(message) = &self.state.custom_message {
            return message.clone();
        }

        let n = self.state.group_size;
        match (n, self.state.mode) {
            (0, _) | (_, Mode::None) => {
                if self.state.total > 0 {
                    format!(
                        "Processing packages ({} / {})",
                        self.state.completed, self.state.total
                    )
                } else {
                    "Install packages.".to_string()
                }
            }
            (1, Mode::Install) => "Installing one package.".to_string(),
            (_, Mode::Install) => format!("Installing {} packages.", n),
            (1, Mode::Remove) => "Removing one package.".to_string(),
            (_, Mode::Remove) => format!("Removing {} packages.", n),
        }
    }

    /// Feed one line of backend output.
    ///
    /// A line starting with `":: "` enters a section when it mentions packages
    /// or hooks and leaves it otherwise. Inside a section, lines ending in
    /// `...` become the status message, labelled with `label`.
    pub fn observe_line(&mut self, label: &str, line: &str) {
        let line = line.trim_end_matches(['\n', '\r']);
        debug!("{}", line.trim());

        if line.starts_with(":: ") {
            self.in_package_changes = line.contains("package") || line.contains("hooks");
        } else if self.in_package_changes && line.ends_with("...") {
            let message = format!("{}: {}", label, line.trim());
            self.sink.set_status(&message);
            self.state.custom_message = Some(message);
            self.sink.set_progress(self.baseline);
        }
    }

    /// Report the end of the run: `1.0`, exactly once.
    ///
    /// With `total == 0` no ratio is ever computed.
    pub fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.state.mode = Mode::None;
        self.state.group_size = 0;
        self.sink.set_progress(1.0);
        self.sink.set_status(&self.status());
    }

    fn push(&mut self) {
        if let Some(fraction) = self.fraction() {
            self.sink.set_progress(fraction);
        }
        let status = self.status();
        self.sink.set_status(&status);
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("state", &self.state)
            .field("in_package_changes", &self.in_package_changes)
            .field("baseline", &self.baseline)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Receiver};

    fn tracker() -> (ProgressTracker, Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        (ProgressTracker::new(Box::new(ChannelSink::new(tx))), rx)
    }

    fn progress_values(rx: &Receiver<ProgressEvent>) -> Vec<f64> {
        rx.try_iter()
            .filter_map(|e| match e {
                ProgressEvent::Progress(f) => Some(f),
                ProgressEvent::Status(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_fraction_undefined_without_total() {
        let (mut t, rx) = tracker();
        t.init(0);
        assert_eq!(t.fraction(), None);
        assert_eq!(t.status(), "Install packages.");
        assert!(progress_values(&rx).is_empty());
    }

    #[test]
    fn test_status_priority() {
        let (mut t, _rx) = tracker();
        t.init(4);
        assert_eq!(t.status(), "Processing packages (0 / 4)");

        t.begin_group(Mode::Install, 1);
        assert_eq!(t.status(), "Installing one package.");
        t.begin_group(Mode::Install, 3);
        assert_eq!(t.status(), "Installing 3 packages.");
        t.begin_group(Mode::Remove, 1);
        assert_eq!(t.status(), "Removing one package.");
        t.begin_group(Mode::Remove, 2);
        assert_eq!(t.status(), "Removing 2 packages.");

        t.observe_line("pacman", ":: Processing package changes...");
        t.observe_line("pacman", "(1/2) removing nano...");
        assert_eq!(t.status(), "pacman: (1/2) removing nano...");
    }

    #[test]
    fn test_advance_saturates_at_total() {
        let (mut t, rx) = tracker();
        t.init(2);
        t.advance(1);
        t.advance(5);
        assert_eq!(t.completed(), 2);
        assert_eq!(progress_values(&rx), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_backend_lines_repush_baseline() {
        let (mut t, rx) = tracker();
        t.init(4);
        t.advance(1);
        t.begin_group(Mode::Install, 2);
        let _ = progress_values(&rx);

        t.observe_line("pacman", "resolving dependencies...");
        assert!(progress_values(&rx).is_empty(), "outside a section nothing is pushed");

        t.observe_line("pacman", ":: Processing package changes...\n");
        t.observe_line("pacman", "(1/2) installing vim...\n");
        t.observe_line("pacman", ":: Running post-transaction hooks...");
        t.observe_line("pacman", "(1/1) Arming ConditionNeedsUpdate...");
        assert_eq!(progress_values(&rx), vec![0.25, 0.25]);
        assert_eq!(t.completed(), 1);

        t.observe_line("pacman", ":: Retrieving databases");
        t.observe_line("pacman", "core is up to date...");
        assert!(progress_values(&rx).is_empty());
        assert_eq!(t.status(), "pacman: (1/1) Arming ConditionNeedsUpdate...");
    }

    #[test]
    fn test_begin_group_resets_section() {
        let (mut t, rx) = tracker();
        t.init(2);
        t.begin_group(Mode::Install, 1);
        t.observe_line("paru", ":: Processing package changes...");
        t.begin_group(Mode::Install, 1);
        let _ = progress_values(&rx);
        t.observe_line("paru", "installing foo...");
        assert!(progress_values(&rx).is_empty());
    }

    #[test]
    fn test_complete_pushes_one_exactly_once() {
        let (mut t, rx) = tracker();
        t.init(0);
        t.complete();
        t.complete();
        assert_eq!(progress_values(&rx), vec![1.0]);
        assert!(t.is_finished());
    }

    #[test]
    fn test_end_group_resets_group() {
        let (mut t, _rx) = tracker();
        t.init(3);
        t.begin_group(Mode::Remove, 3);
        t.advance(3);
        t.end_group();
        assert_eq!(t.state().group_size, 0);
        assert_eq!(t.state().mode, Mode::None);
        assert_eq!(t.status(), "Processing packages (3 / 3)");
    }

    #[test]
    fn test_progress_event_json() {
        let json = serde_json::to_string(&ProgressEvent::Status("x".into())).unwrap();
        assert_eq!(json, r#"{"event":"status","value":"x"}"#);
    }
}

//! Outbound notifications from the chat pipeline to whatever front-end is
//! listening. The pipeline never talks to a rendering surface directly; it
//! emits these over a channel and the host decides how to display them.

use std::path::PathBuf;
use uuid::Uuid;

/// Messages from the chat pipeline to the host UI thread
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// First delta of a response arrived; the turn can now be cancelled.
    /// Emitted exactly once per turn.
    ResponseStarted { turn: Uuid },
    /// A chunk of response text, in arrival order.
    ResponseDelta { turn: Uuid, text: String },
    /// The turn finished; `response` includes the timing footer.
    ResponseComplete { turn: Uuid, response: String },
    /// Every configured model was tried and failed. The message is also
    /// persisted as the turn's response.
    TurnFailed { turn: Uuid, message: String },
    /// The user cancelled mid-stream. Nothing was persisted; the notice
    /// reports how long the call ran before it was stopped.
    Interrupted { turn: Uuid, notice: String },
    /// Failover advanced to the named model.
    ModelSwitched { name: String },
    /// The response was diverted to a file instead of delta events.
    ResponseWrittenToFile { turn: Uuid, path: PathBuf },
    /// A new runnable code block was extracted from the stream.
    RunnableBlock { key: String, code: String },
    /// An approved block's process is running.
    RunStarted { key: String, pid: u32 },
    /// The screener blocked a run and the user did not override.
    RunRefused { key: String, reason: String },
    /// No process is associated with `key` any longer.
    RunFinished { key: String, outcome: RunOutcome },
    /// The mentioned-file cache changed; entries are newest first.
    ContextUpdated { entries: Vec<(PathBuf, String)> },
    /// A new ask was rejected because a turn is already streaming.
    Busy,
}

/// How a spawned program ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(i32),
    TimedOut,
    Killed,
    Failed(String),
}

impl RunOutcome {
    /// Marker line appended to the output log for this outcome.
    pub fn log_marker(&self, timeout_secs: u64) -> String {
        match self {
            RunOutcome::Exited(code) => format!("[exit code: {}]", code),
            RunOutcome::TimedOut => format!("[TIMEOUT: killed after {}s]", timeout_secs),
            RunOutcome::Killed => "[killed by user]".to_string(),
            RunOutcome::Failed(err) => format!("[failed to run: {}]", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RunOutcome;

    #[test]
    fn test_log_markers() {
        assert_eq!(RunOutcome::Exited(0).log_marker(60), "[exit code: 0]");
        assert_eq!(
            RunOutcome::TimedOut.log_marker(30),
            "[TIMEOUT: killed after 30s]"
        );
        assert_eq!(RunOutcome::Killed.log_marker(60), "[killed by user]");
        assert!(RunOutcome::Failed("no python".into())
            .log_marker(60)
            .contains("no python"));
    }
}

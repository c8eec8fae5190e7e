//! Sandboxed execution of extracted programs.
//!
//! Approved code is written to a fixed scratch file at the workspace root
//! and handed to the Python interpreter with the workspace path injected
//! into its environment. The child's output streams into an append-only
//! log as it arrives, so partial output survives a timeout kill. Runs are
//! spawned, never awaited by the caller; completion is reported over the
//! event channel.
//!
//! The scratch file and log are reused serially across runs. Two runs
//! dispatched back-to-back will interleave writes to the same log; that
//! is an accepted simplification.

use crate::events::{ChatEvent, RunOutcome};
use crate::safety::{ConfirmRun, SafetyScreener};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const SCRATCH_FILE: &str = "agent_program.py";
pub const OUTPUT_LOG: &str = "agent_output.log";

/// A live child process spawned for an extracted block. An entry exists in
/// the registry exactly as long as its process has not exited or been
/// reaped.
#[derive(Debug, Clone)]
pub struct RunningProcess {
    pub key: String,
    pub pid: u32,
    pub deadline: DateTime<Utc>,
    kill: Arc<Notify>,
}

type Registry = Arc<Mutex<HashMap<String, RunningProcess>>>;

/// Spawns and tracks interpreter processes for approved code blocks.
#[derive(Clone)]
pub struct ProgramRunner {
    workspace_root: PathBuf,
    screener: SafetyScreener,
    confirm: Arc<dyn ConfirmRun>,
    registry: Registry,
    events: Sender<ChatEvent>,
}

impl ProgramRunner {
    pub fn new(
        workspace_root: PathBuf,
        confirm: Arc<dyn ConfirmRun>,
        events: Sender<ChatEvent>,
    ) -> Self {
        Self {
            workspace_root,
            screener: SafetyScreener::new(),
            confirm,
            registry: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.workspace_root.join(OUTPUT_LOG)
    }

    /// Currently running processes, for display.
    pub fn running(&self) -> Vec<(String, u32)> {
        self.registry
            .lock()
            .map(|reg| reg.values().map(|p| (p.key.clone(), p.pid)).collect())
            .unwrap_or_default()
    }

    /// Screen the code, confirm if flagged, then spawn it with a hard
    /// wall-clock limit. Returns immediately; the run reports back through
    /// the event channel.
    pub fn execute(&self, key: String, code: String, timeout_secs: u64) {
        let runner = self.clone();
        let timeout = Duration::from_secs(timeout_secs);
        tokio::spawn(async move { runner.run_program(key, code, timeout).await });
    }

    /// Force-terminate a still-running process. Unknown keys are a no-op.
    pub fn kill(&self, key: &str) {
        if let Ok(registry) = self.registry.lock() {
            if let Some(process) = registry.get(key) {
                debug!("kill requested for {} (pid {})", key, process.pid);
                process.kill.notify_one();
            }
        }
    }

    async fn run_program(&self, key: String, code: String, timeout: Duration) {
        let matched = self.screener.screen(&code);
        if !matched.is_empty() {
            let confirm = self.confirm.clone();
            let code_for_prompt = code.clone();
            let matched_for_prompt = matched.clone();
            // The confirmation prompt blocks on user input
            let allowed = tokio::task::spawn_blocking(move || {
                confirm.confirm_run(&code_for_prompt, &matched_for_prompt)
            })
            .await
            .unwrap_or(false);

            if !allowed {
                let reason = matched.join(", ");
                debug!("run {} refused: {}", key, reason);
                let _ = self.events.send(ChatEvent::RunRefused { key, reason });
                return;
            }
        }

        let outcome = match self.spawn_and_wait(&key, &code, timeout).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Spawn faults are logged with a marker, never dropped
                warn!("run {} failed to start: {}", key, err);
                let outcome = RunOutcome::Failed(err.to_string());
                if let Err(log_err) =
                    append_log(&self.log_path(), &outcome.log_marker(timeout.as_secs()))
                {
                    warn!("could not write run log: {}", log_err);
                }
                outcome
            }
        };

        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(&key);
        }
        let _ = self.events.send(ChatEvent::RunFinished { key, outcome });
    }

    async fn spawn_and_wait(
        &self,
        key: &str,
        code: &str,
        timeout: Duration,
    ) -> anyhow::Result<RunOutcome> {
        let scratch = self.workspace_root.join(SCRATCH_FILE);
        tokio::fs::write(&scratch, code).await?;

        let mut child = Command::new(python_executable())
            .arg(SCRATCH_FILE)
            .current_dir(&self.workspace_root)
            .env("BASE_WORKSPACE_PATH", &self.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().unwrap_or_default();
        let kill = Arc::new(Notify::new());
        let deadline = Utc::now()
            + ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::seconds(0));

        if let Ok(mut registry) = self.registry.lock() {
            registry.insert(
                key.to_string(),
                RunningProcess {
                    key: key.to_string(),
                    pid,
                    deadline,
                    kill: kill.clone(),
                },
            );
        }
        debug!("run {} started (pid {})", key, pid);
        let _ = self.events.send(ChatEvent::RunStarted {
            key: key.to_string(),
            pid,
        });

        let log_path = self.log_path();
        append_log(
            &log_path,
            &format!("--- run {} ({}) ---", key, Utc::now().format("%Y-%m-%d %H:%M:%S UTC")),
        )?;

        // Stream both pipes into the log as output arrives, not at exit
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = spawn_log_copier(stdout, log_path.clone());
        let err_task = spawn_log_copier(stderr, log_path.clone());

        // Wait for exit, the deadline, or a user kill, whichever is first.
        // The arms leave `child` untouched so it can be reaped afterwards.
        let waited = tokio::select! {
            status = tokio::time::timeout(timeout, child.wait()) => Some(status),
            _ = kill.notified() => None,
        };

        let outcome = match waited {
            Some(Ok(Ok(status))) => RunOutcome::Exited(status.code().unwrap_or(-1)),
            Some(Ok(Err(err))) => RunOutcome::Failed(err.to_string()),
            Some(Err(_elapsed)) => {
                warn!("run {} exceeded {}s, killing", key, timeout.as_secs());
                let _ = child.start_kill();
                let _ = child.wait().await;
                RunOutcome::TimedOut
            }
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                RunOutcome::Killed
            }
        };

        // Pipes close when the child goes away, ending both copiers
        let _ = out_task.await;
        let _ = err_task.await;

        append_log(&log_path, &outcome.log_marker(timeout.as_secs()))?;
        Ok(outcome)
    }
}

/// Copy one child pipe into the log, line by line.
fn spawn_log_copier<R>(pipe: Option<R>, log_path: PathBuf) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(pipe) = pipe else { return };
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(err) = append_log(&log_path, &line) {
                warn!("could not append run output: {}", err);
                break;
            }
        }
    })
}

fn python_executable() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

/// Append a line to the run log; creates the log if needed.
fn append_log(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::DenyAll;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    struct AllowAll;

    impl ConfirmRun for AllowAll {
        fn confirm_run(&self, _code: &str, _matched: &[&'static str]) -> bool {
            true
        }
    }

    fn python_available() -> bool {
        std::process::Command::new(python_executable())
            .arg("--version")
            .output()
            .is_ok()
    }

    fn wait_for<F: Fn(&ChatEvent) -> bool>(
        rx: &mpsc::Receiver<ChatEvent>,
        pred: F,
    ) -> Option<ChatEvent> {
        let deadline = std::time::Instant::now() + StdDuration::from_secs(10);
        while std::time::Instant::now() < deadline {
            match rx.recv_timeout(StdDuration::from_millis(200)) {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        None
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refused_run_spawns_nothing() {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let runner = ProgramRunner::new(tmp.path().to_path_buf(), Arc::new(DenyAll), tx);

        runner.execute("k1".into(), "shutil.rmtree('/')".into(), 5);

        let event = wait_for(&rx, |e| matches!(e, ChatEvent::RunRefused { .. })).unwrap();
        match event {
            ChatEvent::RunRefused { key, reason } => {
                assert_eq!(key, "k1");
                assert!(reason.contains("destructive"));
            }
            _ => unreachable!(),
        }
        assert!(runner.running().is_empty());
        assert!(!tmp.path().join(SCRATCH_FILE).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_streams_output_and_marks_exit() {
        if !python_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let runner = ProgramRunner::new(tmp.path().to_path_buf(), Arc::new(AllowAll), tx);

        runner.execute("k1".into(), "print('hello from the sandbox')".into(), 30);

        let finished = wait_for(&rx, |e| matches!(e, ChatEvent::RunFinished { .. })).unwrap();
        match finished {
            ChatEvent::RunFinished { outcome, .. } => {
                assert_eq!(outcome, RunOutcome::Exited(0));
            }
            _ => unreachable!(),
        }
        assert!(runner.running().is_empty());

        let log = std::fs::read_to_string(tmp.path().join(OUTPUT_LOG)).unwrap();
        assert!(log.contains("hello from the sandbox"));
        assert!(log.contains("[exit code: 0]"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_kills_and_keeps_partial_output() {
        if !python_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let runner = ProgramRunner::new(tmp.path().to_path_buf(), Arc::new(AllowAll), tx);

        let code = "import time, sys\nprint('partial', flush=True)\ntime.sleep(30)";
        runner.execute("k1".into(), code.into(), 1);

        let finished = wait_for(&rx, |e| matches!(e, ChatEvent::RunFinished { .. })).unwrap();
        match finished {
            ChatEvent::RunFinished { outcome, .. } => assert_eq!(outcome, RunOutcome::TimedOut),
            _ => unreachable!(),
        }

        let log = std::fs::read_to_string(tmp.path().join(OUTPUT_LOG)).unwrap();
        assert!(log.contains("partial"));
        assert!(log.contains("[TIMEOUT: killed after 1s]"));
        assert!(runner.running().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kill_unknown_key_is_noop() {
        let tmp = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel();
        let runner = ProgramRunner::new(tmp.path().to_path_buf(), Arc::new(DenyAll), tx);
        runner.kill("nonexistent");
        assert!(runner.running().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spawn_failure_is_logged() {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let mut runner = ProgramRunner::new(tmp.path().to_path_buf(), Arc::new(AllowAll), tx);
        // Point the scratch directory somewhere unwritable to force a fault
        runner.workspace_root = tmp.path().join("does-not-exist");

        runner.execute("k1".into(), "print(1)".into(), 5);

        let finished = wait_for(&rx, |e| matches!(e, ChatEvent::RunFinished { .. })).unwrap();
        match finished {
            ChatEvent::RunFinished { outcome, .. } => {
                assert!(matches!(outcome, RunOutcome::Failed(_)));
            }
            _ => unreachable!(),
        }
    }
}

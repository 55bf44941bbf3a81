//! Child process supervision.
//!
//! Every encode, stream and recording process is spawned through a
//! [`ProcessPool`], which enforces the configured ceiling, and is owned by a
//! monitor task that reaps it. Callers hold a cloneable [`ProcessHandle`] that can
//! request a kill and observe the exit.

use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Error type for process operations
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Command template is empty")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process limit reached for {pool} ({limit} running)")]
    LimitReached { pool: String, limit: usize },
}

/// Bounded set of process slots.
#[derive(Debug, Clone)]
pub struct ProcessPool {
    name: String,
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ProcessPool {
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Get the number of free slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn running(&self) -> usize {
        self.limit - self.available()
    }

    /// Take a slot without waiting. Refuses when the ceiling is reached.
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, ProcessError> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| ProcessError::LimitReached {
                pool: self.name.clone(),
                limit: self.limit,
            })
    }
}

/// A resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Build a command from a template.
///
/// The template is split on whitespace first and each placeholder is then
/// substituted verbatim inside its argument, so substituted paths containing
/// spaces stay a single argument.
pub fn build_command(template: &str, vars: &[(&str, &str)]) -> Result<CommandSpec, ProcessError> {
    let mut parts = template.split_whitespace().map(|part| {
        vars.iter()
            .fold(part.to_string(), |acc, (key, value)| acc.replace(key, value))
    });

    let program = parts.next().ok_or(ProcessError::EmptyCommand)?;
    Ok(CommandSpec {
        program,
        args: parts.collect(),
    })
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    /// Terminated by a signal nobody in this process sent.
    Signaled,
    /// Killed on request.
    Killed,
    /// Waiting on the process failed.
    Error(String),
}

impl ProcessExit {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessExit::Exited(0))
    }

    pub fn describe(&self) -> String {
        match self {
            ProcessExit::Exited(code) => format!("exited with code {}", code),
            ProcessExit::Signaled => "terminated by signal".to_string(),
            ProcessExit::Killed => "killed".to_string(),
            ProcessExit::Error(e) => format!("process error: {}", e),
        }
    }
}

/// Cloneable handle to a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    label: String,
    pid: Option<u32>,
    kill_tx: Arc<watch::Sender<bool>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit status if the process has already been reaped.
    pub fn try_exit(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    /// Wait until the process has been reaped.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| ProcessExit::Error("monitor task ended".to_string()))
    }

    /// Kill the process and wait for it to be reaped. A no-op on an exited process.
    pub async fn kill(&self) -> ProcessExit {
        if self.is_running() {
            self.kill_tx.send_replace(true);
        }
        self.wait().await
    }
}

/// Spawn `spec` in a slot of `pool`.
///
/// Fails synchronously when the pool is full or the executable cannot be
/// started; the slot is released again in both cases.
pub fn spawn(pool: &ProcessPool, spec: &CommandSpec, label: impl Into<String>) -> Result<ProcessHandle, ProcessError> {
    let label = label.into();
    let permit = pool.try_acquire()?;

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    let pid = child.id();
    info!(process = %label, pid, command = %spec.display(), "process started");

    if let Some(stderr) = child.stderr.take() {
        let label = label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(process = %label, "{}", line);
            }
        });
    }

    let (kill_tx, mut kill_rx) = watch::channel(false);
    let (exit_tx, exit_rx) = watch::channel(None);

    let monitor_label = label.clone();
    tokio::spawn(async move {
        let kill_requested = async {
            if kill_rx.wait_for(|kill| *kill).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => match status.code() {
                    Some(code) => ProcessExit::Exited(code),
                    None => ProcessExit::Signaled,
                },
                Err(e) => ProcessExit::Error(e.to_string()),
            },
            _ = kill_requested => {
                if let Err(e) = child.kill().await {
                    warn!(process = %monitor_label, error = %e, "kill failed");
                }
                ProcessExit::Killed
            }
        };

        drop(permit);
        info!(process = %monitor_label, exit = %exit.describe(), "process ended");
        exit_tx.send_replace(Some(exit));
    });

    Ok(ProcessHandle {
        label,
        pid,
        kill_tx: Arc::new(kill_tx),
        exit_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_placeholder_value_stays_one_argument(
            value in "[a-zA-Z0-9 _/.-]{1,40}",
        ) {
            let spec = build_command("%FFMPEG% -i %INPUT% -y out.mp4", &[
                ("%FFMPEG%", "ffmpeg"),
                ("%INPUT%", value.as_str()),
            ]).unwrap();

            prop_assert_eq!(spec.program, "ffmpeg");
            prop_assert_eq!(spec.args.len(), 4);
            prop_assert_eq!(&spec.args[1], &value);
        }
    }

    #[test]
    fn test_build_command_substitutes_inside_arguments() {
        let spec = build_command(
            "%FFMPEG% -i %INPUT% -hls_segment_filename %streamFileDir%/stream%streamNum%-%09d.ts %OUTPUT%",
            &[
                ("%FFMPEG%", "/usr/bin/ffmpeg"),
                ("%INPUT%", "/rec/a.ts"),
                ("%streamFileDir%", "/srv/streamfiles"),
                ("%streamNum%", "3"),
                ("%OUTPUT%", "/srv/streamfiles/stream3.m3u8"),
            ],
        )
        .unwrap();

        assert_eq!(spec.program, "/usr/bin/ffmpeg");
        assert_eq!(
            spec.args,
            vec![
                "-i",
                "/rec/a.ts",
                "-hls_segment_filename",
                "/srv/streamfiles/stream3-%09d.ts",
                "/srv/streamfiles/stream3.m3u8",
            ]
        );
    }

    #[test]
    fn test_build_command_rejects_empty_template() {
        assert!(matches!(build_command("   ", &[]), Err(ProcessError::EmptyCommand)));
    }

    #[test]
    fn test_pool_refuses_above_limit() {
        let pool = ProcessPool::new("encode", 1);
        let permit = pool.try_acquire().unwrap();
        assert_eq!(pool.running(), 1);
        assert!(matches!(
            pool.try_acquire(),
            Err(ProcessError::LimitReached { limit: 1, .. })
        ));
        drop(permit);
        assert_eq!(pool.available(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_codes_are_reported() {
        let pool = ProcessPool::new("test", 2);

        let ok = spawn(&pool, &sh("exit 0"), "ok").unwrap();
        let bad = spawn(&pool, &sh("echo oops >&2; exit 3"), "bad").unwrap();

        assert_eq!(ok.wait().await, ProcessExit::Exited(0));
        assert_eq!(bad.wait().await, ProcessExit::Exited(3));
        assert!(ok.wait().await.is_success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_is_idempotent_and_frees_slot() {
        let pool = ProcessPool::new("test", 1);
        let handle = spawn(&pool, &sh("sleep 30"), "sleeper").unwrap();
        assert!(handle.is_running());
        assert!(matches!(
            spawn(&pool, &sh("exit 0"), "second"),
            Err(ProcessError::LimitReached { .. })
        ));

        assert_eq!(handle.kill().await, ProcessExit::Killed);
        assert_eq!(handle.clone().kill().await, ProcessExit::Killed);
        assert!(!handle.is_running());
        assert_eq!(pool.available(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_after_exit_keeps_exit_status() {
        let pool = ProcessPool::new("test", 1);
        let handle = spawn(&pool, &sh("exit 2"), "quick").unwrap();
        assert_eq!(handle.wait().await, ProcessExit::Exited(2));
        assert_eq!(handle.kill().await, ProcessExit::Exited(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_executable_fails_synchronously() {
        let pool = ProcessPool::new("test", 1);
        let spec = CommandSpec {
            program: "/nonexistent/recstation-test-binary".to_string(),
            args: vec![],
        };

        assert!(matches!(
            spawn(&pool, &spec, "missing"),
            Err(ProcessError::Spawn { .. })
        ));
        assert_eq!(pool.available(), 1);
    }
}

//! A supervised external process
//!
//! The child is owned by a monitor task. The handle can request
//! termination and observe the exit status; dropping the handle kills
//! the child.

use super::IngestError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Capture,
    Encode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Capture => write!(f, "capture"),
            Stage::Encode => write!(f, "encode"),
        }
    }
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exited on its own; `None` when killed by a signal
    Exited(Option<i32>),
    /// Terminated on request
    Killed,
}

impl ProcessStatus {
    pub fn describe(&self) -> String {
        match self {
            ProcessStatus::Running => "running".to_string(),
            ProcessStatus::Exited(Some(code)) => format!("exited with code {}", code),
            ProcessStatus::Exited(None) => "terminated by signal".to_string(),
            ProcessStatus::Killed => "killed".to_string(),
        }
    }
}

impl From<ExitStatus> for ProcessStatus {
    fn from(status: ExitStatus) -> Self {
        ProcessStatus::Exited(status.code())
    }
}

/// Called once from the monitor task when the process is gone
pub type ExitCallback = Box<dyn FnOnce(Stage, ProcessStatus) + Send + 'static>;

/// Which standard streams the caller wants piped
#[derive(Debug, Clone, Copy)]
pub struct StdioPlan {
    pub stdin: bool,
    pub stdout: bool,
}

/// Streams handed back to the caller after spawn
pub struct ChildIo {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
}

pub struct IngestProcess {
    pub stage: Stage,
    pub pid: Option<u32>,
    status: watch::Receiver<ProcessStatus>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl IngestProcess {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        stage: Stage,
        label: &str,
        program: &str,
        args: &[String],
        working_dir: Option<&Path>,
        plan: StdioPlan,
        stop_timeout: Duration,
        on_exit: ExitCallback,
    ) -> Result<(Self, ChildIo), IngestError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if plan.stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(if plan.stdout { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| IngestError::SpawnFailed {
            stage,
            program: program.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        info!("[{}] {} stage started: {} (pid {:?})", label, stage, program, pid);

        let io = ChildIo {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines(stderr, format!("{} {}", label, stage)));
        }

        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor(
            child,
            stage,
            label.to_string(),
            kill_rx,
            stop_timeout,
            status_tx,
            on_exit,
        ));

        Ok((
            Self {
                stage,
                pid,
                status: status_rx,
                kill_tx: Mutex::new(Some(kill_tx)),
            },
            io,
        ))
    }

    pub fn status(&self) -> ProcessStatus {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        *self.status.borrow() == ProcessStatus::Running
    }

    /// Request termination. Already-exited processes are ignored.
    pub fn terminate(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Wait until the process has exited
    pub async fn wait(&self) -> ProcessStatus {
        let mut rx = self.status.clone();
        let status = match rx.wait_for(|s| *s != ProcessStatus::Running).await {
            Ok(status) => status.clone(),
            Err(_) => ProcessStatus::Killed,
        };
        status
    }
}

async fn monitor(
    mut child: Child,
    stage: Stage,
    label: String,
    kill_rx: oneshot::Receiver<()>,
    stop_timeout: Duration,
    status_tx: watch::Sender<ProcessStatus>,
    on_exit: ExitCallback,
) {
    let status = tokio::select! {
        res = child.wait() => match res {
            Ok(status) => ProcessStatus::from(status),
            Err(e) => {
                warn!("[{}] {} stage wait failed: {}", label, stage, e);
                ProcessStatus::Exited(None)
            }
        },
        // Fires on an explicit terminate and when the handle is dropped
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!("[{}] {} stage kill: {}", label, stage, e);
            }
            match tokio::time::timeout(stop_timeout, child.wait()).await {
                Ok(_) => {}
                Err(_) => warn!("[{}] {} stage did not exit within {:?}", label, stage, stop_timeout),
            }
            ProcessStatus::Killed
        }
    };

    info!("[{}] {} stage {}", label, stage, status.describe());
    status_tx.send_replace(status.clone());
    on_exit(stage, status);
}

/// Log each line of a child stream
pub async fn log_lines<R: AsyncRead + Unpin>(stream: R, label: String) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("[{}] {}", label, line),
            Ok(None) => break,
            Err(e) => {
                debug!("[{}] stream error: {}", label, e);
                break;
            }
        }
    }
}

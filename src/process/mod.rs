//! Managed child processes.
//!
//! The server and exporter capabilities do not implement their services;
//! they translate configuration into a command line and run the real binary.
//! [`ProcessLauncher`] is the seam: production code uses
//! [`TokioProcessLauncher`], tests swap in a recording fake.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::{Child, Command};

/// Errors from launching or stopping a process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The binary could not be spawned.
    #[error("failed to launch '{program}': {message}")]
    Launch { program: String, message: String },

    /// The process did not exit within the grace period after being killed.
    #[error("process {pid} did not exit within {grace:?}")]
    ShutdownTimeout { pid: u32, grace: Duration },

    /// Waiting on or signalling the process failed.
    #[error("process i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Discard the child's stdout and stderr.
    pub quiet: bool,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// A running process owned by a capability.
#[async_trait]
pub trait ProcessHandle: Send + fmt::Debug {
    /// OS process id, when known.
    fn id(&self) -> Option<u32>;

    /// Whether the process is still alive.
    fn is_running(&mut self) -> bool;

    /// Terminate the process and wait up to `grace` for it to exit.
    /// Returns the exit code when one is available.
    async fn shutdown(&mut self, grace: Duration) -> Result<Option<i32>, ProcessError>;
}

/// Starts processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>, ProcessError>;
}

// ---------------------------------------------------------------------------
// tokio implementation
// ---------------------------------------------------------------------------

/// Launches real binaries through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessLauncher;

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn launch(&self, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        let output = || if spec.quiet { Stdio::null() } else { Stdio::inherit() };
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|e| ProcessError::Launch {
            program: spec.program.clone(),
            message: e.to_string(),
        })?;

        log::info!(
            "launched {} (pid {})",
            spec.command_line(),
            child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".into())
        );

        Ok(Box::new(TokioProcessHandle {
            program: spec.program.clone(),
            child,
        }))
    }
}

/// Handle over a `tokio::process::Child`.
pub struct TokioProcessHandle {
    program: String,
    child: Child,
}

impl fmt::Debug for TokioProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioProcessHandle")
            .field("program", &self.program)
            .field("pid", &self.child.id())
            .finish()
    }
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<Option<i32>, ProcessError> {
        if let Some(status) = self.child.try_wait()? {
            log::debug!("{} already exited with {}", self.program, status);
            return Ok(status.code());
        }

        let pid = self.child.id().unwrap_or_default();
        self.child.start_kill()?;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                log::info!("{} (pid {}) stopped: {}", self.program, pid, status);
                Ok(status.code())
            }
            Err(_) => Err(ProcessError::ShutdownTimeout { pid, grace }),
        }
    }
}

// ---------------------------------------------------------------------------
// Owned process slot
// ---------------------------------------------------------------------------

/// At most one running process owned by a capability.
#[derive(Debug, Default)]
pub struct ProcessSlot {
    handle: Option<Mutex<Box<dyn ProcessHandle>>>,
}

impl ProcessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch `spec` unless a process is already held and alive.
    /// Returns `false` when an existing process was kept.
    pub async fn start(
        &mut self,
        launcher: &dyn ProcessLauncher,
        spec: &ProcessSpec,
    ) -> Result<bool, ProcessError> {
        if self.is_running() {
            return Ok(false);
        }
        let handle = launcher.launch(spec).await?;
        self.handle = Some(Mutex::new(handle));
        Ok(true)
    }

    /// Shut the held process down, if any. The slot is empty afterwards
    /// even when shutdown fails.
    pub async fn stop(&mut self, grace: Duration) -> Result<Option<i32>, ProcessError> {
        match self.handle.take() {
            Some(handle) => handle.into_inner().shutdown(grace).await,
            None => Ok(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |handle| handle.lock().is_running())
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|handle| handle.lock().id())
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// Records every launch and hands out in-memory handles.
    #[derive(Debug, Default)]
    pub struct RecordingLauncher {
        pub launched: Mutex<Vec<ProcessSpec>>,
        pub stopped: Arc<AtomicU32>,
        pub fail: AtomicBool,
        next_pid: AtomicU32,
    }

    impl RecordingLauncher {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            let launcher = Self::default();
            launcher.fail.store(true, Ordering::SeqCst);
            Arc::new(launcher)
        }

        pub fn launches(&self) -> Vec<ProcessSpec> {
            self.launched.lock().clone()
        }

        pub fn stop_count(&self) -> u32 {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcessLauncher for RecordingLauncher {
        async fn launch(&self, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProcessError::Launch {
                    program: spec.program.clone(),
                    message: "No such file or directory".into(),
                });
            }
            self.launched.lock().push(spec.clone());
            let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                pid,
                running: true,
                stopped: Arc::clone(&self.stopped),
            }))
        }
    }

    #[derive(Debug)]
    pub struct FakeHandle {
        pid: u32,
        running: bool,
        stopped: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ProcessHandle for FakeHandle {
        fn id(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn is_running(&mut self) -> bool {
            self.running
        }

        async fn shutdown(&mut self, _grace: Duration) -> Result<Option<i32>, ProcessError> {
            if self.running {
                self.running = false;
                self.stopped.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Some(0))
        }
    }
}

//! Process exit detection.
//!
//! The monitor task owns the child and awaits its exit notification from the runtime.
//! Termination requests reach the child through the monitor, so nothing else ever holds
//! the process.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Windows `STATUS_DLL_NOT_FOUND` as a signed exit code.
pub const STATUS_DLL_NOT_FOUND: i32 = 0xC000_0135_u32 as i32;

/// Windows `STATUS_ACCESS_VIOLATION` as a signed exit code.
pub const STATUS_ACCESS_VIOLATION: i32 = 0xC000_0005_u32 as i32;

/// Raw exit information reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        ProcessExit {
            code: status.code(),
            signal,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with status 0
    GracefulExit(i32),
    /// Non-zero exit, signal, or lost exit status
    Crash {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl Termination {
    pub fn classify(exit: ProcessExit) -> Self {
        match exit.code {
            Some(0) => Termination::GracefulExit(0),
            code => Termination::Crash {
                code,
                signal: exit.signal,
            },
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, Termination::Crash { .. })
    }

    /// Human-readable cause, with hints for the common Windows loader failures.
    pub fn describe(&self) -> String {
        match *self {
            Termination::GracefulExit(code) => format!("Agent exited with code {}", code),
            Termination::Crash {
                code: Some(STATUS_DLL_NOT_FOUND),
                ..
            } => "Agent failed: a required DLL was not found. \
                  Install the CUDA 12.x runtime or update the GPU driver."
                .to_string(),
            Termination::Crash {
                code: Some(STATUS_ACCESS_VIOLATION),
                ..
            } => "Agent crashed with an access violation. \
                  Try fewer GPU layers (gpu_layers=0 runs on CPU only)."
                .to_string(),
            Termination::Crash {
                code: Some(code), ..
            } => format!("Agent exited with code {}", code),
            Termination::Crash {
                signal: Some(signal),
                ..
            } => format!("Agent was terminated by signal {}", signal),
            Termination::Crash { .. } => "Agent was terminated".to_string(),
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// A running agent process.
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, while known.
    fn id(&self) -> Option<u32>;

    /// Wait for exit. Must be cancel safe.
    async fn wait(&mut self) -> std::io::Result<ProcessExit>;

    /// Ask the process to exit (SIGTERM where available).
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Force the process down without waiting.
    fn start_kill(&mut self) -> std::io::Result<()>;
}

/// [`ChildProcess`] over a tokio child.
pub struct TokioChild {
    child: tokio::process::Child,
}

impl TokioChild {
    pub fn new(child: tokio::process::Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl ChildProcess for TokioChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        self.child.wait().await.map(ProcessExit::from)
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        send_terminate(&mut self.child)
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut tokio::process::Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from),
        // already reaped
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut tokio::process::Child) -> std::io::Result<()> {
    child.start_kill()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    Terminate,
    Kill,
}

/// Background task that owns a child and reports its termination once.
pub struct TerminationMonitor {
    control: mpsc::UnboundedSender<MonitorCommand>,
}

impl TerminationMonitor {
    /// Start watching `child`. `on_exit` runs exactly once, after the process is gone.
    pub fn spawn<F, Fut>(mut child: Box<dyn ChildProcess>, on_exit: F) -> Self
    where
        F: FnOnce(Termination) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (control, mut commands) = mpsc::unbounded_channel();
        let pid = child.id();

        // detached; dropping every monitor handle closes `control`, which kills the child
        tokio::spawn(async move {
            let mut control_open = true;

            let exit = loop {
                tokio::select! {
                    result = child.wait() => {
                        break match result {
                            Ok(exit) => exit,
                            Err(e) => {
                                warn!("Lost exit status of agent {:?}: {}", pid, e);
                                ProcessExit::default()
                            }
                        };
                    }
                    command = commands.recv(), if control_open => {
                        let result = match command {
                            Some(MonitorCommand::Terminate) => {
                                debug!("Sending terminate to agent {:?}", pid);
                                child.terminate()
                            }
                            Some(MonitorCommand::Kill) => {
                                warn!("Force-killing agent {:?}", pid);
                                child.start_kill()
                            }
                            None => {
                                control_open = false;
                                child.start_kill()
                            }
                        };
                        if let Err(e) = result {
                            warn!("Failed to signal agent {:?}: {}", pid, e);
                        }
                    }
                }
            };

            let termination = Termination::classify(exit);
            debug!("Agent {:?} terminated: {:?}", pid, termination);
            on_exit(termination).await;
        });

        Self { control }
    }

    /// Request a graceful exit. Returns false once the monitor has finished.
    pub fn terminate(&self) -> bool {
        self.control.send(MonitorCommand::Terminate).is_ok()
    }

    /// Request a forced exit. Returns false once the monitor has finished.
    pub fn kill(&self) -> bool {
        self.control.send(MonitorCommand::Kill).is_ok()
    }
}

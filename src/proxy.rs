//! Transparent proxy supervision.
//!
//! The proxy is an external program (ss-redir by default) that must stay up
//! for the lifetime of the sidecar. [`ProxySupervisor`] launches it,
//! relays its output into the log, and relaunches it one restart delay
//! after every exit until the stop signal fires.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::shutdown::StopListener;

/// Delay between an exit and the next launch.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Program and arguments for the proxy process.
#[derive(Clone)]
pub struct ProxyCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl ProxyCommand {
    /// An arbitrary command.
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `ss-redir` relaying the local listener to the upstream server.
    pub fn shadowsocks(config: &ProxyConfig) -> Self {
        Self::new(
            &config.binary,
            [
                "-s".to_string(),
                config.server.clone(),
                "-p".to_string(),
                config.port.to_string(),
                "-b".to_string(),
                config.local_addr.to_string(),
                "-l".to_string(),
                config.local_port.to_string(),
                "-k".to_string(),
                config.password.clone(),
                "-m".to_string(),
                config.method.clone(),
            ],
        )
    }

    /// Program to execute.
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Arguments, including secrets.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn spawn(&self) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::proxy_launch(self.program.display().to_string(), e.to_string()))
    }
}

// Arguments carry the password.
impl fmt::Debug for ProxyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCommand")
            .field("program", &self.program)
            .field("args", &format_args!("[{} args]", self.args.len()))
            .finish()
    }
}

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// About to launch.
    Starting,
    /// Process is up.
    Running,
    /// Process exited; waiting to relaunch.
    Exited,
    /// Stop observed; terminating the process.
    Stopping,
    /// Done. Terminal.
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Exited => write!(f, "exited"),
            SupervisorState::Stopping => write!(f, "stopping"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Keeps the proxy process running until stopped.
pub struct ProxySupervisor {
    command: ProxyCommand,
    restart_delay: Duration,
    stop: StopListener,
    state: watch::Sender<SupervisorState>,
    launches: Arc<AtomicU32>,
}

/// Handle to a running [`ProxySupervisor`].
pub struct SupervisorHandle {
    state: watch::Receiver<SupervisorState>,
    launches: Arc<AtomicU32>,
    task: JoinHandle<Result<()>>,
}

impl ProxySupervisor {
    /// Create a supervisor for `command` that stops when `stop` fires.
    pub fn new(command: ProxyCommand, stop: StopListener) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self {
            command,
            restart_delay: RESTART_DELAY,
            stop,
            state,
            launches: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Override the delay between exit and relaunch.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Run the supervision loop on the current runtime.
    pub fn spawn(self) -> SupervisorHandle {
        let state = self.state.subscribe();
        let launches = Arc::clone(&self.launches);
        let task = tokio::spawn(self.run());
        SupervisorHandle {
            state,
            launches,
            task,
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    fn finish(&self) -> Result<()> {
        self.set_state(SupervisorState::Stopped);
        tracing::info!("proxy supervisor stopped");
        Ok(())
    }

    /// Returns `Ok` once stopped, or the error of a launch that failed.
    async fn run(mut self) -> Result<()> {
        loop {
            if self.stop.is_stopped() {
                return self.finish();
            }

            self.set_state(SupervisorState::Starting);
            let mut child = match self.command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(error = %e, "failed to launch proxy");
                    self.set_state(SupervisorState::Stopped);
                    return Err(e);
                }
            };
            let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(
                pid = ?child.id(),
                program = %self.command.program.display(),
                launch,
                "proxy started"
            );
            if let Some(stdout) = child.stdout.take() {
                relay_output(stdout, Stream::Stdout);
            }
            if let Some(stderr) = child.stderr.take() {
                relay_output(stderr, Stream::Stderr);
            }
            self.set_state(SupervisorState::Running);

            let exit = tokio::select! {
                biased;
                _ = self.stop.stopped() => None,
                status = child.wait() => Some(status),
            };

            match exit {
                None => {
                    self.set_state(SupervisorState::Stopping);
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill proxy");
                    }
                    return self.finish();
                }
                Some(status) => {
                    self.set_state(SupervisorState::Exited);
                    log_exit(status);
                }
            }

            tokio::select! {
                biased;
                _ = self.stop.stopped() => return self.finish(),
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }
    }
}

impl SupervisorHandle {
    /// Current supervisor state.
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Number of times the proxy was launched.
    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Wait for the supervisor to finish.
    ///
    /// Must not be polled again after it returned.
    pub async fn finished(&mut self) -> Result<()> {
        (&mut self.task)
            .await
            .map_err(|e| Error::proxy_launch("supervisor", e.to_string()))?
    }
}

fn log_exit(status: std::io::Result<ExitStatus>) {
    match status {
        Ok(status) => tracing::error!(%status, "proxy exited, restarting"),
        Err(e) => tracing::error!(error = %e, "failed to wait for proxy, restarting"),
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Forward each line of proxy output into the log.
fn relay_output<R>(reader: R, stream: Stream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match stream {
                    Stream::Stdout => tracing::info!(target: "proxy", "{}", line),
                    Stream::Stderr => tracing::error!(target: "proxy", "{}", line),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(stream = ?stream, error = %e, "stopped reading proxy output");
                    break;
                }
            }
        }
    });
}

//! Process-wide stop signal.
//!
//! A [`StopSignal`] is triggered at most once (by an OS signal or by the
//! orchestrator) and observed by any number of [`StopListener`]s.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::Result;

/// Trigger side of the stop signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger the signal. Returns `true` only for the call that actually
    /// flipped it; later calls are no-ops.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    /// Whether the signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new observer.
    pub fn listener(&self) -> StopListener {
        StopListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of the stop signal.
#[derive(Debug, Clone)]
pub struct StopListener {
    rx: watch::Receiver<bool>,
}

impl StopListener {
    /// Resolves once the signal is triggered (immediately if it already was).
    ///
    /// Also resolves when every [`StopSignal`] has been dropped, since nothing
    /// could trigger it anymore. Cancel safe.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    /// Whether the signal has been triggered.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Trigger `stop` on SIGHUP, SIGINT, SIGTERM or SIGQUIT.
///
/// Handlers are installed before this returns; the returned task keeps
/// running so repeated signals are absorbed.
pub fn spawn_signal_handler(stop: StopSignal) -> Result<JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = hangup.recv() => "SIGHUP",
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = terminate.recv() => "SIGTERM",
                Some(()) = quit.recv() => "SIGQUIT",
                else => break,
            };
            if stop.trigger() {
                info!(signal = name, "received signal, stopping");
            } else {
                info!(signal = name, "received signal, already stopping");
            }
        }
    }))
}

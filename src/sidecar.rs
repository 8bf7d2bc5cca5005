//! Sidecar orchestration.
//!
//! Startup order:
//!
//! 1. wait for the launcher's readiness marker
//! 2. open the hypervisor connection
//! 3. install signal handlers
//! 4. start the proxy supervisor
//! 5. subscribe to domain lifecycle events and mark the sidecar ready
//!
//! After that the sidecar reacts to events until stopped: an `Added` domain
//! gets its traffic redirected into the proxy, and a reconnect re-registers
//! the lifecycle callback.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SidecarConfig;
use crate::domain::{DomainRecord, LifecycleEvent};
use crate::error::{Error, Result};
use crate::hypervisor::{Hypervisor, LibvirtConnection};
use crate::iptables::{install_redirect, IptablesCli, RuleStore};
use crate::monitor::DomainMonitor;
use crate::proxy::{ProxyCommand, ProxySupervisor, SupervisorHandle};
use crate::readiness::{self, LAUNCHER_POLL_INTERVAL};
use crate::shutdown::{self, StopSignal};

/// Delay before retrying a failed lifecycle re-registration.
pub const RESUBSCRIBE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Run the sidecar against libvirt and the system iptables until a
/// termination signal arrives.
pub async fn run(config: SidecarConfig) -> Result<()> {
    config.validate()?;
    match serde_json::to_string(&config) {
        Ok(json) => info!(config = %json, "starting proxy sidecar"),
        Err(e) => debug!(error = %e, "could not serialize config"),
    }

    readiness::wait_launcher_ready(
        &config.launcher_readiness_file,
        config.launcher_check_times,
        LAUNCHER_POLL_INTERVAL,
    )
    .await?;

    let uri = config.libvirt_uri.clone();
    let timeout = config.connect_timeout;
    let conn = tokio::task::spawn_blocking(move || LibvirtConnection::open(&uri, timeout))
        .await
        .map_err(|e| Error::HypervisorUnavailable(e.to_string()))??;

    let stop = StopSignal::new();
    let _signals = shutdown::spawn_signal_handler(stop.clone())?;

    let proxy = ProxyCommand::shadowsocks(&config.proxy);
    Sidecar::new(config, Arc::new(conn), Arc::new(IptablesCli::new()))
        .run(&stop, proxy)
        .await
}

/// The event loop tying monitor, redirect and proxy together.
pub struct Sidecar<H: Hypervisor, S: RuleStore + 'static> {
    config: SidecarConfig,
    conn: Arc<H>,
    rules: Arc<S>,
}

impl<H: Hypervisor, S: RuleStore + 'static> Sidecar<H, S> {
    /// Create a sidecar over an open connection and a rule store.
    pub fn new(config: SidecarConfig, conn: Arc<H>, rules: Arc<S>) -> Self {
        Self {
            config,
            conn,
            rules,
        }
    }

    /// Supervise `proxy` and handle domain events until `stop` fires.
    ///
    /// Returns an error when the proxy cannot be launched or the lifecycle
    /// subscription fails. Returns only after the proxy has been stopped.
    pub async fn run(self, stop: &StopSignal, proxy: ProxyCommand) -> Result<()> {
        let mut stopped = stop.listener();
        let mut supervisor = ProxySupervisor::new(proxy, stop.listener()).spawn();

        let (monitor, mut events) =
            match DomainMonitor::subscribe(Arc::clone(&self.conn), self.config.identity.clone())
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => return self.abort(stop, supervisor, e).await,
            };
        let mut reconnects = self.conn.take_reconnect_notifications();

        if let Err(e) = readiness::mark_ready(&self.config.sidecar_readiness_file) {
            return self.abort(stop, supervisor, e).await;
        }
        info!(domain = %self.config.identity.full_name(), "proxy sidecar ready");

        let domain_deadline = tokio::time::sleep(self.config.domain_timeout);
        tokio::pin!(domain_deadline);
        let mut domain_added = false;
        let mut deadline_reported = false;

        let resubscribe_retry = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(resubscribe_retry);
        let mut resubscribe_pending = false;

        loop {
            tokio::select! {
                biased;
                _ = stopped.stopped() => break,
                result = supervisor.finished() => {
                    // The supervisor only finishes on its own when the proxy
                    // cannot be launched.
                    result?;
                    stopped.stopped().await;
                    return Ok(());
                }
                Some(()) = next_reconnect(&mut reconnects) => {
                    warn!("hypervisor connection re-established, re-registering lifecycle callback");
                    resubscribe_pending = !resubscribe(&monitor).await;
                    if resubscribe_pending {
                        resubscribe_retry.as_mut().reset(Instant::now() + RESUBSCRIBE_RETRY_INTERVAL);
                    }
                }
                _ = &mut resubscribe_retry, if resubscribe_pending => {
                    resubscribe_pending = !resubscribe(&monitor).await;
                    if resubscribe_pending {
                        resubscribe_retry.as_mut().reset(Instant::now() + RESUBSCRIBE_RETRY_INTERVAL);
                    }
                }
                event = events.recv() => match event {
                    Some(LifecycleEvent::Added(record)) => {
                        domain_added = true;
                        self.redirect(&record).await;
                    }
                    Some(event) => {
                        debug!(event = event.kind(), state = %event.record().state, "ignoring lifecycle event");
                    }
                    None => {
                        warn!("lifecycle event stream closed");
                        stopped.stopped().await;
                        break;
                    }
                },
                _ = &mut domain_deadline, if !domain_added && !deadline_reported => {
                    deadline_reported = true;
                    warn!(
                        domain = %self.config.identity.full_name(),
                        timeout = %humantime::format_duration(self.config.domain_timeout),
                        "domain did not appear in time"
                    );
                }
            }
        }

        info!("stopping proxy sidecar");
        supervisor.finished().await
    }

    /// Stop the supervisor after a startup failure and report `err`.
    async fn abort(
        &self,
        stop: &StopSignal,
        mut supervisor: SupervisorHandle,
        err: Error,
    ) -> Result<()> {
        error!(error = %err, "proxy sidecar startup failed");
        stop.trigger();
        if let Err(e) = supervisor.finished().await {
            debug!(error = %e, "proxy supervisor also failed");
        }
        Err(err)
    }

    /// Point the domain's traffic at the proxy. Failures are logged; the
    /// next `Added` event retries.
    async fn redirect(&self, record: &DomainRecord) {
        match serde_json::to_string(record) {
            Ok(json) => info!(domain = %json, "domain added, installing redirect"),
            Err(_) => info!(domain = %record.identity.full_name(), "domain added, installing redirect"),
        }

        let rules = Arc::clone(&self.rules);
        let layout = self.config.redirect.clone();
        let destination = self.config.proxy.local_endpoint();
        let result =
            tokio::task::spawn_blocking(move || install_redirect(&*rules, &layout, destination))
                .await;

        match result {
            Ok(Ok(report)) => info!(
                source = %report.source,
                forwarded_ports = ?report.forwarded_ports,
                destination = %report.destination,
                "redirect installed"
            ),
            Ok(Err(e)) => error!(error = %e, "failed to install redirect"),
            Err(e) => error!(error = %e, "redirect task failed"),
        }
    }
}

/// Re-register the lifecycle callback. Returns `false` when it has to be
/// retried.
async fn resubscribe<H: Hypervisor>(monitor: &DomainMonitor<H>) -> bool {
    match monitor.resubscribe().await {
        Ok(()) => true,
        Err(e) => {
            error!(
                error = %e,
                retry_in = %humantime::format_duration(RESUBSCRIBE_RETRY_INTERVAL),
                "failed to re-register lifecycle callback"
            );
            false
        }
    }
}

/// Next reconnect notification; pends forever once there are none.
async fn next_reconnect(reconnects: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match reconnects {
        Some(rx) => match rx.recv().await {
            Some(()) => Some(()),
            None => {
                *reconnects = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}

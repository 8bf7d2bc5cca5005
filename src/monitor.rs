//! Turns raw hypervisor notifications into [`LifecycleEvent`]s.
//!
//! The hypervisor callback only enqueues [`DomainNotification`]s. A consumer
//! task drops notifications for other domains, re-reads the authoritative
//! state of the watched domain and emits exactly one event per remaining
//! notification:
//!
//! - domain gone: `Deleted`
//! - state lookup failed for another reason: `Modified` with the previous record
//! - defined/added or started/migrated: `Added`
//! - anything else: `Modified`

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::domain::{
    DomainConfig, DomainIdentity, DomainNotification, DomainRecord, DomainState, LifecycleEvent,
    StateReason,
};
use crate::error::{Error, Result};
use crate::hypervisor::{Hypervisor, NotificationSink};

/// Capacity of the lifecycle event stream.
pub const EVENT_QUEUE_CAPACITY: usize = 10;

/// Subscription to lifecycle events of one domain.
///
/// Dropping the monitor (and the receiver) ends the consumer task once the
/// hypervisor releases its callback.
pub struct DomainMonitor<H: Hypervisor> {
    conn: Arc<H>,
    sink: NotificationSink,
    identity: DomainIdentity,
}

impl<H: Hypervisor> DomainMonitor<H> {
    /// Register for lifecycle notifications of `identity` and start the
    /// consumer task.
    ///
    /// Fails when the callback cannot be registered.
    pub async fn subscribe(
        conn: Arc<H>,
        identity: DomainIdentity,
    ) -> Result<(Self, mpsc::Receiver<LifecycleEvent>)> {
        let (sink, notifications) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        register(&conn, sink.clone()).await?;

        let worker = Worker {
            conn: Arc::clone(&conn),
            domain: identity.full_name(),
            record: DomainRecord::new(identity.clone()),
        };
        tokio::spawn(worker.run(notifications, events_tx));

        info!(domain = %identity.full_name(), "watching domain lifecycle");
        Ok((
            Self {
                conn,
                sink,
                identity,
            },
            events_rx,
        ))
    }

    /// Re-register the lifecycle callback, e.g. after a reconnect.
    ///
    /// Replaces the previous registration; events keep flowing into the same
    /// stream.
    pub async fn resubscribe(&self) -> Result<()> {
        register(&self.conn, self.sink.clone()).await?;
        info!(domain = %self.identity.full_name(), "re-registered lifecycle callback");
        Ok(())
    }
}

async fn register<H: Hypervisor>(conn: &Arc<H>, sink: NotificationSink) -> Result<()> {
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || conn.register_lifecycle(sink))
        .await
        .map_err(|e| Error::hypervisor("register lifecycle callback", e.to_string()))?
}

/// Outcome of re-reading the domain.
enum Lookup {
    Gone,
    Failed(Error),
    Found {
        state: DomainState,
        reason: StateReason,
        config: Option<DomainConfig>,
    },
}

struct Worker<H> {
    conn: Arc<H>,
    domain: String,
    record: DomainRecord,
}

impl<H: Hypervisor> Worker<H> {
    async fn run(
        mut self,
        mut notifications: mpsc::UnboundedReceiver<DomainNotification>,
        events: mpsc::Sender<LifecycleEvent>,
    ) {
        while let Some(notification) = notifications.recv().await {
            if notification.domain != self.domain {
                debug!(domain = %notification.domain, "ignoring event for other domain");
                continue;
            }
            info!(
                domain = %self.domain,
                kind = ?notification.kind,
                detail = notification.detail,
                "domain lifecycle event"
            );

            let lookup = self.lookup().await;
            let event = self.apply(&notification, lookup);
            debug!(event = event.kind(), state = %event.record().state, "emitting lifecycle event");

            if events.send(event).await.is_err() {
                debug!("lifecycle event stream closed");
                return;
            }
        }
    }

    async fn lookup(&self) -> Lookup {
        let conn = Arc::clone(&self.conn);
        let name = self.domain.clone();
        tokio::task::spawn_blocking(move || lookup(conn.as_ref(), &name))
            .await
            .unwrap_or_else(|e| Lookup::Failed(Error::hypervisor("lookup domain", e.to_string())))
    }

    fn apply(&mut self, notification: &DomainNotification, lookup: Lookup) -> LifecycleEvent {
        match lookup {
            Lookup::Gone => {
                self.record.mark_deleted();
                LifecycleEvent::Deleted(self.record.clone())
            }
            Lookup::Failed(e) => {
                error!(domain = %self.domain, error = %e, "could not read domain state");
                LifecycleEvent::Modified(self.record.clone())
            }
            Lookup::Found {
                state,
                reason,
                config,
            } => {
                self.record.set_state(state, reason);
                if let Some(config) = config {
                    self.record.config = Some(config);
                }
                if notification.materializes() {
                    LifecycleEvent::Added(self.record.clone())
                } else {
                    LifecycleEvent::Modified(self.record.clone())
                }
            }
        }
    }
}

fn lookup<H: Hypervisor>(conn: &H, name: &str) -> Lookup {
    let (state, reason) = match conn.domain_state(name) {
        Ok(state) => state,
        Err(e) if e.is_not_found() => return Lookup::Gone,
        Err(e) => return Lookup::Failed(e),
    };

    let config = match conn.domain_config(name) {
        Ok(config) => Some(config),
        Err(e) if e.is_not_found() || e.is_invalid_operation() => {
            debug!(domain = name, error = %e, "domain config unavailable, keeping previous");
            None
        }
        Err(e) => {
            error!(domain = name, error = %e, "could not read domain config");
            None
        }
    };

    Lookup::Found {
        state,
        reason,
        config,
    }
}

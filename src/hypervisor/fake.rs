//! Scriptable [`Hypervisor`] for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Hypervisor, NotificationSink, RECONNECT_QUEUE_CAPACITY};
use crate::domain::{DomainConfig, DomainNotification, DomainState, StateReason};
use crate::error::{Error, ErrorKind, Result};

/// What the fake answers for one domain.
#[derive(Debug, Clone)]
pub(crate) struct FakeDomain {
    pub state: std::result::Result<(DomainState, StateReason), ErrorKind>,
    pub config: std::result::Result<String, ErrorKind>,
}

impl FakeDomain {
    pub(crate) fn running(xml: &str) -> Self {
        Self {
            state: Ok((DomainState::Running, StateReason::Booted)),
            config: Ok(xml.to_string()),
        }
    }
}

pub(crate) struct FakeHypervisor {
    domains: Mutex<HashMap<String, FakeDomain>>,
    sink: Mutex<Option<NotificationSink>>,
    registrations: AtomicUsize,
    attempts: AtomicUsize,
    failing_registrations: AtomicUsize,
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FakeHypervisor {
    pub(crate) fn new() -> Self {
        let (reconnect_tx, reconnect_rx) = mpsc::channel(RECONNECT_QUEUE_CAPACITY);
        Self {
            domains: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            registrations: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            failing_registrations: AtomicUsize::new(0),
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
        }
    }

    pub(crate) fn set_domain(&self, name: &str, domain: FakeDomain) {
        self.domains.lock().insert(name.to_string(), domain);
    }

    pub(crate) fn remove_domain(&self, name: &str) {
        self.domains.lock().remove(name);
    }

    /// Push a notification through the registered callback.
    pub(crate) fn emit(&self, domain: &str, event: i32, detail: i32) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink
                .send(DomainNotification::new(domain, event, detail))
                .is_ok(),
            None => false,
        }
    }

    pub(crate) fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Registration attempts, failed ones included.
    pub(crate) fn registration_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make the next `count` registrations fail as if libvirtd were down.
    pub(crate) fn fail_next_registrations(&self, count: usize) {
        self.failing_registrations.store(count, Ordering::SeqCst);
    }

    pub(crate) fn signal_reconnect(&self) {
        let _ = self.reconnect_tx.try_send(());
    }

    fn error(kind: ErrorKind, operation: &str, name: &str) -> Error {
        match kind {
            ErrorKind::NotFound => Error::domain_not_found(name),
            ErrorKind::InvalidOperation => Error::invalid_operation(operation, "domain is migrating"),
            ErrorKind::Other => Error::hypervisor(operation, "connection reset"),
        }
    }
}

impl Hypervisor for FakeHypervisor {
    fn domain_state(&self, name: &str) -> Result<(DomainState, StateReason)> {
        let domains = self.domains.lock();
        let domain = domains
            .get(name)
            .ok_or_else(|| Error::domain_not_found(name))?;
        domain
            .state
            .map_err(|kind| Self::error(kind, "get domain state", name))
    }

    fn domain_config(&self, name: &str) -> Result<DomainConfig> {
        let domains = self.domains.lock();
        let domain = domains
            .get(name)
            .ok_or_else(|| Error::domain_not_found(name))?;
        domain
            .config
            .clone()
            .map(DomainConfig::from_xml)
            .map_err(|kind| Self::error(kind, "get domain xml", name))
    }

    fn register_lifecycle(&self, sink: NotificationSink) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_registrations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::HypervisorUnavailable(
                "qemu:///system: connection refused".to_string(),
            ));
        }
        *self.sink.lock() = Some(sink);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_reconnect_notifications(&self) -> Option<mpsc::Receiver<()>> {
        self.reconnect_rx.lock().take()
    }
}

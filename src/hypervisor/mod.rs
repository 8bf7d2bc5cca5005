//! Hypervisor access.
//!
//! [`Hypervisor`] is the narrow surface the monitor needs: authoritative
//! state lookups, lifecycle push notifications, and a way to learn that the
//! connection was re-established. [`LibvirtConnection`] implements it on top
//! of the libvirt C library, loaded at runtime.

mod event_loop;
#[cfg(test)]
pub(crate) mod fake;
mod ffi;
mod libvirt;

pub use libvirt::LibvirtConnection;

use tokio::sync::mpsc;

use crate::domain::{DomainConfig, DomainNotification, DomainState, StateReason};
use crate::error::Result;

/// Where the lifecycle callback pushes translated notifications.
///
/// Unbounded so the hypervisor's dispatch thread never blocks on a send.
pub type NotificationSink = mpsc::UnboundedSender<DomainNotification>;

/// Capacity of the reconnect notification queue.
pub const RECONNECT_QUEUE_CAPACITY: usize = 10;

/// Operations the domain monitor needs from the hypervisor.
///
/// All methods may block and are called from blocking threads.
pub trait Hypervisor: Send + Sync + 'static {
    /// Current state and reason of a domain.
    ///
    /// Fails with a NotFound-class error when the domain does not exist.
    fn domain_state(&self, name: &str) -> Result<(DomainState, StateReason)>;

    /// Current configuration snapshot of a domain.
    ///
    /// May fail with an InvalidOperation-class error while the domain is
    /// migrating.
    fn domain_config(&self, name: &str) -> Result<DomainConfig>;

    /// Register the lifecycle callback, replacing any earlier registration so
    /// at most one is active. Starts the event dispatch loop if needed.
    fn register_lifecycle(&self, sink: NotificationSink) -> Result<()>;

    /// Receiver signalled every time the connection is re-established.
    ///
    /// Returns `Some` once; later calls return `None`.
    fn take_reconnect_notifications(&self) -> Option<mpsc::Receiver<()>>;
}

//! Domain records and lifecycle events.
//!
//! A [`DomainRecord`] is this sidecar's view of the one VM it watches. The
//! monitor keeps it current and hands copies of it out inside
//! [`LifecycleEvent`]s.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the monitored VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainIdentity {
    /// VM name.
    pub name: String,
    /// Namespace the VM lives in.
    pub namespace: String,
    /// UID of the owning VM object.
    pub uid: String,
}

impl DomainIdentity {
    /// Create a new identity.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
        }
    }

    /// Name of the domain as libvirt knows it: `<namespace>_<name>`.
    pub fn full_name(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }
}

/// Domain lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DomainState {
    /// No state known (or the domain is gone).
    #[default]
    NoState,
    /// Running.
    Running,
    /// Blocked on a resource.
    Blocked,
    /// Paused by the user or the hypervisor.
    Paused,
    /// Being shut down.
    Shutdown,
    /// Shut off.
    Shutoff,
    /// Crashed.
    Crashed,
    /// Suspended by guest power management.
    PmSuspended,
}

impl DomainState {
    /// Convert a libvirt `virDomainState` code.
    pub fn from_libvirt(code: i32) -> Self {
        match code {
            1 => DomainState::Running,
            2 => DomainState::Blocked,
            3 => DomainState::Paused,
            4 => DomainState::Shutdown,
            5 => DomainState::Shutoff,
            6 => DomainState::Crashed,
            7 => DomainState::PmSuspended,
            _ => DomainState::NoState,
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainState::NoState => "nostate",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::PmSuspended => "pmsuspended",
        };
        f.write_str(s)
    }
}

/// Why the domain is in its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StateReason {
    /// Reason not reported.
    #[default]
    Unknown,
    /// The domain no longer exists.
    NonExistent,
    /// Normal boot.
    Booted,
    /// Migrated from or to another host.
    Migrated,
    /// Restored from a state file.
    Restored,
    /// Restored from a snapshot.
    FromSnapshot,
    /// Unpaused.
    Unpaused,
    /// Migration was canceled.
    MigrationCanceled,
    /// Save was canceled.
    SaveCanceled,
    /// Woken up from suspend.
    WakeUp,
    /// Crashed.
    Crashed,
    /// Running in post-copy migration mode.
    PostCopy,
    /// Paused or shut down by the user.
    User,
    /// Paused for an offline migration.
    Migration,
    /// Saved to a state file.
    Saved,
    /// Paused for a core dump.
    Dump,
    /// Paused after an I/O error.
    IoError,
    /// Paused by the watchdog.
    Watchdog,
    /// Paused while shutting down.
    ShuttingDown,
    /// Paused while creating a snapshot.
    Snapshot,
    /// Paused while starting up.
    StartingUp,
    /// Post-copy migration failed.
    PostCopyFailed,
    /// Shut down normally.
    Shutdown,
    /// Forcibly destroyed.
    Destroyed,
    /// Failed to start.
    Failed,
    /// Guest panicked.
    Panicked,
}

impl StateReason {
    /// Convert a libvirt reason code, which is interpreted per state.
    pub fn from_libvirt(state: DomainState, code: i32) -> Self {
        use StateReason::*;
        match state {
            DomainState::Running => match code {
                1 => Booted,
                2 => Migrated,
                3 => Restored,
                4 => FromSnapshot,
                5 => Unpaused,
                6 => MigrationCanceled,
                7 => SaveCanceled,
                8 => WakeUp,
                9 => Crashed,
                10 => PostCopy,
                _ => Unknown,
            },
            DomainState::Paused => match code {
                1 => User,
                2 => Migration,
                3 => Saved,
                4 => Dump,
                5 => IoError,
                6 => Watchdog,
                7 => FromSnapshot,
                8 => ShuttingDown,
                9 => Snapshot,
                10 => Crashed,
                11 => StartingUp,
                12 => PostCopy,
                13 => PostCopyFailed,
                _ => Unknown,
            },
            DomainState::Shutdown => match code {
                1 => User,
                _ => Unknown,
            },
            DomainState::Shutoff => match code {
                1 => Shutdown,
                2 => Destroyed,
                3 => Crashed,
                4 => Migrated,
                5 => Saved,
                6 => Failed,
                7 => FromSnapshot,
                _ => Unknown,
            },
            DomainState::Crashed => match code {
                1 => Panicked,
                _ => Unknown,
            },
            DomainState::NoState | DomainState::Blocked | DomainState::PmSuspended => Unknown,
        }
    }
}

/// Configuration snapshot reported by the hypervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain UUID from `<uuid>`.
    pub uuid: Option<String>,
    /// Owner UID recorded in the domain metadata (`<uid>`), when present.
    pub metadata_uid: Option<String>,
    /// Raw domain XML.
    #[serde(default, skip_serializing)]
    pub xml: String,
}

impl DomainConfig {
    /// Build a snapshot from domain XML.
    pub fn from_xml(xml: impl Into<String>) -> Self {
        let xml = xml.into();
        Self {
            uuid: element_text(&xml, "uuid"),
            metadata_uid: element_text(&xml, "uid"),
            xml,
        }
    }
}

/// Text of the first `<tag>...</tag>` element, ignoring any namespace prefix.
fn element_text(xml: &str, tag: &str) -> Option<String> {
    let mut rest = xml;
    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];
        let end = rest.find('>')?;
        let head = &rest[..end];
        let name = head.split_whitespace().next().unwrap_or_default();
        let local = name.rsplit(':').next().unwrap_or(name);
        if local == tag && !head.ends_with('/') {
            let body = &rest[end + 1..];
            let close = body.find("</")?;
            let text = body[..close].trim();
            return (!text.is_empty()).then(|| text.to_string());
        }
        rest = &rest[end + 1..];
    }
    None
}

/// The monitor's record of the watched VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Who the VM is.
    pub identity: DomainIdentity,
    /// Lifecycle state.
    pub state: DomainState,
    /// Reason for the state.
    pub reason: StateReason,
    /// Last configuration snapshot fetched from the hypervisor.
    pub config: Option<DomainConfig>,
}

impl DomainRecord {
    /// A fresh record with no known state.
    pub fn new(identity: DomainIdentity) -> Self {
        Self {
            identity,
            state: DomainState::NoState,
            reason: StateReason::Unknown,
            config: None,
        }
    }

    /// Update state and reason.
    pub fn set_state(&mut self, state: DomainState, reason: StateReason) {
        self.state = state;
        self.reason = reason;
    }

    /// Mark the domain as gone.
    pub fn mark_deleted(&mut self) {
        self.set_state(DomainState::NoState, StateReason::NonExistent);
    }

    /// Whether the hypervisor reported the domain as gone.
    pub fn is_deleted(&self) -> bool {
        self.reason == StateReason::NonExistent
    }
}

/// A normalized lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The domain materialized (defined, or started by an incoming migration).
    Added(DomainRecord),
    /// Something else about the domain changed.
    Modified(DomainRecord),
    /// The domain no longer exists.
    Deleted(DomainRecord),
}

impl LifecycleEvent {
    /// The record carried by this event.
    pub fn record(&self) -> &DomainRecord {
        match self {
            LifecycleEvent::Added(r) | LifecycleEvent::Modified(r) | LifecycleEvent::Deleted(r) => {
                r
            }
        }
    }

    /// Short name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::Added(_) => "added",
            LifecycleEvent::Modified(_) => "modified",
            LifecycleEvent::Deleted(_) => "deleted",
        }
    }
}

/// libvirt `virDomainEventType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Defined or updated.
    Defined,
    /// Undefined.
    Undefined,
    /// Started.
    Started,
    /// Suspended.
    Suspended,
    /// Resumed.
    Resumed,
    /// Stopped.
    Stopped,
    /// Shutdown in progress or finished.
    Shutdown,
    /// Suspended by guest power management.
    PmSuspended,
    /// Crashed.
    Crashed,
    /// Code this build does not know.
    Other(i32),
}

impl NotificationKind {
    /// Convert a libvirt event code.
    pub fn from_libvirt(code: i32) -> Self {
        match code {
            0 => NotificationKind::Defined,
            1 => NotificationKind::Undefined,
            2 => NotificationKind::Started,
            3 => NotificationKind::Suspended,
            4 => NotificationKind::Resumed,
            5 => NotificationKind::Stopped,
            6 => NotificationKind::Shutdown,
            7 => NotificationKind::PmSuspended,
            8 => NotificationKind::Crashed,
            other => NotificationKind::Other(other),
        }
    }
}

/// `VIR_DOMAIN_EVENT_DEFINED_ADDED`
pub const DEFINED_DETAIL_ADDED: i32 = 0;
/// `VIR_DOMAIN_EVENT_STARTED_MIGRATED`
pub const STARTED_DETAIL_MIGRATED: i32 = 1;

/// A raw lifecycle notification as pushed by the hypervisor.
///
/// Carries only opaque codes; the monitor resolves actual state itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainNotification {
    /// Name of the domain the notification is about.
    pub domain: String,
    /// Event type.
    pub kind: NotificationKind,
    /// Event detail, interpreted per kind.
    pub detail: i32,
}

impl DomainNotification {
    /// Create a notification from libvirt codes.
    pub fn new(domain: impl Into<String>, event: i32, detail: i32) -> Self {
        Self {
            domain: domain.into(),
            kind: NotificationKind::from_libvirt(event),
            detail,
        }
    }

    /// Whether this notification means the domain just materialized on this
    /// host: freshly defined, or started by an incoming migration.
    pub fn materializes(&self) -> bool {
        matches!(
            (self.kind, self.detail),
            (NotificationKind::Defined, DEFINED_DETAIL_ADDED)
                | (NotificationKind::Started, STARTED_DETAIL_MIGRATED)
        )
    }
}

//! proxy-sidecar - transparent proxy sidecar for libvirt VMs
//!
//! Runs next to a VM launcher, watches the VM's libvirt domain and, once the
//! domain materializes, rewrites the pod's `nat` table so every TCP
//! connection the VM originates goes through a locally supervised
//! transparent proxy. Inbound port forwards set up by the launcher keep
//! working.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  sidecar (orchestration, readiness, signals)             │
//! ├───────────────┬───────────────────┬──────────────────────┤
//! │  monitor      │  iptables         │  proxy               │
//! │  (lifecycle   │  (redirect over a │  (supervised         │
//! │   events)     │   RuleStore)      │   ss-redir)          │
//! ├───────────────┴───────────────────┴──────────────────────┤
//! │  hypervisor (libvirt via dlopen)                         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use proxy_sidecar::config::{ProxyConfig, SidecarConfig};
//! use proxy_sidecar::DomainIdentity;
//!
//! # async fn run() -> proxy_sidecar::Result<()> {
//! let config = SidecarConfig::new(
//!     DomainIdentity::new("vm1", "default", "1b2c3d"),
//!     ProxyConfig::new("proxy.example.com", 8388, "secret"),
//! );
//! proxy_sidecar::sidecar::run(config).await
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod domain;
pub mod error;
pub mod hypervisor;
pub mod iptables;
pub mod monitor;
pub mod proxy;
pub mod readiness;
pub mod retry;
pub mod shutdown;
pub mod sidecar;

// Re-export main types for convenience
pub use config::{ProxyConfig, SidecarConfig};
pub use domain::{DomainIdentity, DomainRecord, DomainState, LifecycleEvent, StateReason};
pub use error::{Error, ErrorKind, Result};
pub use hypervisor::{Hypervisor, LibvirtConnection};
pub use iptables::{install_redirect, IptablesCli, RedirectLayout, RuleStore};
pub use monitor::DomainMonitor;
pub use proxy::{ProxyCommand, ProxySupervisor, SupervisorState};
pub use shutdown::StopSignal;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

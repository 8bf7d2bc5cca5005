//! Runtime configuration of the sidecar.
//!
//! Built once from the command line (see `cli`) and then only read. The
//! whole configuration serializes to JSON for the startup log; the proxy
//! password is never serialized.

use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::DomainIdentity;
use crate::error::{Error, Result};
use crate::iptables::RedirectLayout;

/// Default libvirt URI.
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

/// Marker the launcher creates once it is up.
pub const DEFAULT_LAUNCHER_READINESS_FILE: &str = "/var/run/kubevirt-infra/healthy";

/// Marker this sidecar creates once it is up.
pub const DEFAULT_SIDECAR_READINESS_FILE: &str = "/var/run/kubevirt-infra/healthy_sidecar";

/// Number of launcher readiness checks before giving up.
pub const DEFAULT_LAUNCHER_CHECK_TIMES: u32 = 15;

/// How long to keep trying to open the libvirt connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the domain before warning.
pub const DEFAULT_DOMAIN_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Default transparent proxy binary.
pub const DEFAULT_PROXY_BINARY: &str = "/usr/bin/ss-redir";

/// Default proxy cipher.
pub const DEFAULT_PROXY_METHOD: &str = "rc4-md5";

/// Address the local proxy listens on.
pub const DEFAULT_PROXY_LOCAL_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Port the local proxy listens on.
pub const DEFAULT_PROXY_LOCAL_PORT: u16 = 1080;

/// The upstream proxy and the local listener that relays to it.
#[derive(Clone, Serialize)]
pub struct ProxyConfig {
    /// Proxy executable.
    pub binary: PathBuf,
    /// Upstream server host.
    pub server: String,
    /// Upstream server port.
    pub port: u16,
    /// Upstream password.
    #[serde(skip_serializing)]
    pub password: String,
    /// Cipher.
    pub method: String,
    /// Local listen address.
    pub local_addr: IpAddr,
    /// Local listen port.
    pub local_port: u16,
}

impl ProxyConfig {
    /// Config for `server:port` with every other field at its default.
    pub fn new(server: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_PROXY_BINARY),
            server: server.into(),
            port,
            password: password.into(),
            method: DEFAULT_PROXY_METHOD.to_string(),
            local_addr: DEFAULT_PROXY_LOCAL_ADDR,
            local_port: DEFAULT_PROXY_LOCAL_PORT,
        }
    }

    /// Where VM traffic is redirected to.
    pub fn local_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.local_addr, self.local_port)
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("binary", &self.binary)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .field("method", &self.method)
            .field("local_addr", &self.local_addr)
            .field("local_port", &self.local_port)
            .finish()
    }
}

/// Everything the sidecar needs to run.
#[derive(Debug, Clone, Serialize)]
pub struct SidecarConfig {
    /// The VM to watch.
    pub identity: DomainIdentity,
    /// Launcher readiness marker to wait for.
    pub launcher_readiness_file: PathBuf,
    /// Readiness marker to create.
    pub sidecar_readiness_file: PathBuf,
    /// Launcher readiness checks before giving up.
    pub launcher_check_times: u32,
    /// libvirt URI.
    pub libvirt_uri: String,
    /// libvirt connect timeout.
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Time after which a missing domain is reported.
    #[serde(with = "duration_str")]
    pub domain_timeout: Duration,
    /// Proxy settings.
    pub proxy: ProxyConfig,
    /// iptables names.
    #[serde(skip)]
    pub redirect: RedirectLayout,
}

impl SidecarConfig {
    /// Config for `identity` and `proxy` with every other field at its default.
    pub fn new(identity: DomainIdentity, proxy: ProxyConfig) -> Self {
        Self {
            identity,
            launcher_readiness_file: PathBuf::from(DEFAULT_LAUNCHER_READINESS_FILE),
            sidecar_readiness_file: PathBuf::from(DEFAULT_SIDECAR_READINESS_FILE),
            launcher_check_times: DEFAULT_LAUNCHER_CHECK_TIMES,
            libvirt_uri: DEFAULT_LIBVIRT_URI.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            domain_timeout: DEFAULT_DOMAIN_TIMEOUT,
            proxy,
            redirect: RedirectLayout::default(),
        }
    }

    /// Reject configurations the sidecar cannot run with.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("name", &self.identity.name),
            ("namespace", &self.identity.namespace),
            ("uid", &self.identity.uid),
            ("proxy server", &self.proxy.server),
        ];
        for (what, value) in required {
            if value.trim().is_empty() {
                return Err(Error::config("validate config", format!("{} is empty", what)));
            }
        }
        if self.proxy.port == 0 {
            return Err(Error::config("validate config", "proxy port must not be 0"));
        }
        if self.proxy.local_port == 0 {
            return Err(Error::config("validate config", "proxy local port must not be 0"));
        }
        Ok(())
    }
}

/// Serialize durations the way they are given on the command line.
mod duration_str {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }
}

//! Command-line interface.

pub mod parsers;

use clap::Args;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use proxy_sidecar::config::{
    ProxyConfig, SidecarConfig, DEFAULT_LAUNCHER_CHECK_TIMES, DEFAULT_LAUNCHER_READINESS_FILE,
    DEFAULT_LIBVIRT_URI, DEFAULT_PROXY_BINARY, DEFAULT_PROXY_METHOD,
    DEFAULT_SIDECAR_READINESS_FILE,
};
use proxy_sidecar::{DomainIdentity, Error, Result};

use parsers::{parse_duration, parse_port};

/// Arguments of the sidecar. Identity and proxy settings are normally
/// injected through the environment.
#[derive(Args, Debug)]
pub struct SidecarArgs {
    /// Name of the VM
    #[arg(long, env = "DOMAIN_NAME")]
    pub name: String,

    /// UID of the VM object
    #[arg(long, env = "DOMAIN_UID")]
    pub uid: String,

    /// Namespace of the VM
    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: String,

    /// File the launcher creates once it is ready
    #[arg(long, value_name = "PATH", default_value = DEFAULT_LAUNCHER_READINESS_FILE)]
    pub launcher_readiness_file: PathBuf,

    /// File to create once the sidecar is ready
    #[arg(long, value_name = "PATH", default_value = DEFAULT_SIDECAR_READINESS_FILE)]
    pub sidecar_readiness_file: PathBuf,

    /// Launcher readiness checks (every 2s) before giving up
    #[arg(long, value_name = "N", default_value_t = DEFAULT_LAUNCHER_CHECK_TIMES)]
    pub launcher_check_times: u32,

    /// libvirt connection URI
    #[arg(long, value_name = "URI", default_value = DEFAULT_LIBVIRT_URI)]
    pub libvirt_uri: String,

    /// How long to retry connecting to libvirt (e.g. 10s)
    #[arg(long, value_name = "DURATION", default_value = "10s", value_parser = parse_duration)]
    pub connect_timeout: Duration,

    /// Warn when the domain has not appeared after this long (e.g. 3m)
    #[arg(long, alias = "qemu-timeout", value_name = "DURATION", default_value = "3m", value_parser = parse_duration)]
    pub domain_timeout: Duration,

    /// Upstream proxy server host
    #[arg(long, env = "PROXY_SERVER")]
    pub proxy_server: String,

    /// Upstream proxy server port
    #[arg(long, env = "PROXY_PORT", value_parser = parse_port)]
    pub proxy_port: u16,

    /// Upstream proxy password
    #[arg(long, env = "PROXY_PASSWORD", hide_env_values = true)]
    pub proxy_password: String,

    /// Proxy cipher
    #[arg(long, env = "PROXY_METHOD", default_value = DEFAULT_PROXY_METHOD)]
    pub proxy_method: String,

    /// Transparent proxy executable
    #[arg(long, value_name = "PATH", default_value = DEFAULT_PROXY_BINARY)]
    pub proxy_binary: PathBuf,

    /// Address the local proxy listens on
    #[arg(long, default_value = "127.0.0.1")]
    pub proxy_local_addr: IpAddr,

    /// Port the local proxy listens on
    #[arg(long, default_value = "1080", value_parser = parse_port)]
    pub proxy_local_port: u16,
}

impl SidecarArgs {
    /// Build the runtime configuration.
    pub fn into_config(self) -> SidecarConfig {
        let mut proxy = ProxyConfig::new(self.proxy_server, self.proxy_port, self.proxy_password);
        proxy.method = self.proxy_method;
        proxy.binary = self.proxy_binary;
        proxy.local_addr = self.proxy_local_addr;
        proxy.local_port = self.proxy_local_port;

        let mut config =
            SidecarConfig::new(DomainIdentity::new(self.name, self.namespace, self.uid), proxy);
        config.launcher_readiness_file = self.launcher_readiness_file;
        config.sidecar_readiness_file = self.sidecar_readiness_file;
        config.launcher_check_times = self.launcher_check_times;
        config.libvirt_uri = self.libvirt_uri;
        config.connect_timeout = self.connect_timeout;
        config.domain_timeout = self.domain_timeout;
        config
    }

    /// Run the sidecar to completion.
    pub fn run(self) -> Result<()> {
        let config = self.into_config();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::config("start runtime", e.to_string()))?;
        runtime.block_on(proxy_sidecar::sidecar::run(config))
    }
}

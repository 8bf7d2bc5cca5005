//! proxy-sidecar entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

/// proxy-sidecar - route a VM's traffic through a transparent proxy
#[derive(Parser, Debug)]
#[command(name = "proxy-sidecar")]
#[command(about = "Redirect a libvirt VM's outbound TCP traffic through a supervised transparent proxy")]
#[command(
    long_about = "proxy-sidecar runs next to a VM launcher.\n\n\
It waits for the launcher, starts a transparent proxy, watches the VM through \
libvirt and, once the VM is defined, rewrites the nat table so the VM's TCP \
traffic goes through the proxy. Inbound port forwards are kept."
)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    args: cli::SidecarArgs,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging();

    tracing::debug!(version = proxy_sidecar::VERSION, "starting proxy-sidecar");

    if let Err(e) = cli.args.run() {
        tracing::error!(error = %e, "proxy sidecar failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("proxy_sidecar=info,proxy=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from([
            "proxy-sidecar",
            "--name",
            "vm1",
            "--uid",
            "42",
            "--namespace",
            "default",
            "--proxy-server",
            "proxy.example.com",
            "--proxy-port",
            "8388",
            "--proxy-password",
            "secret",
        ])
        .unwrap();
        let config = cli.args.into_config();

        assert_eq!(config.identity.full_name(), "default_vm1");
        assert_eq!(config.launcher_check_times, 15);
        assert_eq!(config.domain_timeout, Duration::from_secs(180));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.libvirt_uri, "qemu:///system");
        assert_eq!(config.proxy.method, "rc4-md5");
        assert_eq!(config.proxy.local_endpoint().to_string(), "127.0.0.1:1080");
        assert_eq!(
            config.sidecar_readiness_file.to_str(),
            Some("/var/run/kubevirt-infra/healthy_sidecar")
        );
    }

    #[test]
    fn test_cli_timeouts() {
        let cli = Cli::try_parse_from([
            "proxy-sidecar",
            "--name=vm1",
            "--uid=42",
            "--namespace=default",
            "--proxy-server=p",
            "--proxy-port=1",
            "--proxy-password=x",
            "--qemu-timeout=90s",
            "--launcher-check-times=3",
        ])
        .unwrap();
        let config = cli.args.into_config();
        assert_eq!(config.domain_timeout, Duration::from_secs(90));
        assert_eq!(config.launcher_check_times, 3);
    }

    #[test]
    fn test_cli_rejects_zero_port() {
        let result = Cli::try_parse_from([
            "proxy-sidecar",
            "--name=vm1",
            "--uid=42",
            "--namespace=default",
            "--proxy-server=p",
            "--proxy-port=0",
            "--proxy-password=x",
        ]);
        assert!(result.is_err());
    }
}

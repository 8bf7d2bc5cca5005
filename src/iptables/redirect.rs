//! Steer VM traffic into the local transparent proxy.
//!
//! The launcher sets up the `nat` table so the VM behind the bridge NIC is
//! masqueraded out of the pod NIC, with per-port forwards in its own chains.
//! [`install_redirect`] keeps the inbound forwards and the masquerade, and
//! sends everything else the VM originates over TCP to the proxy.
//!
//! ```text
//! PREROUTING   -i k6t-eth0 -j PROXY_REDIRECT
//!              -i eth0     -j KUBEVIRT_PREINBOUND
//! PROXY_REDIRECT  -d 127.0.0.0/8 -j RETURN
//!                 -p tcp -j DNAT --to-destination 127.0.0.1:1080
//! OUTPUT       (empty)
//! POSTROUTING  -s <vm net> -o eth0 -j MASQUERADE
//! ```

use std::net::SocketAddr;

use super::parser::{parse_forwarded_ports, parse_source_address, Cidr};
use super::{NatRule, RuleStore};
use crate::error::Result;

/// Loopback traffic is never redirected.
const LOOPBACK_NET: &str = "127.0.0.0/8";

/// Table and chain names the redirect is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectLayout {
    /// Table holding all chains below.
    pub table: String,
    /// Ingress chain (`PREROUTING`).
    pub prerouting: String,
    /// Locally generated egress chain (`OUTPUT`).
    pub output: String,
    /// Post-routing chain holding the VM masquerade rule.
    pub postrouting: String,
    /// Launcher chain with inbound port forwards from the pod NIC.
    pub forward_chain: String,
    /// Launcher chain with the source-NAT half of the port forwards.
    pub forward_postrouting_chain: String,
    /// Dedicated chain created for the redirect.
    pub redirect_chain: String,
    /// Pod-external interface.
    pub pod_nic: String,
    /// Interface facing the VM bridge.
    pub bridge_nic: String,
}

impl Default for RedirectLayout {
    fn default() -> Self {
        Self {
            table: "nat".into(),
            prerouting: "PREROUTING".into(),
            output: "OUTPUT".into(),
            postrouting: "POSTROUTING".into(),
            forward_chain: "KUBEVIRT_PREINBOUND".into(),
            forward_postrouting_chain: "KUBEVIRT_POSTINBOUND".into(),
            redirect_chain: "PROXY_REDIRECT".into(),
            pod_nic: "eth0".into(),
            bridge_nic: "k6t-eth0".into(),
        }
    }
}

impl RedirectLayout {
    fn rule<I, S>(&self, chain: &str, args: I) -> NatRule
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NatRule::new(self.table.as_str(), chain, args)
    }
}

/// What an install found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectReport {
    /// VM source network that keeps its masquerade.
    pub source: Cidr,
    /// Ports forwarded into the VM by the launcher (may be empty).
    pub forwarded_ports: Vec<u16>,
    /// Where VM TCP traffic now goes.
    pub destination: SocketAddr,
}

/// Install the redirect chain set towards `destination`.
///
/// Any failing step aborts the rest; nothing is rolled back. Invoking it
/// again with the same arguments leaves the table as a single invocation
/// would, so recovery is simply calling it again.
pub fn install_redirect(
    store: &dyn RuleStore,
    layout: &RedirectLayout,
    destination: SocketAddr,
) -> Result<RedirectReport> {
    let table = layout.table.as_str();

    // Must be read before POSTROUTING is rebuilt below.
    let source = parse_source_address(&store.list_rules(table, &layout.postrouting)?)?;

    let forwarded_ports = match store
        .list_rules(table, &layout.forward_postrouting_chain)
        .and_then(|lines| parse_forwarded_ports(&lines))
    {
        Ok(ports) => ports,
        Err(e) => {
            tracing::debug!(
                chain = %layout.forward_postrouting_chain,
                error = %e,
                "no forwarded ports found"
            );
            Vec::new()
        }
    };

    // Redirect chain
    ensure_empty_chain(store, table, &layout.redirect_chain)?;
    layout
        .rule(&layout.redirect_chain, ["-d", LOOPBACK_NET, "-j", "RETURN"])
        .append_to(store)?;
    let to_destination = destination.to_string();
    layout
        .rule(
            &layout.redirect_chain,
            ["-p", "tcp", "-j", "DNAT", "--to-destination", to_destination.as_str()],
        )
        .append_to(store)?;

    // Ingress
    store.clear_chain(table, &layout.prerouting)?;
    layout
        .rule(
            &layout.prerouting,
            ["-i", layout.bridge_nic.as_str(), "-j", layout.redirect_chain.as_str()],
        )
        .append_to(store)?;
    layout
        .rule(
            &layout.prerouting,
            ["-i", layout.pod_nic.as_str(), "-j", layout.forward_chain.as_str()],
        )
        .append_to(store)?;

    // Egress
    store.clear_chain(table, &layout.output)?;

    // Post-routing
    store.clear_chain(table, &layout.postrouting)?;
    let source_net = source.to_string();
    layout
        .rule(
            &layout.postrouting,
            ["-s", source_net.as_str(), "-o", layout.pod_nic.as_str(), "-j", "MASQUERADE"],
        )
        .append_to(store)?;

    Ok(RedirectReport {
        source,
        forwarded_ports,
        destination,
    })
}

/// Create `chain`, or flush it when it already exists.
fn ensure_empty_chain(store: &dyn RuleStore, table: &str, chain: &str) -> Result<()> {
    if store.chain_exists(table, chain)? {
        store.clear_chain(table, chain)
    } else {
        store.new_chain(table, chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iptables::memory::MemoryRuleStore;

    fn proxy() -> SocketAddr {
        "127.0.0.1:1080".parse().unwrap()
    }

    /// Roughly what virt-launcher leaves behind for a VM with port 22 forwarded.
    fn launcher_table() -> MemoryRuleStore {
        MemoryRuleStore::new()
            .with_chain(
                "nat",
                "PREROUTING",
                &["-A PREROUTING -i eth0 -j KUBEVIRT_PREINBOUND"],
            )
            .with_chain(
                "nat",
                "OUTPUT",
                &["-A OUTPUT -d 127.0.0.1/32 -p tcp -m tcp --dport 22 -j DNAT --to-destination 192.168.100.2"],
            )
            .with_chain(
                "nat",
                "POSTROUTING",
                &[
                    "-A POSTROUTING -o k6t-eth0 -j KUBEVIRT_POSTINBOUND",
                    "-A POSTROUTING -s 192.168.100.2/32 -j MASQUERADE",
                ],
            )
            .with_chain(
                "nat",
                "KUBEVIRT_PREINBOUND",
                &["-A KUBEVIRT_PREINBOUND -p tcp -m tcp --dport 22 -j DNAT --to-destination 192.168.100.2"],
            )
            .with_chain(
                "nat",
                "KUBEVIRT_POSTINBOUND",
                &["-A KUBEVIRT_POSTINBOUND -p tcp -m tcp --dport 22 -j SNAT --to-source 192.168.100.1"],
            )
    }

    fn chain(store: &MemoryRuleStore, name: &str) -> Vec<String> {
        store
            .snapshot()
            .remove(&("nat".to_string(), name.to_string()))
            .unwrap_or_default()
    }

    #[test]
    fn test_install_redirect() {
        let store = launcher_table();
        let report = install_redirect(&store, &RedirectLayout::default(), proxy()).unwrap();

        assert_eq!(report.source.to_string(), "192.168.100.2/32");
        assert_eq!(report.forwarded_ports, vec![22]);
        assert_eq!(report.destination, proxy());

        assert_eq!(
            chain(&store, "PROXY_REDIRECT"),
            vec![
                "-A PROXY_REDIRECT -d 127.0.0.0/8 -j RETURN",
                "-A PROXY_REDIRECT -p tcp -j DNAT --to-destination 127.0.0.1:1080",
            ]
        );
        assert_eq!(
            chain(&store, "PREROUTING"),
            vec![
                "-A PREROUTING -i k6t-eth0 -j PROXY_REDIRECT",
                "-A PREROUTING -i eth0 -j KUBEVIRT_PREINBOUND",
            ]
        );
        assert!(chain(&store, "OUTPUT").is_empty());
        assert_eq!(
            chain(&store, "POSTROUTING"),
            vec!["-A POSTROUTING -s 192.168.100.2/32 -o eth0 -j MASQUERADE"]
        );
        // launcher forwards untouched
        assert_eq!(chain(&store, "KUBEVIRT_PREINBOUND").len(), 1);
    }

    #[test]
    fn test_install_redirect_twice_is_idempotent() {
        let store = launcher_table();
        let layout = RedirectLayout::default();

        install_redirect(&store, &layout, proxy()).unwrap();
        let once = store.snapshot();

        let report = install_redirect(&store, &layout, proxy()).unwrap();
        assert_eq!(store.snapshot(), once);
        assert_eq!(report.source.to_string(), "192.168.100.2/32");
    }

    #[test]
    fn test_install_redirect_without_forwards() {
        let store = MemoryRuleStore::new()
            .with_chain("nat", "PREROUTING", &[])
            .with_chain("nat", "OUTPUT", &[])
            .with_chain(
                "nat",
                "POSTROUTING",
                &["-A POSTROUTING -s 10.0.2.2/32 -j MASQUERADE"],
            );

        let report = install_redirect(&store, &RedirectLayout::default(), proxy()).unwrap();
        assert!(report.forwarded_ports.is_empty());
        assert_eq!(
            chain(&store, "POSTROUTING"),
            vec!["-A POSTROUTING -s 10.0.2.2/32 -o eth0 -j MASQUERADE"]
        );
    }

    #[test]
    fn test_install_redirect_requires_source() {
        let store = MemoryRuleStore::new()
            .with_chain("nat", "PREROUTING", &[])
            .with_chain("nat", "OUTPUT", &[])
            .with_chain("nat", "POSTROUTING", &["-A POSTROUTING -o eth0 -j MASQUERADE"]);

        let err = install_redirect(&store, &RedirectLayout::default(), proxy()).unwrap_err();
        assert!(err.is_not_found());
        // nothing was modified
        assert!(store
            .calls()
            .iter()
            .all(|c| c.contains(" -S ")));
    }

    #[test]
    fn test_install_redirect_aborts_on_failure() {
        let store = launcher_table();
        store.fail_on("-F PREROUTING");

        let err = install_redirect(&store, &RedirectLayout::default(), proxy()).unwrap_err();
        assert!(err.to_string().contains("injected failure"));

        let calls = store.calls();
        assert_eq!(calls.last().map(String::as_str), Some("-t nat -F PREROUTING"));
        assert!(!calls.iter().any(|c| c.contains("-F OUTPUT")));
        assert!(!calls.iter().any(|c| c.contains("-F POSTROUTING")));
        // no rollback: the redirect chain stays populated
        assert_eq!(chain(&store, "PROXY_REDIRECT").len(), 2);
    }

    #[test]
    fn test_install_redirect_ipv6_destination() {
        let store = launcher_table();
        let destination: SocketAddr = "[::1]:1080".parse().unwrap();
        install_redirect(&store, &RedirectLayout::default(), destination).unwrap();
        assert_eq!(
            chain(&store, "PROXY_REDIRECT")[1],
            "-A PROXY_REDIRECT -p tcp -j DNAT --to-destination [::1]:1080"
        );
    }
}

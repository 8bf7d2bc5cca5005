//! Extract facts from iptables listing lines.
//!
//! The `-S` output is treated as the wire format. Lines are scanned in list
//! order and the first usable match wins, mirroring how the kernel evaluates
//! the chain. A line that does not carry the wanted token, or carries an
//! unparsable value, is skipped; only an empty overall result is an error.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::NatRule;
use crate::error::{Error, Result};

/// Flags that carry a destination port.
const DPORT_FLAGS: &[&str] = &["--dport"];

/// Flags that carry a source address.
const SOURCE_FLAGS: &[&str] = &["-s", "--source"];

/// An IP network: address plus prefix length, host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Network address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl FromStr for Cidr {
    type Err = String;

    /// Accepts `IP/prefix` or a bare `IP` (host route: /32 for IPv4, /128 for
    /// IPv6).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (ip_str, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| format!("invalid prefix length in '{}'", s))?;
                (ip, Some(prefix))
            }
            None => (s, None),
        };

        let addr: IpAddr = ip_str
            .parse()
            .map_err(|_| format!("invalid CIDR '{}': expected format like 10.0.0.0/8", s))?;

        let (max, bits) = match addr {
            IpAddr::V4(v4) => (32u8, u128::from(u32::from(v4)) << 96),
            IpAddr::V6(v6) => (128u8, u128::from(v6)),
        };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return Err(format!("invalid CIDR '{}': prefix must be 0-{}", s, max));
        }

        let mask = if prefix == 0 {
            0
        } else {
            u128::MAX << (128 - u32::from(prefix))
        };
        let network = bits & mask;
        let addr = match addr {
            IpAddr::V4(_) => IpAddr::from(((network >> 96) as u32).to_be_bytes()),
            IpAddr::V6(_) => IpAddr::from(network.to_be_bytes()),
        };

        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

fn rules<'a, S: AsRef<str>>(lines: &'a [S]) -> impl Iterator<Item = (&'a str, Option<NatRule>)> {
    lines.iter().map(|line| {
        let line = line.as_ref();
        (line, NatRule::from_listing("", line))
    })
}

/// Collect the `--dport` value of every line, in encounter order.
///
/// Duplicates are dropped. Fails with a NotFound-class error only when no
/// line yields a port.
pub fn parse_forwarded_ports<S: AsRef<str>>(lines: &[S]) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for (line, rule) in rules(lines) {
        let Some(value) = rule.as_ref().and_then(|r| r.value_of(DPORT_FLAGS)) else {
            continue;
        };
        match value.parse::<u16>() {
            Ok(0) => tracing::debug!(line, "ignoring zero --dport"),
            Ok(port) if !ports.contains(&port) => ports.push(port),
            Ok(_) => {}
            Err(e) => tracing::debug!(line, error = %e, "skipping rule with bad --dport"),
        }
    }

    if ports.is_empty() {
        return Err(Error::rule_not_found(format!(
            "no --dport value in {} rules",
            lines.len()
        )));
    }
    Ok(ports)
}

/// The source network of the first line that carries `-s`/`--source`.
pub fn parse_source_address<S: AsRef<str>>(lines: &[S]) -> Result<Cidr> {
    for (line, rule) in rules(lines) {
        let Some(value) = rule.as_ref().and_then(|r| r.value_of(SOURCE_FLAGS)) else {
            continue;
        };
        match value.parse::<Cidr>() {
            Ok(cidr) => return Ok(cidr),
            Err(e) => tracing::debug!(line, error = %e, "skipping rule with bad source"),
        }
    }

    Err(Error::rule_not_found(format!(
        "no -s/--source value in {} rules",
        lines.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORWARD_RULES: &[&str] = &[
        "-A KUBEVIRT_POSTINBOUND -p tcp -m tcp --dport 22 -j SNAT --to-source 192.168.100.1",
        "-A KUBEVIRT_POSTINBOUND -p tcp -m tcp",
        "-A KUBEVIRT_POSTINBOUND --dport 23 -j SNAT --to-source 192.168.100.1",
        "-A KUBEVIRT_POSTINBOUND --to-source 192.168.100.1",
    ];

    const OUTPUT_RULES: &[&str] = &[
        "-A POSTROUTING -o k6t-eth0 -j KUBEVIRT_POSTINBOUND",
        "-A POSTROUTING -s 192.168.100.2/32 -j MASQUERADE",
    ];

    #[test]
    fn test_parse_forwarded_ports() {
        let ports = parse_forwarded_ports(FORWARD_RULES).unwrap();
        assert_eq!(ports, vec![22, 23]);
    }

    #[test]
    fn test_parse_forwarded_ports_skips_malformed_line() {
        let lines = [
            "-A C -p tcp --dport 22 -j SNAT --to-source 1.1.1.1",
            "-A C -p tcp",
            "-A C --dport 23 -j SNAT --to-source 1.1.1.1",
        ];
        assert_eq!(parse_forwarded_ports(&lines).unwrap(), vec![22, 23]);
    }

    #[test]
    fn test_parse_forwarded_ports_bad_values() {
        let lines = [
            "-A C -p tcp --dport ssh -j SNAT",
            "-A C -p tcp --dport 70000 -j SNAT",
            "-A C -p tcp --dport",
            "-A C -p tcp --dport=8080 -j SNAT",
            "-A C -p udp --dport 8080 -j SNAT",
        ];
        assert_eq!(parse_forwarded_ports(&lines).unwrap(), vec![8080]);
    }

    #[test]
    fn test_parse_forwarded_ports_none() {
        let lines = ["-A C -p tcp", "-A C -j RETURN"];
        let err = parse_forwarded_ports(&lines).unwrap_err();
        assert!(err.is_not_found());

        let empty: [&str; 0] = [];
        assert!(parse_forwarded_ports(&empty).unwrap_err().is_not_found());
    }

    #[test]
    fn test_parse_source_address() {
        let cidr = parse_source_address(OUTPUT_RULES).unwrap();
        assert_eq!(cidr.to_string(), "192.168.100.2/32");
    }

    #[test]
    fn test_parse_source_address_first_match_wins() {
        let lines = [
            "-A POSTROUTING -s 10.0.2.0/24 -j MASQUERADE",
            "-A POSTROUTING --source 192.168.100.2/32 -j MASQUERADE",
        ];
        assert_eq!(
            parse_source_address(&lines).unwrap().to_string(),
            "10.0.2.0/24"
        );
    }

    #[test]
    fn test_parse_source_address_skips_unparsable() {
        let lines = [
            "-A POSTROUTING -s not-an-ip -j MASQUERADE",
            "-A POSTROUTING --source=192.168.100.7/24 -j MASQUERADE",
        ];
        assert_eq!(
            parse_source_address(&lines).unwrap().to_string(),
            "192.168.100.0/24"
        );
    }

    #[test]
    fn test_parse_source_address_missing() {
        let lines = ["-A POSTROUTING -o eth0 -j MASQUERADE"];
        let err = parse_source_address(&lines).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_cidr_parse() {
        assert_eq!("10.1.2.3".parse::<Cidr>().unwrap().to_string(), "10.1.2.3/32");
        assert_eq!("10.1.2.3/8".parse::<Cidr>().unwrap().to_string(), "10.0.0.0/8");
        assert_eq!("0.0.0.0/0".parse::<Cidr>().unwrap().to_string(), "0.0.0.0/0");
        assert_eq!(
            "fd10:0:2::2/64".parse::<Cidr>().unwrap().to_string(),
            "fd10:0:2::/64"
        );
        assert_eq!("::1".parse::<Cidr>().unwrap().prefix(), 128);

        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
        assert!("host".parse::<Cidr>().is_err());
    }
}

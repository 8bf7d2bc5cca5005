//! [`RuleStore`] backed by the `iptables` binary.

use std::path::PathBuf;
use std::process::{Command, Output};

use super::RuleStore;
use crate::error::{Error, Result};

/// Default iptables binary, resolved through `PATH`.
const DEFAULT_IPTABLES: &str = "iptables";

/// iptables reports a missing chain with this message on stderr.
const NO_CHAIN_MESSAGE: &str = "No chain/target/match by that name";

/// Runs `iptables` for each operation.
///
/// Every invocation passes `-w` so concurrent xtables users (the launcher's
/// own setup) block on the lock instead of failing.
#[derive(Debug, Clone)]
pub struct IptablesCli {
    binary: PathBuf,
}

impl Default for IptablesCli {
    fn default() -> Self {
        Self::new()
    }
}

impl IptablesCli {
    /// Use `iptables` from `PATH`.
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_IPTABLES)
    }

    /// Use a specific binary (e.g. `iptables-legacy`).
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command_line(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary.display(), args.join(" "))
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        tracing::debug!(command = %self.command_line(args), "running iptables");
        Command::new(&self.binary)
            .arg("-w")
            .args(args)
            .output()
            .map_err(|e| Error::command_failed(self.command_line(args), e.to_string()))
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::command_failed(
                self.command_line(args),
                stderr.trim(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RuleStore for IptablesCli {
    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(&["-t", table, "-N", chain]).map(drop)
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run(&["-t", table, "-F", chain]).map(drop)
    }

    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        let args = ["-t", table, "-S", chain, "1"];
        let output = self.output(&args)?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(NO_CHAIN_MESSAGE) {
            Ok(false)
        } else {
            Err(Error::command_failed(self.command_line(&args), stderr.trim()))
        }
    }

    fn append_rule(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()> {
        let mut args = vec!["-t", table, "-A", chain];
        args.extend_from_slice(rulespec);
        self.run(&args).map(drop)
    }

    fn insert_rule(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()> {
        let mut args = vec!["-t", table, "-I", chain, "1"];
        args.extend_from_slice(rulespec);
        self.run(&args).map(drop)
    }

    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        let stdout = self.run(&["-t", table, "-S", chain])?;
        Ok(strip_chain_header(&stdout))
    }
}

/// Split `-S` output into lines, dropping the leading `-N`/`-P` line that
/// describes the chain itself.
fn strip_chain_header(stdout: &str) -> Vec<String> {
    let mut lines = stdout.lines().filter(|l| !l.trim().is_empty()).peekable();
    if lines
        .peek()
        .is_some_and(|first| first.starts_with("-N ") || first.starts_with("-P "))
    {
        lines.next();
    }
    lines.map(str::to_string).collect()
}

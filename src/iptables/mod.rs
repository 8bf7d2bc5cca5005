//! Kernel packet-filter (iptables) access.
//!
//! [`RuleStore`] is the seam between the redirect logic and the kernel: the
//! production implementation shells out to `iptables`, tests substitute an
//! in-memory table. Rules go in as ordered argument tokens and come back as
//! the flat `-S` listing lines that [`parser`] understands.

mod cli;
#[cfg(test)]
pub(crate) mod memory;
pub mod parser;
pub mod redirect;

pub use cli::IptablesCli;
pub use parser::{parse_forwarded_ports, parse_source_address, Cidr};
pub use redirect::{install_redirect, RedirectLayout, RedirectReport};

use crate::error::Result;

/// Operations over one kernel packet-filter table, addressed by table and
/// chain name.
pub trait RuleStore: Send + Sync {
    /// `iptables -t <table> -N <chain>`
    fn new_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// `iptables -t <table> -F <chain>`
    fn clear_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// Whether the chain exists in the table.
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool>;

    /// `iptables -t <table> -A <chain> <rulespec...>`
    fn append_rule(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()>;

    /// `iptables -t <table> -I <chain> 1 <rulespec...>`
    fn insert_rule(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()>;

    /// `iptables -t <table> -S <chain>`, without the chain's creation or
    /// policy line.
    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>>;
}

/// One rule: table, chain and ordered match/target tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    /// Table the rule lives in.
    pub table: String,
    /// Chain the rule lives in.
    pub chain: String,
    /// Match and target tokens, in order.
    pub args: Vec<String>,
}

impl NatRule {
    /// Create a rule to be issued.
    pub fn new<I, S>(table: impl Into<String>, chain: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            chain: chain.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Read a rule back from a listing line (`-A CHAIN tok tok ...`).
    ///
    /// Returns `None` for lines that are not rule appends.
    pub fn from_listing(table: &str, line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "-A" {
            return None;
        }
        let chain = tokens.next()?;
        Some(Self::new(table, chain, tokens))
    }

    /// The value following the first of `flags`, in either `--flag value` or
    /// `--flag=value` form.
    pub fn value_of(&self, flags: &[&str]) -> Option<&str> {
        let mut tokens = self.args.iter();
        while let Some(token) = tokens.next() {
            if flags.contains(&token.as_str()) {
                return tokens.next().map(String::as_str);
            }
            if let Some((flag, value)) = token.split_once('=') {
                if flags.contains(&flag) {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Tokens as borrowed strings, ready for [`RuleStore::append_rule`].
    pub fn rulespec(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }

    /// Append this rule through `store`.
    pub fn append_to(&self, store: &dyn RuleStore) -> Result<()> {
        store.append_rule(&self.table, &self.chain, &self.rulespec())
    }
}

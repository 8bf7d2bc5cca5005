//! In-memory [`RuleStore`] for tests.

use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::RuleStore;
use crate::error::{Error, Result};

/// Chains keyed by `(table, chain)`, each an ordered list of rule token lists.
#[derive(Debug, Default)]
pub(crate) struct MemoryRuleStore {
    chains: Mutex<BTreeMap<(String, String), Vec<Vec<String>>>>,
    /// Fail any operation whose `-t table -X chain` description contains this.
    fail_on: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryRuleStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Seed a chain with listing-style lines (`-A CHAIN tok ...`).
    pub(crate) fn with_chain(self, table: &str, chain: &str, lines: &[&str]) -> Self {
        let rules = lines
            .iter()
            .map(|line| {
                line.split_whitespace()
                    .skip(2)
                    .map(str::to_string)
                    .collect()
            })
            .collect();
        self.chains
            .lock()
            .insert((table.to_string(), chain.to_string()), rules);
        self
    }

    pub(crate) fn fail_on(&self, op: &str) {
        *self.fail_on.lock() = Some(op.to_string());
    }

    /// Every operation performed, in order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Full table state as listing lines per chain.
    pub(crate) fn snapshot(&self) -> BTreeMap<(String, String), Vec<String>> {
        self.chains
            .lock()
            .iter()
            .map(|((table, chain), rules)| {
                let lines = rules.iter().map(|r| listing(chain, r)).collect();
                ((table.clone(), chain.clone()), lines)
            })
            .collect()
    }

    fn record(&self, op: String) -> Result<()> {
        let failing = self
            .fail_on
            .lock()
            .as_ref()
            .is_some_and(|needle| op.contains(needle.as_str()));
        self.calls.lock().push(op.clone());
        if failing {
            return Err(Error::command_failed(op, "injected failure"));
        }
        Ok(())
    }

    fn key(table: &str, chain: &str) -> (String, String) {
        (table.to_string(), chain.to_string())
    }

    fn missing(table: &str, chain: &str) -> Error {
        Error::command_failed(
            format!("iptables -t {} {}", table, chain),
            "No chain/target/match by that name.",
        )
    }
}

fn listing(chain: &str, rule: &[String]) -> String {
    format!("-A {} {}", chain, rule.join(" "))
}

impl RuleStore for MemoryRuleStore {
    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.record(format!("-t {} -N {}", table, chain))?;
        let mut chains = self.chains.lock();
        if chains.contains_key(&Self::key(table, chain)) {
            return Err(Error::command_failed(
                format!("iptables -t {} -N {}", table, chain),
                "Chain already exists.",
            ));
        }
        chains.insert(Self::key(table, chain), Vec::new());
        Ok(())
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.record(format!("-t {} -F {}", table, chain))?;
        match self.chains.lock().get_mut(&Self::key(table, chain)) {
            Some(rules) => {
                rules.clear();
                Ok(())
            }
            None => Err(Self::missing(table, chain)),
        }
    }

    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        Ok(self.chains.lock().contains_key(&Self::key(table, chain)))
    }

    fn append_rule(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()> {
        self.record(format!("-t {} -A {} {}", table, chain, rulespec.join(" ")))?;
        match self.chains.lock().get_mut(&Self::key(table, chain)) {
            Some(rules) => {
                rules.push(rulespec.iter().map(|s| s.to_string()).collect());
                Ok(())
            }
            None => Err(Self::missing(table, chain)),
        }
    }

    fn insert_rule(&self, table: &str, chain: &str, rulespec: &[&str]) -> Result<()> {
        self.record(format!("-t {} -I {} {}", table, chain, rulespec.join(" ")))?;
        match self.chains.lock().get_mut(&Self::key(table, chain)) {
            Some(rules) => {
                rules.insert(0, rulespec.iter().map(|s| s.to_string()).collect());
                Ok(())
            }
            None => Err(Self::missing(table, chain)),
        }
    }

    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        self.record(format!("-t {} -S {}", table, chain))?;
        self.chains
            .lock()
            .get(&Self::key(table, chain))
            .map(|rules| rules.iter().map(|r| listing(chain, r)).collect())
            .ok_or_else(|| Self::missing(table, chain))
    }
}

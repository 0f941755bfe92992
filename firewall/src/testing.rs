//! In-memory fakes of the kernel facilities, enforcing the same ordering
//! constraints the real ones do: a chain cannot be deleted while rules
//! reference it or while it still holds rules, and a set cannot be
//! destroyed while a rule matches against it.

use crate::ipset::{Ipset, SetKind, SetMember};
use crate::iptables::{PacketFilter, Rule};
use crate::runner::DriverError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub(crate) struct FakeKernel(Arc<Mutex<KernelState>>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct KernelState {
    pub chains: BTreeMap<String, Vec<Rule>>,
    pub sets: BTreeMap<String, (SetKind, Vec<SetMember>)>,
}

impl Default for KernelState {
    fn default() -> Self {
        let chains = ["FORWARD", "OUTPUT", "INPUT"]
            .into_iter()
            .map(|c| (c.to_string(), Vec::new()))
            .collect();
        Self {
            chains,
            sets: BTreeMap::new(),
        }
    }
}

fn fail(message: impl Into<String>) -> DriverError {
    DriverError::Failed {
        bin: "fake",
        args: message.into(),
        code: Some(2),
        stderr: String::new(),
    }
}

// === impl FakeKernel ===

impl FakeKernel {
    pub fn filter(&self) -> FakeFilter {
        FakeFilter(self.clone())
    }

    pub fn ipset(&self) -> FakeIpset {
        FakeIpset(self.clone())
    }

    pub fn state(&self) -> KernelState {
        self.0.lock().clone()
    }

    pub fn chain(&self, name: &str) -> Vec<Rule> {
        self.0
            .lock()
            .chains
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("chain {name} does not exist"))
    }

    pub fn chain_names(&self) -> Vec<String> {
        self.0.lock().chains.keys().cloned().collect()
    }

    pub fn set_names(&self) -> Vec<String> {
        self.0.lock().sets.keys().cloned().collect()
    }

    pub fn set_contents(&self, name: &str) -> (SetKind, Vec<String>) {
        let state = self.0.lock();
        let (kind, members) = state
            .sets
            .get(name)
            .unwrap_or_else(|| panic!("set {name} does not exist"));
        (*kind, members.iter().map(SetMember::render).collect())
    }
}

#[derive(Clone, Debug)]
pub(crate) struct FakeFilter(FakeKernel);

#[derive(Clone, Debug)]
pub(crate) struct FakeIpset(FakeKernel);

#[async_trait]
impl PacketFilter for FakeFilter {
    async fn ensure_chain(&self, _table: &str, chain: &str) -> Result<(), DriverError> {
        self.0
             .0
            .lock()
            .chains
            .entry(chain.to_string())
            .or_default();
        Ok(())
    }

    async fn append_unique(
        &self,
        _table: &str,
        chain: &str,
        rule: &Rule,
    ) -> Result<(), DriverError> {
        let mut state = self.0 .0.lock();
        let rules = state
            .chains
            .get_mut(chain)
            .ok_or_else(|| fail(format!("no chain {chain}")))?;
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    async fn insert(
        &self,
        _table: &str,
        chain: &str,
        position: usize,
        rule: &Rule,
    ) -> Result<(), DriverError> {
        let mut state = self.0 .0.lock();
        let rules = state
            .chains
            .get_mut(chain)
            .ok_or_else(|| fail(format!("no chain {chain}")))?;
        if position == 0 || position > rules.len() + 1 {
            return Err(fail(format!("bad position {position} in {chain}")));
        }
        rules.insert(position - 1, rule.clone());
        Ok(())
    }

    async fn exists(&self, _table: &str, chain: &str, rule: &Rule) -> Result<bool, DriverError> {
        let state = self.0 .0.lock();
        let rules = state
            .chains
            .get(chain)
            .ok_or_else(|| fail(format!("no chain {chain}")))?;
        Ok(rules.contains(rule))
    }

    async fn list(&self, _table: &str, chain: &str) -> Result<Vec<Rule>, DriverError> {
        let state = self.0 .0.lock();
        state
            .chains
            .get(chain)
            .cloned()
            .ok_or_else(|| fail(format!("no chain {chain}")))
    }

    async fn list_chains(&self, _table: &str) -> Result<Vec<String>, DriverError> {
        Ok(self.0 .0.lock().chains.keys().cloned().collect())
    }

    async fn clear_chain(&self, _table: &str, chain: &str) -> Result<(), DriverError> {
        self.0
             .0
            .lock()
            .chains
            .get_mut(chain)
            .ok_or_else(|| fail(format!("no chain {chain}")))?
            .clear();
        Ok(())
    }

    async fn delete_chain(&self, _table: &str, chain: &str) -> Result<(), DriverError> {
        let mut state = self.0 .0.lock();
        match state.chains.get(chain) {
            None => return Err(fail(format!("no chain {chain}"))),
            Some(rules) if !rules.is_empty() => {
                return Err(fail(format!("chain {chain} is not empty")))
            }
            Some(_) => {}
        }
        let referenced = state
            .chains
            .values()
            .flatten()
            .any(|rule| rule.references(chain));
        if referenced {
            return Err(fail(format!("chain {chain} is still referenced")));
        }
        state.chains.remove(chain);
        Ok(())
    }

    async fn delete(&self, _table: &str, chain: &str, rule: &Rule) -> Result<(), DriverError> {
        let mut state = self.0 .0.lock();
        let rules = state
            .chains
            .get_mut(chain)
            .ok_or_else(|| fail(format!("no chain {chain}")))?;
        let position = rules
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| fail(format!("no matching rule in {chain}")))?;
        rules.remove(position);
        Ok(())
    }
}

#[async_trait]
impl Ipset for FakeIpset {
    async fn create(&self, name: &str, kind: SetKind) -> Result<(), DriverError> {
        let mut state = self.0 .0.lock();
        match state.sets.get(name) {
            Some((existing, _)) if *existing != kind => {
                Err(fail(format!("set {name} exists with a different kind")))
            }
            Some(_) => Ok(()),
            None => {
                state.sets.insert(name.to_string(), (kind, Vec::new()));
                Ok(())
            }
        }
    }

    async fn refresh(
        &self,
        name: &str,
        kind: SetKind,
        members: &[SetMember],
    ) -> Result<(), DriverError> {
        let mut state = self.0 .0.lock();
        if let Some((existing, _)) = state.sets.get(name) {
            if *existing != kind {
                return Err(fail(format!("set {name} exists with a different kind")));
            }
        }
        state
            .sets
            .insert(name.to_string(), (kind, members.to_vec()));
        Ok(())
    }

    async fn list_sets(&self) -> Result<Vec<String>, DriverError> {
        Ok(self.0 .0.lock().sets.keys().cloned().collect())
    }

    async fn destroy(&self, name: &str) -> Result<(), DriverError> {
        let mut state = self.0 .0.lock();
        if !state.sets.contains_key(name) {
            return Err(fail(format!("no set {name}")));
        }
        let referenced = state
            .chains
            .values()
            .flatten()
            .any(|rule| rule.references(name));
        if referenced {
            return Err(fail(format!("set {name} is in use")));
        }
        state.sets.remove(name);
        Ok(())
    }
}

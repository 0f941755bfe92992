//! Adapter over the kernel packet-filter utility.
//!
//! [`PacketFilter`] is the operation surface the planner needs; the exec
//! implementation drives `iptables -w`. Rule removal is always by full rule
//! spec, never by position: listed rules are tokenized with a quote-aware
//! splitter so specs round-trip through their comments.

use crate::runner::{self, DriverError};
use async_trait::async_trait;
use netguard_core::Protocol;
use std::net::Ipv4Addr;
use std::num::NonZeroU16;

const BIN: &str = "iptables";

/// Which side of a connection an address-set match applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetDir {
    Src,
    Dst,
}

impl SetDir {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Src => "src",
            Self::Dst => "dst",
        }
    }
}

/// A rule spec: match tokens followed by a jump target, in `iptables`
/// argument order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rule(Vec<String>);

// === impl Rule ===

impl Rule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comment(self, text: impl AsRef<str>) -> Self {
        self.extend(["-m", "comment", "--comment", text.as_ref()])
    }

    pub fn match_set(self, set: &str, dir: SetDir) -> Self {
        self.extend(["-m", "set", "--match-set", set, dir.as_str()])
    }

    pub fn protocol(self, protocol: Protocol) -> Self {
        self.extend(["-p", protocol.as_str()])
    }

    pub fn dport(self, port: NonZeroU16) -> Self {
        self.extend(["--dport", &port.to_string()])
    }

    pub fn src(self, addr: Ipv4Addr) -> Self {
        self.extend(["-s", &addr.to_string()])
    }

    pub fn dst(self, addr: Ipv4Addr) -> Self {
        self.extend(["-d", &addr.to_string()])
    }

    pub fn jump(self, target: &str) -> Self {
        self.extend(["-j", target])
    }

    /// Raw match tokens for the handful of modules without a dedicated
    /// helper (addrtype, conntrack, physdev, limit).
    pub fn args<const N: usize>(self, tokens: [&str; N]) -> Self {
        self.extend(tokens)
    }

    fn extend<'t>(mut self, tokens: impl IntoIterator<Item = &'t str>) -> Self {
        self.0.extend(tokens.into_iter().map(str::to_string));
        self
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    /// Whether any token of this rule is exactly `name` — i.e. the rule
    /// jumps to or matches against it. Comment text mentioning the name
    /// does not count.
    pub fn references(&self, name: &str) -> bool {
        self.0.iter().any(|token| token == name)
    }

    /// Parses one `iptables -S` line into its chain and rule spec. Lines
    /// that do not append a rule (`-P`, `-N`) yield `None`.
    pub fn parse(line: &str) -> Option<(String, Rule)> {
        let mut tokens = tokenize(line);
        if tokens.len() < 2 || tokens[0] != "-A" {
            return None;
        }
        let chain = tokens.remove(1);
        tokens.remove(0);
        Some((chain, Rule(tokens)))
    }
}

/// Splits a listed rule into tokens, honoring double quotes and backslash
/// escapes so quoted comments survive the round trip.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Operations the planner needs from the packet-filter facility.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Creates `chain` if absent; an existing chain is success.
    async fn ensure_chain(&self, table: &str, chain: &str) -> Result<(), DriverError>;

    /// Appends `rule` unless an identical rule is already present.
    async fn append_unique(&self, table: &str, chain: &str, rule: &Rule)
        -> Result<(), DriverError>;

    /// Inserts `rule` at the 1-based `position`.
    async fn insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rule: &Rule,
    ) -> Result<(), DriverError>;

    /// Whether an identical rule is present in `chain`.
    async fn exists(&self, table: &str, chain: &str, rule: &Rule) -> Result<bool, DriverError>;

    /// The rules of `chain`, as specs.
    async fn list(&self, table: &str, chain: &str) -> Result<Vec<Rule>, DriverError>;

    /// Every chain in `table`, built-in chains included.
    async fn list_chains(&self, table: &str) -> Result<Vec<String>, DriverError>;

    /// Flushes every rule from `chain`.
    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), DriverError>;

    /// Deletes the (empty, unreferenced) `chain`.
    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), DriverError>;

    /// Deletes the rule matching `rule` exactly.
    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<(), DriverError>;
}

/// Drives the `iptables` binary. `-w` serializes against other xtables
/// writers on the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct IptablesCmd;

// === impl IptablesCmd ===

impl IptablesCmd {
    pub fn new() -> Self {
        Self
    }

    /// Fails when the utility is unusable; the agent treats that as fatal
    /// at startup.
    pub async fn probe(&self) -> Result<(), DriverError> {
        runner::run(BIN, &args(&["--version"]), None).await.map(|_| ())
    }

    fn table_args(table: &str, rest: &[&str]) -> Vec<String> {
        let mut full = vec!["-w".to_string(), "-t".to_string(), table.to_string()];
        full.extend(rest.iter().map(|s| s.to_string()));
        full
    }

    fn rule_args(table: &str, action: &[&str], rule: &Rule) -> Vec<String> {
        let mut full = Self::table_args(table, action);
        full.extend(rule.tokens().iter().cloned());
        full
    }
}

fn args(rest: &[&str]) -> Vec<String> {
    rest.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl PacketFilter for IptablesCmd {
    async fn ensure_chain(&self, table: &str, chain: &str) -> Result<(), DriverError> {
        let args = Self::table_args(table, &["-N", chain]);
        let output = runner::exec(BIN, &args, None).await?;
        // Exit status 1 is "chain already exists".
        if output.status.success() || output.status.code() == Some(1) {
            Ok(())
        } else {
            Err(runner::failure(BIN, &args, &output))
        }
    }

    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        rule: &Rule,
    ) -> Result<(), DriverError> {
        if self.exists(table, chain, rule).await? {
            return Ok(());
        }
        let args = Self::rule_args(table, &["-A", chain], rule);
        runner::run(BIN, &args, None).await.map(|_| ())
    }

    async fn insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rule: &Rule,
    ) -> Result<(), DriverError> {
        let position = position.to_string();
        let args = Self::rule_args(table, &["-I", chain, &position], rule);
        runner::run(BIN, &args, None).await.map(|_| ())
    }

    async fn exists(&self, table: &str, chain: &str, rule: &Rule) -> Result<bool, DriverError> {
        let args = Self::rule_args(table, &["-C", chain], rule);
        let output = runner::exec(BIN, &args, None).await?;
        if output.status.success() {
            Ok(true)
        } else if output.status.code() == Some(1) {
            Ok(false)
        } else {
            Err(runner::failure(BIN, &args, &output))
        }
    }

    async fn list(&self, table: &str, chain: &str) -> Result<Vec<Rule>, DriverError> {
        let out = runner::run(BIN, &Self::table_args(table, &["-S", chain]), None).await?;
        Ok(out
            .lines()
            .filter_map(Rule::parse)
            .filter(|(c, _)| c == chain)
            .map(|(_, rule)| rule)
            .collect())
    }

    async fn list_chains(&self, table: &str) -> Result<Vec<String>, DriverError> {
        let out = runner::run(BIN, &Self::table_args(table, &["-S"]), None).await?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut tokens = line.split_whitespace();
                match (tokens.next(), tokens.next()) {
                    (Some("-P") | Some("-N"), Some(chain)) => Some(chain.to_string()),
                    _ => None,
                }
            })
            .collect())
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), DriverError> {
        runner::run(BIN, &Self::table_args(table, &["-F", chain]), None)
            .await
            .map(|_| ())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), DriverError> {
        runner::run(BIN, &Self::table_args(table, &["-X", chain]), None)
            .await
            .map(|_| ())
    }

    async fn delete(&self, table: &str, chain: &str, rule: &Rule) -> Result<(), DriverError> {
        let args = Self::rule_args(table, &["-D", chain], rule);
        runner::run(BIN, &args, None).await.map(|_| ())
    }
}

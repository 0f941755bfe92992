//! Adapter over the kernel IP-set facility.
//!
//! Sets hold either plain addresses (`hash:ip`) or CIDR blocks
//! (`hash:net`); block members may carry the `nomatch` flag to carve
//! exclusions out of a containing block. A refresh replaces a set's
//! contents atomically: the new members are loaded into a scratch set which
//! is then swapped with the live one, so rules matching the set never
//! observe a partially-filled state.

use crate::runner::{self, DriverError};
use async_trait::async_trait;
use netguard_core::NetworkBlock;
use std::net::Ipv4Addr;

const BIN: &str = "ipset";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetKind {
    HashIp,
    HashNet,
}

impl SetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HashIp => "hash:ip",
            Self::HashNet => "hash:net",
        }
    }
}

/// One member of a set, rendered with the standing `timeout 0` option so
/// entries never expire on their own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetMember {
    entry: String,
    nomatch: bool,
}

// === impl SetMember ===

impl SetMember {
    pub fn address(ip: Ipv4Addr) -> Self {
        Self {
            entry: ip.to_string(),
            nomatch: false,
        }
    }

    pub fn block(block: &NetworkBlock) -> Self {
        Self {
            entry: block.net.to_string(),
            nomatch: block.nomatch,
        }
    }

    /// The member line as `ipset` consumes it.
    pub fn render(&self) -> String {
        let mut line = format!("{} timeout 0", self.entry);
        if self.nomatch {
            line.push_str(" nomatch");
        }
        line
    }
}

/// Operations the planner needs from the IP-set facility.
#[async_trait]
pub trait Ipset: Send + Sync {
    /// Creates the named set if absent; an existing set is success.
    async fn create(&self, name: &str, kind: SetKind) -> Result<(), DriverError>;

    /// Atomically replaces the set's contents with `members`.
    async fn refresh(
        &self,
        name: &str,
        kind: SetKind,
        members: &[SetMember],
    ) -> Result<(), DriverError>;

    /// The names of every set on the host.
    async fn list_sets(&self) -> Result<Vec<String>, DriverError>;

    async fn destroy(&self, name: &str) -> Result<(), DriverError>;
}

/// Drives the `ipset` binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct IpsetCmd;

// === impl IpsetCmd ===

impl IpsetCmd {
    pub fn new() -> Self {
        Self
    }

    /// Fails when the utility is unusable; the agent treats that as fatal
    /// at startup.
    pub async fn probe(&self) -> Result<(), DriverError> {
        runner::run(BIN, &["version".to_string()], None)
            .await
            .map(|_| ())
    }

    fn create_line(name: &str, kind: SetKind) -> String {
        format!("create {name} {} family inet timeout 0", kind.as_str())
    }
}

#[async_trait]
impl Ipset for IpsetCmd {
    async fn create(&self, name: &str, kind: SetKind) -> Result<(), DriverError> {
        let args: Vec<String> = [
            "-exist",
            "create",
            name,
            kind.as_str(),
            "family",
            "inet",
            "timeout",
            "0",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        runner::run(BIN, &args, None).await.map(|_| ())
    }

    async fn refresh(
        &self,
        name: &str,
        kind: SetKind,
        members: &[SetMember],
    ) -> Result<(), DriverError> {
        // Scratch names stay inside the kernel's 31-character limit because
        // set names are at most 25 characters.
        let scratch = format!("{name}-tmp");
        let mut script = String::new();
        script.push_str(&Self::create_line(&scratch, kind));
        script.push('\n');
        script.push_str(&format!("flush {scratch}\n"));
        for member in members {
            script.push_str(&format!("add {scratch} {}\n", member.render()));
        }
        script.push_str(&Self::create_line(name, kind));
        script.push('\n');
        script.push_str(&format!("swap {scratch} {name}\n"));
        script.push_str(&format!("destroy {scratch}\n"));

        let args = vec!["-exist".to_string(), "restore".to_string()];
        runner::run(BIN, &args, Some(&script)).await.map(|_| ())
    }

    async fn list_sets(&self) -> Result<Vec<String>, DriverError> {
        let out = runner::run(BIN, &["list".to_string(), "-n".to_string()], None).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn destroy(&self, name: &str) -> Result<(), DriverError> {
        runner::run(BIN, &["destroy".to_string(), name.to_string()], None)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_render_with_timeout_and_nomatch() {
        assert_eq!(
            SetMember::address("10.0.0.5".parse().unwrap()).render(),
            "10.0.0.5 timeout 0",
        );
        assert_eq!(
            SetMember::block(&NetworkBlock {
                net: "10.0.0.0/8".parse().unwrap(),
                nomatch: true,
            })
            .render(),
            "10.0.0.0/8 timeout 0 nomatch",
        );
    }

    #[test]
    fn open_block_entries_render_as_split_halves() {
        let members: Vec<String> =
            netguard_core::block_entries("0.0.0.0/0", &["10.0.0.0/8".to_string()])
                .unwrap()
                .iter()
                .map(|block| SetMember::block(block).render())
                .collect();
        assert_eq!(
            members,
            [
                "0.0.0.0/1 timeout 0",
                "128.0.0.0/1 timeout 0",
                "10.0.0.0/8 timeout 0 nomatch",
            ],
        );
    }
}

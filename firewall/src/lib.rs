#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The kernel-facing half of the agent.
//!
//! [`FirewallSync`] turns the resolved policy model into layered `filter`
//! table state: per-policy chains holding ACCEPT rules matched against
//! named address sets, and per-pod chains that divert the pod's traffic
//! through every applicable policy chain before rejecting it. Chain names
//! mix in a per-reconcile epoch so that whatever a previous (possibly
//! half-applied) reconcile left behind can be garbage-collected by name.
//!
//! The drivers ([`PacketFilter`], [`Ipset`]) adapt the `iptables` and
//! `ipset` utilities; in-memory fakes back the test suites.

mod cleanup;
pub mod ipset;
pub mod iptables;
mod metrics;
pub mod names;
mod runner;
mod sync;
#[cfg(test)]
mod testing;

pub use self::ipset::{Ipset, IpsetCmd, SetKind, SetMember};
pub use self::iptables::{IptablesCmd, PacketFilter, Rule, SetDir};
pub use self::metrics::SyncMetrics;
pub use self::runner::DriverError;
pub use self::sync::{FirewallSync, FILTER};

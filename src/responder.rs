//! Namespaced DHCPv4, DHCPv6 and NDP responder services
//!
//! Provides:
//! - Typed service configurations derived from a `NetworkContext`
//! - Rendering and atomic writing of the systemd units that run them

pub mod spec;
pub mod unit;

pub use spec::{Protocol, ServiceSpec};
pub use unit::{ServiceUnit, UnitWriter};

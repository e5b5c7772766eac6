//! Network parameter resolution for VM namespaces
//!
//! Provides:
//! - VPC address allocation (static, config-backed)
//! - Namespace and interface naming for VMs
//! - Resolution of addresses, DNS servers and MTU into a `NetworkContext`

pub mod ip;
pub mod naming;
pub mod resolve;

pub use ip::{AddressAllocator, StaticAllocator};
pub use naming::{vm_iface, vm_namespace};
pub use resolve::{HostContext, NetworkContext, Resolver};

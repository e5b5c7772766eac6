//! Namespace and interface names for VMs
//!
//! Linux limits interface names to 15 characters, so names are built from a
//! short hash of the VM id rather than the id itself.

use sha2::{Digest, Sha256};

const HASH_LEN: usize = 12;

fn short_hash(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_LEN);
    hash
}

/// Network namespace of a VM adapter (e.g., "n3f2a9c01b7d40")
pub fn vm_namespace(vm_id: &str, index: usize) -> String {
    format!("n{}{}", short_hash(vm_id), index)
}

/// Host-side interface of a VM adapter, facing the namespace bridge
pub fn vm_iface(vm_id: &str, index: usize) -> String {
    format!("v{}{}", short_hash(vm_id), index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_fit_ifnamsiz() {
        let id = "65f1c2a9e4b0a1d2c3e4f5a6";
        assert!(vm_iface(id, 0).len() <= 15);
        assert!(vm_namespace(id, 9).len() <= 15);
    }

    #[test]
    fn test_names_are_stable() {
        let id = "65f1c2a9e4b0a1d2c3e4f5a6";
        assert_eq!(vm_iface(id, 0), vm_iface(id, 0));
        assert_eq!(vm_iface(id, 0)[1..], vm_namespace(id, 0)[1..]);
        assert_ne!(vm_iface(id, 0), vm_iface("other", 0));
        assert!(vm_iface(id, 0).starts_with('v'));
        assert!(vm_namespace(id, 0).ends_with('0'));
    }
}

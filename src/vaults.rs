//! # Vault Access Control
//!
//! Which peers may pull which vaults over the git sub-protocol.
//!
//! Access is deny-by-default: a peer can see and pull a vault only after it
//! has been shared with that peer. Pack requests for one vault are also
//! serialized through a per-vault lock, so two peers pushing into the same
//! vault cannot interleave their commits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::identity::PublicKey;
use crate::protocols::VaultProvider;

#[derive(Clone, Default)]
pub struct VaultAccess {
    shares: Arc<RwLock<HashMap<String, HashSet<PublicKey>>>>,
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl std::fmt::Debug for VaultAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultAccess")
            .field("vaults", &self.read().len())
            .finish()
    }
}

impl VaultAccess {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HashSet<PublicKey>>> {
        self.shares.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashSet<PublicKey>>> {
        self.shares.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false if `peer` already had access.
    pub fn share_vault(&self, vault: &str, peer: &PublicKey) -> bool {
        let added = self
            .write()
            .entry(vault.to_string())
            .or_default()
            .insert(peer.clone());
        if added {
            debug!(vault, peer = %peer.short(), "vault shared");
        }
        added
    }

    /// Returns false if `peer` had no access to begin with.
    pub fn unshare_vault(&self, vault: &str, peer: &PublicKey) -> bool {
        let mut shares = self.write();
        let Some(peers) = shares.get_mut(vault) else {
            return false;
        };
        let removed = peers.remove(peer);
        if peers.is_empty() {
            shares.remove(vault);
        }
        if removed {
            debug!(vault, peer = %peer.short(), "vault unshared");
        }
        removed
    }

    pub fn peer_can_access(&self, vault: &str, peer: &PublicKey) -> bool {
        self.read()
            .get(vault)
            .is_some_and(|peers| peers.contains(peer))
    }

    /// Peers `vault` is shared with, ordered by key.
    pub fn shared_with(&self, vault: &str) -> Vec<PublicKey> {
        let mut peers: Vec<PublicKey> = self
            .read()
            .get(vault)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Drop every share of a deleted vault.
    pub fn forget_vault(&self, vault: &str) {
        self.write().remove(vault);
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(vault);
    }

    /// The provider's vaults that `peer` may see.
    pub fn vault_names_for(&self, provider: &dyn VaultProvider, peer: &PublicKey) -> Vec<String> {
        provider
            .vault_names()
            .into_iter()
            .filter(|name| self.peer_can_access(name, peer))
            .collect()
    }

    /// Exclusive access to `vault` for one read-modify-commit sequence.
    pub async fn lock_vault(&self, vault: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(vault.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocols::VaultFileSystem;
    use std::time::Duration;

    struct Names(Vec<&'static str>);

    impl VaultProvider for Names {
        fn vault_names(&self) -> Vec<String> {
            self.0.iter().map(|s| s.to_string()).collect()
        }

        fn file_system(&self, vault_name: &str) -> anyhow::Result<Arc<dyn VaultFileSystem>> {
            anyhow::bail!("no file system for {}", vault_name)
        }
    }

    #[test]
    fn access_is_denied_until_shared() {
        let access = VaultAccess::new();
        let peer = Keypair::generate().public_key();
        assert!(!access.peer_can_access("notes", &peer));

        assert!(access.share_vault("notes", &peer));
        assert!(!access.share_vault("notes", &peer));
        assert!(access.peer_can_access("notes", &peer));
        assert!(!access.peer_can_access("photos", &peer));

        assert!(access.unshare_vault("notes", &peer));
        assert!(!access.unshare_vault("notes", &peer));
        assert!(!access.peer_can_access("notes", &peer));
        assert!(access.shared_with("notes").is_empty());
    }

    #[test]
    fn vault_names_are_filtered_per_peer() {
        let access = VaultAccess::new();
        let alice = Keypair::generate().public_key();
        let bob = Keypair::generate().public_key();
        access.share_vault("notes", &alice);
        access.share_vault("photos", &alice);
        access.share_vault("photos", &bob);

        let provider = Names(vec!["notes", "photos", "taxes"]);
        assert_eq!(access.vault_names_for(&provider, &alice), vec!["notes", "photos"]);
        assert_eq!(access.vault_names_for(&provider, &bob), vec!["photos"]);

        access.forget_vault("photos");
        assert!(access.vault_names_for(&provider, &bob).is_empty());
    }

    #[tokio::test]
    async fn vault_lock_is_exclusive_per_vault() {
        let access = VaultAccess::new();
        let held = access.lock_vault("notes").await;

        let other_vault = tokio::time::timeout(Duration::from_millis(100), access.lock_vault("photos")).await;
        assert!(other_vault.is_ok());

        let same_vault = tokio::time::timeout(Duration::from_millis(100), access.lock_vault("notes")).await;
        assert!(same_vault.is_err());

        drop(held);
        let after = tokio::time::timeout(Duration::from_millis(100), access.lock_vault("notes")).await;
        assert!(after.is_ok());
    }
}

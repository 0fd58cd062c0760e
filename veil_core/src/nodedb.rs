/*! In-memory store of verified router contacts.

Disk persistence of the store is handled outside the core; hop selection and
router lookups only consume this interface.

*/

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::IteratorRandom;
use rand::thread_rng;
use tokio::sync::RwLock;

use veil_packet::router_contact::{RouterContact, RouterId};

use crate::service::errors::HandleGotRouterError;

/// Store of router contacts whose signatures have been verified.
#[derive(Clone, Default)]
pub struct NodeDb {
    contacts: Arc<RwLock<HashMap<RouterId, RouterContact>>>,
}

impl NodeDb {
    /// Create an empty `NodeDb`.
    pub fn new() -> NodeDb {
        NodeDb::default()
    }

    /// Get the contact of a router if we know it.
    pub async fn get(&self, id: &RouterId) -> Option<RouterContact> {
        self.contacts.read().await.get(id).cloned()
    }

    /// Check whether a router is known.
    pub async fn has(&self, id: &RouterId) -> bool {
        self.contacts.read().await.contains_key(id)
    }

    /// Number of known routers.
    pub async fn len(&self) -> usize {
        self.contacts.read().await.len()
    }

    /// Check whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.contacts.read().await.is_empty()
    }

    /// Insert a contact that was already verified, e.g. loaded from the
    /// persistent store at start.
    pub async fn put(&self, rc: RouterContact) {
        self.contacts.write().await.insert(rc.id, rc);
    }

    /// Verify a contact received from the network and insert it. The store
    /// stays unchanged when verification fails.
    pub async fn put_if_valid(&self, rc: RouterContact) -> Result<(), HandleGotRouterError> {
        if !rc.verify_signature() {
            return Err(HandleGotRouterError::InvalidSignature);
        }
        debug!("verified and stored contact for {}", rc.id);
        self.contacts.write().await.insert(rc.id, rc);
        Ok(())
    }

    /// Snapshot of all known contacts, used for hop selection.
    pub async fn snapshot(&self) -> Vec<RouterContact> {
        self.contacts.read().await.values().cloned().collect()
    }

    /// Pick a random known router excluding the given ids.
    pub async fn random_excluding(&self, exclude: &[RouterId]) -> Option<RouterContact> {
        self.contacts
            .read()
            .await
            .values()
            .filter(|rc| !exclude.contains(&rc.id))
            .choose(&mut thread_rng())
            .cloned()
    }
}

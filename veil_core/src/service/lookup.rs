/*! Managing lookup transaction ids and timeouts.
*/

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use veil_packet::service_info::{Address, Tag};

use crate::time::*;
use crate::utils::gen_tx_id;

/// How long a pending introset or router lookup may stay unanswered.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// What a pending lookup transaction is waiting for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PendingLookup {
    /// First lookup of a hidden service address; completion hooks are keyed
    /// by the address in the endpoint.
    HiddenService {
        /// Address being looked up.
        addr: Address,
    },
    /// Refresh of the introset backing an existing outbound context.
    IntroSetUpdate {
        /// Address of the context being refreshed.
        addr: Address,
    },
    /// Lookup of introsets published under a topic tag.
    Tag {
        /// The tag being looked up.
        tag: Tag,
    },
}

/// Struct that stores and manages lookup transaction ids and timeouts.
/// Every transaction id stores generic companion data.
#[derive(Clone, Debug)]
pub struct LookupQueue<T> {
    /// Map that stores transaction ids with the time they were generated and
    /// some generic lookup data.
    tx_map: HashMap<u64, (Instant, T)>,
    /// Timeout when transaction ids are considered invalid.
    timeout: Duration,
}

impl<T> LookupQueue<T> {
    /// Create new `LookupQueue`.
    pub fn new(timeout: Duration) -> LookupQueue<T> {
        LookupQueue {
            tx_map: HashMap::new(),
            timeout,
        }
    }

    /// Generate and store a unique non-zero transaction id. Later this id
    /// can be claimed back with `check_tx_id`.
    pub fn new_tx_id(&mut self, data: T) -> u64 {
        let tx_id = loop {
            let tx_id = gen_tx_id();
            if !self.tx_map.contains_key(&tx_id) {
                break tx_id;
            }
        };
        self.tx_map.insert(tx_id, (clock_now(), data));
        tx_id
    }

    /// Check whether a transaction id is known and not timed out. When the
    /// stored data satisfies the condition the entry is removed and
    /// returned, so an id can be claimed only once.
    pub fn check_tx_id<F: FnOnce(&T) -> bool>(&mut self, tx_id: u64, cond: F) -> Option<T> {
        if tx_id == 0 {
            return None;
        }
        if let Entry::Occupied(entry) = self.tx_map.entry(tx_id) {
            let (time, data) = entry.get();
            if clock_elapsed(*time) <= self.timeout && cond(data) {
                let (_tx_id, (_time, data)) = entry.remove_entry();
                Some(data)
            } else {
                None
            }
        } else {
            None
        }
    }

    /// Remove and return every timed out transaction so the owner can fire
    /// its handler with an empty result.
    pub fn drain_timed_out(&mut self) -> Vec<(u64, T)> {
        let timeout = self.timeout;
        let expired = self
            .tx_map
            .iter()
            .filter(|(_, (time, _))| clock_elapsed(*time) > timeout)
            .map(|(&tx_id, _)| tx_id)
            .collect::<Vec<_>>();
        expired
            .into_iter()
            .map(|tx_id| {
                let (_, data) = self.tx_map.remove(&tx_id).unwrap();
                (tx_id, data)
            })
            .collect()
    }

    /// Whether any pending entry satisfies the condition.
    pub fn any<F: Fn(&T) -> bool>(&self, cond: F) -> bool {
        self.tx_map.values().any(|(_, data)| cond(data))
    }
}

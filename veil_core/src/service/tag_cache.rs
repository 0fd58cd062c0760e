/*! Cache of introsets found under a prefetched topic tag.
*/

use std::time::{Duration, Instant};

use veil_packet::introset::IntroSet;
use veil_packet::service_info::Tag;

use crate::time::*;

/// How often a prefetched tag is looked up again.
pub const TAG_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Lookup state and results for one prefetched tag.
#[derive(Clone, Debug)]
pub struct CachedTagResult {
    /// The tag this cache is for.
    pub tag: Tag,
    /// Time the last lookup for this tag was sent.
    last_request: Option<Instant>,
    /// Time the result set last changed.
    last_modified: Option<Instant>,
    /// Introsets currently known under the tag.
    pub result: Vec<IntroSet>,
}

impl CachedTagResult {
    /// Create an empty cache for a tag.
    pub fn new(tag: Tag) -> CachedTagResult {
        CachedTagResult {
            tag,
            last_request: None,
            last_modified: None,
            result: Vec::new(),
        }
    }

    /// Merge the introsets of a lookup response into the cache.
    pub fn handle_response(&mut self, introsets: Vec<IntroSet>) {
        let mut modified = false;
        for introset in introsets {
            if !self.result.contains(&introset) {
                self.result.push(introset);
                modified = true;
            }
        }
        if modified {
            self.last_modified = Some(clock_now());
        }
        debug!(
            "tag {} has {} cached introsets",
            self.tag,
            self.result.len()
        );
    }

    /// Drop introsets whose introductions have all expired.
    pub fn expire(&mut self, now_ms: u64) {
        let before = self.result.len();
        self.result.retain(|introset| !introset.has_expired_intros(now_ms));
        if self.result.len() != before {
            self.last_modified = Some(clock_now());
        }
    }

    /// Whether it is time to look the tag up again.
    pub fn should_refresh(&self) -> bool {
        match self.last_request {
            Some(last_request) => clock_elapsed(last_request) >= TAG_REFRESH_INTERVAL,
            None => true,
        }
    }

    /// Note that a lookup for this tag was just sent.
    pub fn mark_requested(&mut self) {
        self.last_request = Some(clock_now());
    }
}

/*! Per-remote state for talking to another hidden service.

An outbound context pins its aligned paths to the router of the selected
introduction and re-selects the introduction before it expires. The
conversation key itself lives in the endpoint's conversation table, keyed by
the tag stored here.

*/

use veil_packet::introset::{IntroSet, Introduction};
use veil_packet::protocol::ProtocolType;
use veil_packet::router_contact::RouterId;
use veil_packet::service_info::{Address, ConvoTag};

use crate::path::{Path, PathSet};

/// An introduction this close to expiry (or already expired) triggers
/// re-selection and an introset refresh.
pub const INTRO_SHIFT_MARGIN_MS: u64 = 30_000;

/// Outbound conversation state for one remote hidden service.
#[derive(Clone, Debug)]
pub struct OutboundContext {
    /// Last known introset of the remote.
    pub current_introset: IntroSet,
    /// The introduction our aligned paths terminate at.
    pub selected_intro: Introduction,
    /// Conversation tag, set once the first frame was generated.
    pub tag: Option<ConvoTag>,
    /// Aligned paths to the selected introduction's router.
    pub paths: PathSet,
    /// Payloads queued until an aligned path is up.
    pub pending_payloads: Vec<(ProtocolType, Vec<u8>)>,
    /// Whether an introset refresh lookup is pending.
    pub update_in_flight: bool,
}

impl OutboundContext {
    /// Create a context for a freshly looked up introset and select its
    /// best introduction.
    pub fn new(introset: IntroSet, num_paths: usize, num_hops: usize) -> OutboundContext {
        let mut context = OutboundContext {
            current_introset: introset,
            selected_intro: Introduction::default(),
            tag: None,
            paths: PathSet::new(num_paths, num_hops),
            pending_payloads: Vec::new(),
            update_in_flight: false,
        };
        context.shift_introduction();
        context
    }

    /// Address of the remote service.
    pub fn remote_addr(&self) -> Address {
        self.current_introset.info.address()
    }

    /// Select the introduction that expires last. Returns the router of the
    /// selection so the caller can make sure its contact is known.
    pub fn shift_introduction(&mut self) -> Option<RouterId> {
        for intro in &self.current_introset.intros {
            if intro.expires_at > self.selected_intro.expires_at {
                self.selected_intro = *intro;
            }
        }
        if self.selected_intro.router.is_zero() {
            None
        } else {
            Some(self.selected_intro.router)
        }
    }

    /// Handle the result of an introset refresh. A missing or older set
    /// leaves the current one in place.
    pub fn on_intro_set_update(&mut self, introset: Option<IntroSet>) {
        self.update_in_flight = false;
        if let Some(introset) = introset {
            if introset.is_newer_than(&self.current_introset) {
                debug!("refreshed introset for {}", self.remote_addr());
                self.current_introset = introset;
            }
        }
    }

    /// Whether the selected introduction is expired or about to expire, so
    /// selection must re-run and the introset be refreshed.
    pub fn needs_intro_update(&self, now_ms: u64) -> bool {
        self.selected_intro.expires_at <= now_ms
            || self.selected_intro.expires_at - now_ms < INTRO_SHIFT_MARGIN_MS
    }

    /// The established path aligned to the selected introduction, if any.
    pub fn aligned_path(&self) -> Option<&Path> {
        self.paths.get_path_by_router(self.selected_intro.router)
    }
}

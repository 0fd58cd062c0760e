/*! A single constructed circuit through the overlay.

A path is an ordered list of hops. Each hop holds the pair of path ids it
routes by and the two symmetric keys agreed with it during the build: one for
traffic moving away from us, one for traffic coming back. Routing messages
are onion wrapped: one layer per hop, outermost for the first hop.

*/

pub mod pathset;

pub use self::pathset::*;

use std::time::{Duration, Instant};

use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::XSalsa20Poly1305;

use veil_binary_io::*;
use veil_crypto::*;
use veil_packet::error::GetPayloadError;
use veil_packet::fragment::MAX_LINK_MSG_SIZE;
use veil_packet::introset::Introduction;
use veil_packet::link::{LinkMessage, RelayFrame};
use veil_packet::path_id::PathId;
use veil_packet::router_contact::{RouterContact, RouterId};
use veil_packet::routing::RoutingMessage;

/// How long a built path stays usable.
pub const PATH_LIFETIME: Duration = Duration::from_secs(600);

/// A path older than its lifetime minus this margin is replaced.
pub const REBUILD_MARGIN: Duration = Duration::from_secs(60);

/// A path still building after this long has failed.
pub const PATH_BUILD_TIMEOUT: Duration = Duration::from_secs(30);

/// Status of a path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathStatus {
    /// The build is in flight.
    Building,
    /// The path is usable.
    Established,
    /// The build failed or timed out.
    Timeout,
    /// The path reached the end of its lifetime.
    Expired,
}

/// One hop of a path.
#[derive(Clone, Debug)]
pub struct PathHop {
    /// Contact of the router at this hop.
    pub rc: RouterContact,
    /// Path id this hop routes our inbound traffic by.
    pub rx_id: PathId,
    /// Path id this hop routes our outbound traffic by.
    pub tx_id: PathId,
    /// Key for traffic moving away from us.
    pub forward_key: SessionKey,
    /// Key for traffic coming back to us.
    pub backward_key: SessionKey,
}

impl PathHop {
    /// Create a hop for a router with fresh ids and keys, as the build
    /// exchange would agree them.
    pub fn new(rc: RouterContact) -> PathHop {
        PathHop {
            rc,
            rx_id: PathId::random(),
            tx_id: PathId::random(),
            forward_key: rand::random(),
            backward_key: rand::random(),
        }
    }
}

/// A single constructed circuit.
#[derive(Clone, Debug)]
pub struct Path {
    hops: Vec<PathHop>,
    /// Current status.
    pub status: PathStatus,
    created_at: Instant,
    built_at: Option<Instant>,
    expires_at: Option<Instant>,
    intro: Introduction,
}

impl Path {
    /// Create a path over the given hops in `Building` state.
    pub fn new(hops: Vec<PathHop>) -> Path {
        Path {
            hops,
            status: PathStatus::Building,
            created_at: crate::time::clock_now(),
            built_at: None,
            expires_at: None,
            intro: Introduction::default(),
        }
    }

    /// First hop of the path.
    pub fn upstream(&self) -> RouterId {
        self.hops[0].rc.id
    }

    /// Our receive path id at the first hop. Together with
    /// [`Path::upstream`] this uniquely indexes the path.
    pub fn rx_id(&self) -> PathId {
        self.hops[0].rx_id
    }

    /// Our transmit path id at the first hop.
    pub fn tx_id(&self) -> PathId {
        self.hops[0].tx_id
    }

    /// Router at the far end of the path.
    pub fn endpoint_router(&self) -> RouterId {
        self.hops[self.hops.len() - 1].rc.id
    }

    /// The introduction this path provides once established.
    pub fn intro(&self) -> &Introduction {
        &self.intro
    }

    /// Mark the path as built.
    pub fn handle_built(&mut self, now: Instant, now_ms: u64) {
        self.status = PathStatus::Established;
        self.built_at = Some(now);
        self.expires_at = Some(now + PATH_LIFETIME);
        let last = &self.hops[self.hops.len() - 1];
        self.intro = Introduction {
            router: last.rc.id,
            path_id: last.rx_id,
            expires_at: now_ms + PATH_LIFETIME.as_millis() as u64,
        };
    }

    /// Whether an established path is past its rebuild point.
    pub fn is_expiring(&self, now: Instant) -> bool {
        match (self.status, self.expires_at) {
            (PathStatus::Established, Some(expires_at)) => now + REBUILD_MARGIN >= expires_at,
            _ => false,
        }
    }

    /// Whether a building path has waited too long for its build to finish.
    pub fn build_timed_out(&self, now: Instant) -> bool {
        self.status == PathStatus::Building
            && now.saturating_duration_since(self.created_at) >= PATH_BUILD_TIMEOUT
    }

    /// Onion wrap a routing message for sending along the path. The
    /// outermost layer belongs to the first hop.
    pub fn wrap_upstream(&self, msg: &RoutingMessage) -> LinkMessage {
        let mut buf = vec![0; MAX_LINK_MSG_SIZE];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let mut data = buf[..size].to_vec();

        let nonce = gen_nonce();
        for hop in self.hops.iter().rev() {
            let cipher = XSalsa20Poly1305::new((&hop.forward_key).into());
            data = cipher.encrypt((&nonce).into(), data.as_slice()).unwrap();
        }
        LinkMessage::RelayUpstream(RelayFrame {
            path_id: self.tx_id(),
            nonce,
            payload: data,
        })
    }

    /// Remove the onion layers of a frame that travelled the path back to us
    /// and parse the routing message inside.
    pub fn unwrap_downstream(&self, frame: &RelayFrame) -> Result<RoutingMessage, GetPayloadError> {
        let mut data = frame.payload.clone();
        for hop in self.hops.iter() {
            let cipher = XSalsa20Poly1305::new((&hop.backward_key).into());
            data = cipher
                .decrypt((&frame.nonce).into(), data.as_slice())
                .map_err(|_| GetPayloadError::Decrypt)?;
        }
        match RoutingMessage::from_bytes(&data) {
            Err(error) => Err(GetPayloadError::Deserialize {
                error: error.to_owned(),
                payload: data.clone(),
            }),
            Ok((_, msg)) => Ok(msg),
        }
    }

    /// Remove all forward layers of an upstream frame, as the chain of
    /// relays would.
    #[cfg(test)]
    pub(crate) fn peel_forward(&self, frame: &RelayFrame) -> Option<Vec<u8>> {
        let mut data = frame.payload.clone();
        for hop in self.hops.iter() {
            let cipher = XSalsa20Poly1305::new((&hop.forward_key).into());
            data = cipher.decrypt((&frame.nonce).into(), data.as_slice()).ok()?;
        }
        Some(data)
    }

    /// Apply all backward layers to a routing message, as the chain of
    /// relays would for a frame travelling back to the path owner.
    #[cfg(test)]
    pub(crate) fn wrap_downstream(&self, msg: &RoutingMessage) -> RelayFrame {
        let mut buf = vec![0; MAX_LINK_MSG_SIZE];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let mut data = buf[..size].to_vec();
        let nonce = gen_nonce();
        for hop in self.hops.iter().rev() {
            let cipher = XSalsa20Poly1305::new((&hop.backward_key).into());
            data = cipher.encrypt((&nonce).into(), data.as_slice()).unwrap();
        }
        RelayFrame {
            path_id: self.rx_id(),
            nonce,
            payload: data,
        }
    }
}

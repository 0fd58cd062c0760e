/*! Link layer: owns the stream transport boundary and the set of sessions
keyed by remote transport address.

The transport itself (a uTP style reliable stream over datagrams) lives
outside the core. The link layer drives it through a command channel and is
driven by it through the `handle_*` callbacks, which the router loop invokes.

*/

pub mod errors;
mod session;

pub use self::session::*;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::channel::mpsc;
use rand::thread_rng;
use tokio::sync::RwLock;

use veil_crypto::{PublicKey, SecretKey};
use veil_packet::link::LinkMessage;
use veil_packet::router_contact::{RouterContact, RouterId};

use self::errors::*;

/// Commands the link layer issues to the stream transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportCmd {
    /// Dial a remote transport address.
    Connect(SocketAddr),
    /// Write bytes to the stream with a remote.
    Send(SocketAddr, Vec<u8>),
    /// Tear down the stream with a remote.
    Close(SocketAddr),
}

/// Shorthand for the transmit half of the message channel for delivering
/// whole link messages upward with the id of the router that sent them.
type MessageTx = mpsc::UnboundedSender<(RouterId, LinkMessage)>;

/// Shorthand for the transmit half of the message channel for reporting a
/// session becoming ready or closed.
type StatusTx = mpsc::UnboundedSender<(RouterId, bool)>;

/// Arguments for creating a new `LinkLayer`.
#[derive(Clone)]
pub struct LinkLayerNewArgs {
    /// Sink for commands to the stream transport.
    pub transport_tx: mpsc::Sender<TransportCmd>,
    /// Sink for completed link messages.
    pub message_tx: MessageTx,
    /// Sink for session status changes.
    pub status_tx: StatusTx,
    /// Our transport secret key.
    pub transport_sk: SecretKey,
    /// Our signed router contact.
    pub local_rc: RouterContact,
}

/// Owner of all link sessions of this node.
#[derive(Clone)]
pub struct LinkLayer {
    transport_tx: mpsc::Sender<TransportCmd>,
    message_tx: MessageTx,
    status_tx: StatusTx,
    transport_sk: Arc<RwLock<SecretKey>>,
    local_rc: Arc<RwLock<RouterContact>>,
    sessions: Arc<RwLock<HashMap<SocketAddr, Session>>>,
    addrs_by_router: Arc<RwLock<HashMap<RouterId, SocketAddr>>>,
}

impl LinkLayer {
    /// Create a new `LinkLayer`.
    pub fn new(args: LinkLayerNewArgs) -> LinkLayer {
        LinkLayer {
            transport_tx: args.transport_tx,
            message_tx: args.message_tx,
            status_tx: args.status_tx,
            transport_sk: Arc::new(RwLock::new(args.transport_sk)),
            local_rc: Arc::new(RwLock::new(args.local_rc)),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            addrs_by_router: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Generate a fresh transport keypair.
    pub fn keygen() -> SecretKey {
        SecretKey::generate(&mut thread_rng())
    }

    /// Install a new transport secret key and return its public half. The
    /// caller must re-sign and install the router contact afterwards.
    pub async fn set_transport_key(&self, sk: SecretKey) -> PublicKey {
        let pk = sk.public_key();
        *self.transport_sk.write().await = sk;
        pk
    }

    /// Install a re-signed local router contact and renegotiate every ready
    /// session with it.
    pub async fn set_local_rc(&self, rc: RouterContact) {
        *self.local_rc.write().await = rc.clone();
        let transport_sk = self.transport_sk.read().await.clone();
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut() {
            if session.is_ready() {
                if let Err(e) = session.rehandshake(rc.clone(), transport_sk.clone()) {
                    warn!("rehandshake with {} failed: {}", session.remote_addr(), e);
                }
                session.pump_write(&self.transport_tx);
            }
        }
    }

    /// Open an outbound session to a router and ask the transport to dial
    /// it. The handshake continues in [`LinkLayer::handle_connected`].
    pub async fn new_outbound_session(&self, rc: RouterContact) -> Result<(), NewSessionError> {
        let addr = rc.addr.to_saddr();
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&addr) {
            return Err(NewSessionError::AlreadyExists);
        }
        let session = Session::new_outbound(
            self.local_rc.read().await.clone(),
            self.transport_sk.read().await.clone(),
            rc.clone(),
            addr,
        );
        sessions.insert(addr, session);
        self.addrs_by_router.write().await.insert(rc.id, addr);
        self.transport_tx
            .clone()
            .try_send(TransportCmd::Connect(addr))
            .map_err(|_| NewSessionError::Transport)
    }

    /// Transport callback: an outbound connection is established.
    pub async fn handle_connected(&self, addr: SocketAddr) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&addr) {
            if let Err(e) = session.handle_connected() {
                warn!("handshake with {} failed: {}", addr, e);
                session.close();
                return;
            }
            session.pump_write(&self.transport_tx);
        }
    }

    /// Transport callback: an inbound connection was accepted.
    pub async fn handle_accept(&self, addr: SocketAddr) {
        let session = Session::new_inbound(
            self.local_rc.read().await.clone(),
            self.transport_sk.read().await.clone(),
            addr,
        );
        self.sessions.write().await.insert(addr, session);
    }

    /// Transport callback: the stream with a remote failed.
    pub async fn handle_error(&self, addr: SocketAddr) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&addr) {
            session.close();
        }
    }

    /// Transport callback: bytes arrived from a remote. Completed messages
    /// are delivered to the message sink in arrival order.
    pub async fn handle_recv(&self, addr: SocketAddr, data: &[u8]) {
        let mut sessions = self.sessions.write().await;
        let session = match sessions.get_mut(&addr) {
            Some(session) => session,
            None => {
                trace!("bytes from {} without a session", addr);
                return;
            }
        };
        let was_ready = session.is_ready();
        let messages = match session.handle_recv(data) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("session with {} died: {}", addr, e);
                self.notify_status(session, false);
                return;
            }
        };
        // the handshake reply, if one was produced, goes out now
        session.pump_write(&self.transport_tx);
        if !was_ready && session.is_ready() {
            if let Some(rc) = session.remote_rc() {
                self.addrs_by_router.write().await.insert(rc.id, addr);
            }
            self.notify_status(session, true);
        }
        if let Some(rc) = session.remote_rc() {
            let id = rc.id;
            for msg in messages {
                if self.message_tx.unbounded_send((id, msg)).is_err() {
                    warn!("link message sink is gone");
                }
            }
        }
    }

    fn notify_status(&self, session: &Session, up: bool) {
        if let Some(rc) = session.remote_rc() {
            if self.status_tx.unbounded_send((rc.id, up)).is_err() {
                warn!("session status sink is gone");
            }
        }
    }

    /// Queue a link message for a router and pump it into the transport.
    pub async fn send_to_router(
        &self,
        id: RouterId,
        msg: &LinkMessage,
    ) -> Result<(), SendToRouterError> {
        let addr = match self.addrs_by_router.read().await.get(&id) {
            Some(addr) => *addr,
            None => return Err(SendToRouterError::UnknownRouter),
        };
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&addr)
            .ok_or(SendToRouterError::UnknownRouter)?;
        session.queue_write_buffers(msg)?;
        session.pump_write(&self.transport_tx);
        Ok(())
    }

    /// Whether a ready session with a router exists.
    pub async fn has_session_to(&self, id: RouterId) -> bool {
        let addr = match self.addrs_by_router.read().await.get(&id) {
            Some(addr) => *addr,
            None => return false,
        };
        self.sessions
            .read()
            .await
            .get(&addr)
            .map(|session| session.is_ready())
            .unwrap_or(false)
    }

    /// Tick all sessions and drop the ones that closed.
    pub async fn tick(&self, now: Instant) {
        let mut sessions = self.sessions.write().await;
        let mut closed = Vec::new();
        for (addr, session) in sessions.iter_mut() {
            session.tick_impl(now);
            session.pump_write(&self.transport_tx);
            if session.status() == SessionStatus::Closed {
                closed.push(*addr);
            }
        }
        for addr in closed {
            if let Some(session) = sessions.remove(&addr) {
                self.notify_status(&session, false);
                if let Some(rc) = session.remote_rc() {
                    self.addrs_by_router.write().await.remove(&rc.id);
                }
                let _ = self
                    .transport_tx
                    .clone()
                    .try_send(TransportCmd::Close(addr));
                debug!("removed closed session with {}", addr);
            }
        }
    }

    /// Number of sessions, ready or not.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/*! One authenticated, encrypted link session with a remote router.

A session frames link messages into 608 byte fragments over a reliable
stream transport. The handshake exchanges link intro messages: each side
sends its router contact and a key-exchange nonce, and derives its transmit
key as `H(DH ‖ own nonce)` and its receive key as `H(DH ‖ remote nonce)`,
so the pairs line up on both ends. The first intro in each direction is
encrypted under the receiver's transport public key, which both sides know
before any key is derived.

*/

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::channel::mpsc;

use veil_binary_io::*;
use veil_crypto::*;
use veil_packet::fragment::{
    Fragment, FRAGMENT_PAYLOAD_SIZE, FRAGMENT_SIZE, MAX_LINK_MSG_SIZE,
};
use veil_packet::link::{LinkIntroMessage, LinkMessage};
use veil_packet::router_contact::RouterContact;

use crate::link::errors::*;
use crate::link::TransportCmd;
use crate::time::*;

/// Maximum number of fragments queued for sending before a session reports
/// backpressure.
pub const MAX_SEND_QUEUE: usize = 64;

/// A session with no activity for this long is closed.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A partially reassembled message with no new fragment for this long is
/// dropped.
pub const REASSEMBLY_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// State of the session handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    /// Initial state.
    Initial,
    /// The transport is connecting.
    Connecting,
    /// The transport connection is established.
    LinkEstablished,
    /// A link intro was exchanged and keys are being derived.
    CryptoHandshake,
    /// Both directions are keyed; application messages may flow.
    SessionReady,
    /// The transport connection is closed.
    Closed,
}

/// Pending inbound message being reassembled from fragments.
///
/// Fragments position themselves relative to the end of the message
/// (`remaining` names the bytes that follow), so arrival order does not
/// matter.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Time the last fragment was appended.
    last_active: Instant,
    /// Reassembly buffer, written back to front.
    buf: Vec<u8>,
    /// Message size so far: the largest `size + remaining` seen.
    total: usize,
    /// Payload bytes received so far.
    received: usize,
    /// Whether the fragment with `remaining == 0` was seen.
    got_final: bool,
}

impl InboundMessage {
    fn new() -> InboundMessage {
        InboundMessage {
            last_active: clock_now(),
            buf: vec![0; MAX_LINK_MSG_SIZE],
            total: 0,
            received: 0,
            got_final: false,
        }
    }

    /// Return true if this inbound message can be removed due to expiration.
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_active) > REASSEMBLY_IDLE_TIMEOUT
    }

    /// Append one fragment body. Returns the whole message once every byte
    /// of it arrived.
    fn append(
        &mut self,
        size: usize,
        remaining: usize,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, HandleRecvError> {
        if self.received + size > MAX_LINK_MSG_SIZE {
            return Err(HandleRecvError::Overflow);
        }
        let end = MAX_LINK_MSG_SIZE - remaining;
        let start = end - size;
        self.buf[start..end].copy_from_slice(&payload[..size]);
        self.received += size;
        self.total = self.total.max(size + remaining);
        self.got_final |= remaining == 0;
        self.last_active = clock_now();

        if self.got_final && self.received >= self.total {
            Ok(Some(self.buf[MAX_LINK_MSG_SIZE - self.total..].to_vec()))
        } else {
            Ok(None)
        }
    }
}

/// One peer to peer link session.
#[derive(Clone, Debug)]
pub struct Session {
    /// Our current router contact, sent in link intros.
    local_rc: RouterContact,
    /// Our transport secret key.
    transport_sk: SecretKey,
    /// Remote router contact once a link intro arrived (outbound sessions
    /// know it from the start).
    remote_rc: Option<RouterContact>,
    /// Transport address of the remote.
    remote_addr: SocketAddr,
    /// Whether we initiated the session.
    outbound: bool,
    /// Handshake state.
    status: SessionStatus,
    /// Whether a link intro from the remote was handled.
    got_lim: bool,
    /// Receive key. Starts as our transport public key so the remote's first
    /// intro can be decrypted.
    rx_key: SessionKey,
    /// Transmit key. Starts as the remote's transport public key.
    tx_key: SessionKey,
    /// Message id for the next outgoing message.
    next_tx_msg_id: u32,
    /// Highest message id seen from the remote.
    next_rx_msg_id: u32,
    /// Messages being reassembled, keyed by message id.
    recv_msgs: HashMap<u32, InboundMessage>,
    /// Encrypted fragments awaiting the transport.
    send_queue: std::collections::VecDeque<Fragment>,
    /// Buffer collecting stream bytes until a whole fragment is there.
    recv_buf: Vec<u8>,
    /// Timestamp of last activity.
    last_active: Instant,
    /// Whether the transport refused the last write.
    stalled: bool,
    /// Bytes received over the lifetime of the session.
    pub rx_bytes: u64,
    /// Bytes sent over the lifetime of the session.
    pub tx_bytes: u64,
}

impl Session {
    /// Create an outbound session. The caller is responsible for asking the
    /// transport to connect; [`Session::handle_connected`] continues the
    /// handshake.
    pub fn new_outbound(
        local_rc: RouterContact,
        transport_sk: SecretKey,
        remote_rc: RouterContact,
        remote_addr: SocketAddr,
    ) -> Session {
        let tx_key = *remote_rc.transport_pk.as_bytes();
        let rx_key = *transport_sk.public_key().as_bytes();
        Session {
            local_rc,
            transport_sk,
            remote_rc: Some(remote_rc),
            remote_addr,
            outbound: true,
            status: SessionStatus::Connecting,
            got_lim: false,
            rx_key,
            tx_key,
            next_tx_msg_id: 0,
            next_rx_msg_id: 0,
            recv_msgs: HashMap::new(),
            send_queue: std::collections::VecDeque::new(),
            recv_buf: Vec::with_capacity(FRAGMENT_SIZE),
            last_active: clock_now(),
            stalled: false,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    /// Create an inbound session for an accepted transport connection.
    pub fn new_inbound(
        local_rc: RouterContact,
        transport_sk: SecretKey,
        remote_addr: SocketAddr,
    ) -> Session {
        let rx_key = *transport_sk.public_key().as_bytes();
        Session {
            local_rc,
            transport_sk,
            remote_rc: None,
            remote_addr,
            outbound: false,
            status: SessionStatus::LinkEstablished,
            got_lim: false,
            rx_key,
            tx_key: [0; SESSION_KEY_SIZE],
            next_tx_msg_id: 0,
            next_rx_msg_id: 0,
            recv_msgs: HashMap::new(),
            send_queue: std::collections::VecDeque::new(),
            recv_buf: Vec::with_capacity(FRAGMENT_SIZE),
            last_active: clock_now(),
            stalled: false,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    /// Current handshake state.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Whether application messages may be queued.
    pub fn is_ready(&self) -> bool {
        self.status == SessionStatus::SessionReady
    }

    /// Transport address of the remote.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Contact of the remote router, if known yet.
    pub fn remote_rc(&self) -> Option<&RouterContact> {
        self.remote_rc.as_ref()
    }

    fn enter_state(&mut self, status: SessionStatus) {
        trace!("session {} -> {:?}", self.remote_addr, status);
        self.status = status;
    }

    /// Mark the session as alive.
    fn alive(&mut self) {
        self.last_active = clock_now();
    }

    /// Handle the transport reporting an established outbound connection.
    pub fn handle_connected(&mut self) -> Result<(), QueueMessageError> {
        if self.status != SessionStatus::Connecting {
            return Ok(());
        }
        self.enter_state(SessionStatus::LinkEstablished);
        self.send_link_intro()?;
        self.enter_state(SessionStatus::CryptoHandshake);
        Ok(())
    }

    /// Queue our link intro and derive the transmit key from its nonce.
    fn send_link_intro(&mut self) -> Result<(), QueueMessageError> {
        let nonce = gen_nonce();
        let intro = LinkMessage::Intro(LinkIntroMessage {
            rc: self.local_rc.clone(),
            nonce,
        });
        self.queue_message(&intro)?;
        // everything after the intro is keyed with the mutated key
        let remote_pk = match &self.remote_rc {
            Some(rc) => rc.transport_pk.clone(),
            None => return Err(QueueMessageError::Closed),
        };
        let k = shared_secret(&self.transport_sk, &remote_pk);
        self.tx_key = derive_session_key(&k, &nonce);
        Ok(())
    }

    /// Re-run the key exchange in place with a re-signed local contact, e.g.
    /// after the transport keypair was regenerated. Only the transmit key
    /// changes; the remote re-keys its own direction the same way. Message
    /// ids are preserved.
    pub fn rehandshake(
        &mut self,
        local_rc: RouterContact,
        transport_sk: SecretKey,
    ) -> Result<(), QueueMessageError> {
        self.local_rc = local_rc;
        self.transport_sk = transport_sk;
        self.send_link_intro()
    }

    /// Queue a whole link message for sending. Only the handshake itself may
    /// queue messages before the session is ready.
    pub fn queue_write_buffers(&mut self, msg: &LinkMessage) -> Result<(), QueueMessageError> {
        if !self.is_ready() {
            return Err(QueueMessageError::Closed);
        }
        self.queue_message(msg)
    }

    fn queue_message(&mut self, msg: &LinkMessage) -> Result<(), QueueMessageError> {
        if self.status == SessionStatus::Closed {
            return Err(QueueMessageError::Closed);
        }
        let mut buf = vec![0; MAX_LINK_MSG_SIZE];
        let (_, size) = msg
            .to_bytes((&mut buf, 0))
            .map_err(|_| QueueMessageError::Overflow)?;
        let data = &buf[..size];

        let fragments = size.div_ceil(FRAGMENT_PAYLOAD_SIZE);
        if self.send_queue.len() + fragments > MAX_SEND_QUEUE {
            return Err(QueueMessageError::Backpressure);
        }

        let msg_id = self.next_tx_msg_id;
        self.next_tx_msg_id = self.next_tx_msg_id.wrapping_add(1);

        let mut produced = 0;
        for chunk in data.chunks(FRAGMENT_PAYLOAD_SIZE) {
            produced += chunk.len();
            let remaining = (size - produced) as u16;
            self.send_queue
                .push_back(Fragment::encrypt(&self.tx_key, msg_id, chunk, remaining));
        }
        Ok(())
    }

    /// Drain the send queue into the transport as long as it accepts writes.
    pub fn pump_write(&mut self, transport_tx: &mpsc::Sender<TransportCmd>) {
        let mut tx = transport_tx.clone();
        while let Some(fragment) = self.send_queue.front() {
            let mut buf = [0; FRAGMENT_SIZE];
            let (_, size) = fragment.to_bytes((&mut buf, 0)).unwrap();
            match tx.try_send(TransportCmd::Send(self.remote_addr, buf[..size].to_vec())) {
                Ok(()) => {
                    self.send_queue.pop_front();
                    self.tx_bytes += FRAGMENT_SIZE as u64;
                    self.stalled = false;
                }
                Err(_) => {
                    self.stalled = true;
                    break;
                }
            }
        }
    }

    /// Feed raw stream bytes into the session. Completed application
    /// messages are returned in the order their final fragment arrived. Any
    /// error closes the session.
    pub fn handle_recv(&mut self, data: &[u8]) -> Result<Vec<LinkMessage>, HandleRecvError> {
        if self.status == SessionStatus::Closed {
            return Err(HandleRecvError::Closed);
        }
        let mut completed = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let missing = FRAGMENT_SIZE - self.recv_buf.len();
            let take = missing.min(rest.len());
            self.recv_buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.recv_buf.len() < FRAGMENT_SIZE {
                break;
            }
            let buf = std::mem::replace(&mut self.recv_buf, Vec::with_capacity(FRAGMENT_SIZE));
            if let Err(e) = self.process_fragment(&buf, &mut completed) {
                self.close();
                return Err(e);
            }
        }
        Ok(completed)
    }

    fn process_fragment(
        &mut self,
        buf: &[u8],
        completed: &mut Vec<LinkMessage>,
    ) -> Result<(), HandleRecvError> {
        let (_, fragment) =
            Fragment::from_bytes(buf).map_err(|_| HandleRecvError::InvalidMessage)?;
        let body = fragment.verify_then_decrypt(&self.rx_key)?;
        self.rx_bytes += FRAGMENT_SIZE as u64;
        self.alive();

        let entry = self
            .recv_msgs
            .entry(body.msg_id)
            .or_insert_with(InboundMessage::new);
        let complete = entry.append(
            body.size as usize,
            body.remaining as usize,
            &body.payload,
        )?;

        if let Some(message) = complete {
            self.recv_msgs.remove(&body.msg_id);
            if body.msg_id >= self.next_rx_msg_id {
                self.next_rx_msg_id = body.msg_id.wrapping_add(1);
            }
            let (_, msg) = LinkMessage::from_bytes(&message)
                .map_err(|_| HandleRecvError::InvalidMessage)?;
            match msg {
                LinkMessage::Intro(intro) => self.handle_link_intro(intro)?,
                msg => {
                    if !self.is_ready() {
                        return Err(HandleRecvError::InvalidMessage);
                    }
                    completed.push(msg);
                }
            }
        }
        Ok(())
    }

    /// Handle a link intro from the remote: the handshake reply, the
    /// initiator's first message, or a renegotiation.
    fn handle_link_intro(&mut self, intro: LinkIntroMessage) -> Result<(), HandleRecvError> {
        if !intro.rc.verify_signature() {
            return Err(HandleRecvError::InvalidLinkIntro);
        }
        if let Some(rc) = &self.remote_rc {
            // renegotiation and the handshake reply must come from the same router
            if rc.id != intro.rc.id {
                return Err(HandleRecvError::InvalidLinkIntro);
            }
        }

        let k = shared_secret(&self.transport_sk, &intro.rc.transport_pk);
        let reply_needed = !self.got_lim && !self.outbound;
        if reply_needed {
            // remote initiated: its transport key is also our initial reply key
            self.tx_key = *intro.rc.transport_pk.as_bytes();
            self.enter_state(SessionStatus::CryptoHandshake);
        }
        self.rx_key = derive_session_key(&k, &intro.nonce);
        self.remote_rc = Some(intro.rc);
        let first = !self.got_lim;
        self.got_lim = true;

        if reply_needed {
            self.send_link_intro()
                .map_err(|_| HandleRecvError::InvalidLinkIntro)?;
        }
        if first {
            self.enter_state(SessionStatus::SessionReady);
            debug!("link session with {} established", self.remote_addr);
        }
        Ok(())
    }

    /// Prune expired reassembly entries and time the session out when idle.
    pub fn tick_impl(&mut self, now: Instant) {
        self.recv_msgs.retain(|_, msg| !msg.is_expired(now));
        if self.is_timed_out(now) {
            debug!("session with {} timed out", self.remote_addr);
            self.close();
        }
    }

    /// Return true if the session has been idle for too long.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_active) > SESSION_IDLE_TIMEOUT
    }

    /// Close the session.
    pub fn close(&mut self) {
        self.enter_state(SessionStatus::Closed);
        self.send_queue.clear();
        self.recv_msgs.clear();
    }

    #[cfg(test)]
    pub(crate) fn test_ready(mut self, rx_key: SessionKey, tx_key: SessionKey) -> Session {
        self.rx_key = rx_key;
        self.tx_key = tx_key;
        self.status = SessionStatus::SessionReady;
        self.got_lim = true;
        self
    }

    #[cfg(test)]
    pub(crate) fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    #[cfg(test)]
    pub(crate) fn queued_fragments(&self) -> Vec<Fragment> {
        self.send_queue.iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn keys(&self) -> (SessionKey, SessionKey) {
        (self.rx_key, self.tx_key)
    }
}

/*! Hidden-service endpoint.

The endpoint owns the identity, the path set, the pending lookup tables, the
conversation table and one outbound context per remote address. Everything is
driven by a periodic [`Endpoint::tick`]: it publishes our introset, expires
pending lookups, prefetches configured addresses and tags, maintains outbound
contexts and rebuilds paths.

*/

pub mod config;
pub mod errors;
mod identity;
mod lookup;
mod outbound;
mod tag_cache;

pub use self::identity::*;
pub use self::lookup::*;
pub use self::outbound::*;
pub use self::tag_cache::*;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::{mpsc, oneshot};
use futures::SinkExt;
use tokio::sync::RwLock;

use veil_crypto::*;
use veil_packet::dht::{
    DhtMessage, FindIntroMessage, FindRouterMessage, GotIntroMessage, GotRouterMessage,
    LookupTarget, PublishIntroMessage,
};
use veil_packet::introset::{IntroSet, Introduction};
use veil_packet::link::LinkMessage;
use veil_packet::path_id::PathId;
use veil_packet::protocol::{ProtocolFrame, ProtocolMessage, ProtocolType};
use veil_packet::router_contact::RouterId;
use veil_packet::routing::{DhtRoutingMessage, PathTransferMessage, RoutingMessage};
use veil_packet::service_info::{Address, ConvoTag, ServiceInfo, Tag};

use crate::nodedb::NodeDb;
use crate::path::{AlignedHopSelector, PathSet, RandomHopSelector, DEFAULT_NUM_HOPS, DEFAULT_NUM_PATHS};
use crate::service::config::EndpointConfig;
use crate::service::errors::*;
use crate::time::*;
use crate::utils::gen_tx_id;

/// How often a fresh introset is published when the current one is healthy.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

/// How soon a failed or stale publish is retried.
pub const PUBLISH_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How long a pending router lookup may stay unanswered.
pub const ROUTER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// An idle conversation older than this is dropped.
pub const CONVO_TTL: Duration = Duration::from_secs(600);

/// Replication count for introset lookups.
const FIND_INTRO_REPLICATION: u8 = 5;

/// Replication count for introset publishes.
const PUBLISH_REPLICATION: u8 = 4;

/// Shorthand for the transmit half of the channel carrying link messages to
/// the router loop, addressed by first hop.
type LinkTx = mpsc::Sender<(RouterId, LinkMessage)>;

/// Shorthand for the transmit half of the channel delivering decrypted
/// conversation payloads upward.
type DataTx = mpsc::UnboundedSender<(ConvoTag, ProtocolType, Vec<u8>)>;

/// Completion hook of `ensure_path_to_service`: resolves with the address
/// once the outbound context exists, or is dropped on lookup timeout.
pub type PathEnsureTx = oneshot::Sender<Address>;

/// End to end conversation state for one tag.
#[derive(Clone, Debug)]
pub struct ConvoSession {
    /// Identity of the remote service.
    pub remote: ServiceInfo,
    /// Introduction currently associated with the conversation.
    pub intro: Introduction,
    /// Cached conversation key.
    pub shared_key: Option<SessionKey>,
    /// Last sequence number assigned or seen.
    pub seq_no: u64,
    /// Time the conversation was last used.
    pub last_used: Instant,
}

impl ConvoSession {
    fn new(remote: ServiceInfo) -> ConvoSession {
        ConvoSession {
            remote,
            intro: Introduction::default(),
            shared_key: None,
            seq_no: 0,
            last_used: clock_now(),
        }
    }
}

/// A router lookup in flight.
#[derive(Clone, Debug)]
struct RouterLookupJob {
    started_at: Instant,
}

struct EndpointState {
    config: EndpointConfig,
    identity: Identity,
    introset: IntroSet,
    paths: PathSet,
    pending_lookups: LookupQueue<PendingLookup>,
    pending_service_hooks: HashMap<Address, Vec<PathEnsureTx>>,
    pending_routers: HashMap<RouterId, RouterLookupJob>,
    tag_cache: HashMap<Tag, CachedTagResult>,
    remote_sessions: HashMap<Address, OutboundContext>,
    convos: HashMap<ConvoTag, ConvoSession>,
    current_publish_tx: u64,
    last_publish: Option<Instant>,
    last_publish_attempt: Option<Instant>,
}

/// Arguments for creating a new `Endpoint`.
pub struct EndpointNewArgs {
    /// Endpoint options.
    pub config: EndpointConfig,
    /// Store of verified router contacts.
    pub nodedb: NodeDb,
    /// Sink for link messages to the router loop.
    pub link_tx: LinkTx,
    /// Sink for decrypted conversation payloads.
    pub data_tx: DataTx,
}

/// A hidden-service endpoint.
#[derive(Clone)]
pub struct Endpoint {
    nodedb: NodeDb,
    link_tx: LinkTx,
    data_tx: DataTx,
    num_paths: usize,
    num_hops: usize,
    state: Arc<RwLock<EndpointState>>,
}

fn conversation_key(pq_secret: &SessionKey, dh: &SessionKey) -> SessionKey {
    let mut tmp = [0; 64];
    tmp[..32].copy_from_slice(pq_secret);
    tmp[32..].copy_from_slice(dh);
    shorthash(&tmp)
}

impl Endpoint {
    /// Create a new `Endpoint` with a fresh in-memory identity. Call
    /// [`Endpoint::start`] to load the configured keyfile.
    pub fn new(args: EndpointNewArgs) -> Endpoint {
        let identity = Identity::regenerate();
        let introset = IntroSet::new(
            identity.info(),
            identity.pq_public_key(),
            args.config.tag,
        );
        Endpoint {
            nodedb: args.nodedb,
            link_tx: args.link_tx,
            data_tx: args.data_tx,
            num_paths: DEFAULT_NUM_PATHS,
            num_hops: DEFAULT_NUM_HOPS,
            state: Arc::new(RwLock::new(EndpointState {
                config: args.config,
                identity,
                introset,
                paths: PathSet::new(DEFAULT_NUM_PATHS, DEFAULT_NUM_HOPS),
                pending_lookups: LookupQueue::new(LOOKUP_TIMEOUT),
                pending_service_hooks: HashMap::new(),
                pending_routers: HashMap::new(),
                tag_cache: HashMap::new(),
                remote_sessions: HashMap::new(),
                convos: HashMap::new(),
                current_publish_tx: 0,
                last_publish: None,
                last_publish_attempt: None,
            })),
        }
    }

    /// Load or create the identity per configuration and finish
    /// initialization.
    pub async fn start(&self) -> Result<(), IdentityError> {
        let mut state = self.state.write().await;
        if let Some(keyfile) = state.config.keyfile.clone() {
            state.identity = Identity::ensure_keys(&keyfile)?;
        }
        state.introset = IntroSet::new(
            state.identity.info(),
            state.identity.pq_public_key(),
            state.config.tag,
        );
        if let Some(netns) = &state.config.netns {
            // the isolated loop itself is provided by the host process
            info!("endpoint {} runs isolated in netns {}", state.identity.address(), netns);
        }
        info!("endpoint {} started", state.identity.address());
        Ok(())
    }

    /// Apply one configuration option.
    pub async fn set_option(&self, key: &str, value: &str) -> bool {
        self.state.write().await.config.set_option(key, value)
    }

    /// Our service address.
    pub async fn address(&self) -> Address {
        self.state.read().await.identity.address()
    }

    /// Drive every periodic duty of the endpoint. `now_ms` is wall clock
    /// milliseconds used for wire-visible expirations.
    pub async fn tick(&self, now_ms: u64) {
        let now = clock_now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        // a stale publish attempt frees the tx id for a retry
        if state.current_publish_tx != 0 {
            let stale = state
                .last_publish_attempt
                .map(|at| now.saturating_duration_since(at) >= PUBLISH_RETRY_INTERVAL)
                .unwrap_or(true);
            if stale {
                state.current_publish_tx = 0;
            }
        }

        if should_publish_descriptors(state, now, now_ms) {
            let intros = state.paths.get_current_introductions();
            if intros.is_empty() {
                warn!("cannot publish descriptors, no introductions yet");
            } else {
                state.introset.intros = intros;
                state.introset.topic = state.config.tag;
                state.identity.sign_introset(&mut state.introset);
                if let Err(e) = self.publish_introset(state, now).await {
                    warn!("introset publish failed: {}", e);
                }
            }
        }

        // expire pending lookups; dropping the hooks reports the empty result
        for (tx_id, lookup) in state.pending_lookups.drain_timed_out() {
            info!("lookup txid={} timed out", tx_id);
            match lookup {
                PendingLookup::HiddenService { addr } => {
                    state.pending_service_hooks.remove(&addr);
                }
                PendingLookup::IntroSetUpdate { addr } => {
                    if let Some(context) = state.remote_sessions.get_mut(&addr) {
                        context.update_in_flight = false;
                    }
                }
                PendingLookup::Tag { .. } => {}
            }
        }

        // expire pending router lookups
        state.pending_routers.retain(|router, job| {
            if now.saturating_duration_since(job.started_at) > ROUTER_LOOKUP_TIMEOUT {
                info!("lookup for {} timed out", router);
                false
            } else {
                true
            }
        });

        let candidates = self.nodedb.snapshot().await;

        // prefetch configured addresses
        let prefetch_addrs = state.config.prefetch_addrs.iter().copied().collect::<Vec<_>>();
        for addr in prefetch_addrs {
            if state.remote_sessions.contains_key(&addr)
                || state.pending_service_hooks.contains_key(&addr)
            {
                continue;
            }
            if let Err(e) = self.start_service_lookup(state, addr, Vec::new()).await {
                warn!("failed to ensure path to {}: {}", addr, e);
            }
        }

        // prefetch configured tags
        let prefetch_tags = state.config.prefetch_tags.iter().copied().collect::<Vec<_>>();
        let mut tag_aligns = Vec::new();
        let mut tag_refreshes = Vec::new();
        for tag in prefetch_tags {
            let cache = state
                .tag_cache
                .entry(tag)
                .or_insert_with(|| CachedTagResult::new(tag));
            cache.expire(now_ms);
            tag_aligns.extend(cache.result.iter().map(|introset| introset.info.address()));
            if cache.should_refresh() {
                tag_refreshes.push(tag);
            }
        }
        for addr in tag_aligns {
            if state.remote_sessions.contains_key(&addr)
                || state.pending_service_hooks.contains_key(&addr)
            {
                continue;
            }
            if let Err(e) = self.start_service_lookup(state, addr, Vec::new()).await {
                warn!("failed to ensure path to {} for tag prefetch: {}", addr, e);
            }
        }
        for tag in tag_refreshes {
            self.start_tag_lookup(state, tag).await;
        }

        // maintain outbound contexts
        let addrs = state.remote_sessions.keys().copied().collect::<Vec<_>>();
        for addr in addrs {
            let (wants_refresh, selected_router) = {
                let context = match state.remote_sessions.get_mut(&addr) {
                    Some(context) => context,
                    None => continue,
                };
                let needs = context.needs_intro_update(now_ms);
                if needs {
                    context.shift_introduction();
                }
                (
                    needs && !context.update_in_flight,
                    context.selected_intro.router,
                )
            };
            self.ensure_router_is_known_inner(state, selected_router, now).await;
            if wants_refresh {
                self.start_introset_update(state, addr).await;
            }

            let terminal = self.nodedb.get(&selected_router).await;
            if let Some(context) = state.remote_sessions.get_mut(&addr) {
                if let Some(terminal) = terminal {
                    context.paths.tick(now, &candidates, &AlignedHopSelector { terminal });
                }
            }

            // flush payloads that waited for an aligned path
            let pending = match state.remote_sessions.get_mut(&addr) {
                Some(context) if context.aligned_path().is_some() => {
                    std::mem::take(&mut context.pending_payloads)
                }
                _ => Vec::new(),
            };
            for (proto, payload) in pending {
                if let Err(e) = self.send_to_context(state, addr, proto, payload).await {
                    debug!("deferred send to {} failed: {}", addr, e);
                }
            }
        }

        // drop idle conversations
        state
            .convos
            .retain(|_, convo| now.saturating_duration_since(convo.last_used) <= CONVO_TTL);

        state.paths.tick(now, &candidates, &RandomHopSelector);
    }

    async fn publish_introset(
        &self,
        state: &mut EndpointState,
        now: Instant,
    ) -> Result<(), PublishIntroSetError> {
        let addr = state.identity.address();
        let (upstream, link) = {
            let path = state
                .paths
                .get_established_path_closest_to(&addr.routing_key())
                .ok_or(PublishIntroSetError::NoPath)?;
            let tx_id = gen_tx_id();
            state.current_publish_tx = tx_id;
            let msg = RoutingMessage::Dht(DhtRoutingMessage::new(DhtMessage::PublishIntro(
                PublishIntroMessage {
                    tx_id,
                    replication: PUBLISH_REPLICATION,
                    introset: state.introset.clone(),
                },
            )));
            (path.upstream(), path.wrap_upstream(&msg))
        };
        self.link_tx
            .clone()
            .send((upstream, link))
            .await
            .map_err(PublishIntroSetError::SendTo)?;
        state.last_publish_attempt = Some(now);
        info!("publishing introset for {}", addr);
        Ok(())
    }

    /// Open a conversation with a remote address, looking its introset up
    /// when necessary. The hook resolves once the outbound context exists;
    /// on lookup timeout it is dropped. A second call while a lookup is
    /// pending attaches its hook to the pending lookup.
    pub async fn ensure_path_to_service(
        &self,
        addr: Address,
        hook: PathEnsureTx,
    ) -> Result<(), EnsurePathError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.remote_sessions.contains_key(&addr) {
            let _ = hook.send(addr);
            return Ok(());
        }
        if let Some(hooks) = state.pending_service_hooks.get_mut(&addr) {
            warn!("duplicate pending service lookup to {}", addr);
            hooks.push(hook);
            return Ok(());
        }
        self.start_service_lookup(state, addr, vec![hook]).await
    }

    async fn start_service_lookup(
        &self,
        state: &mut EndpointState,
        addr: Address,
        hooks: Vec<PathEnsureTx>,
    ) -> Result<(), EnsurePathError> {
        let tx_id = state
            .pending_lookups
            .new_tx_id(PendingLookup::HiddenService { addr });
        let (upstream, link) = {
            let path = state
                .paths
                .get_established_path_closest_to(&addr.routing_key())
                .ok_or(EnsurePathError::NoPath)?;
            let msg = RoutingMessage::Dht(DhtRoutingMessage::new(DhtMessage::FindIntro(
                FindIntroMessage {
                    tx_id,
                    target: LookupTarget::Address(addr),
                    replication: FIND_INTRO_REPLICATION,
                },
            )));
            (path.upstream(), path.wrap_upstream(&msg))
        };
        self.link_tx
            .clone()
            .send((upstream, link))
            .await
            .map_err(EnsurePathError::SendTo)?;
        state.pending_service_hooks.insert(addr, hooks);
        info!("looking up hidden service {}", addr);
        Ok(())
    }

    async fn start_introset_update(&self, state: &mut EndpointState, addr: Address) {
        let tx_id = state
            .pending_lookups
            .new_tx_id(PendingLookup::IntroSetUpdate { addr });
        let (upstream, link) = {
            let path = match state
                .paths
                .get_established_path_closest_to(&addr.routing_key())
            {
                Some(path) => path,
                None => {
                    warn!("cannot update introset, no path for {}", addr);
                    return;
                }
            };
            let msg = RoutingMessage::Dht(DhtRoutingMessage::new(DhtMessage::FindIntro(
                FindIntroMessage {
                    tx_id,
                    target: LookupTarget::Address(addr),
                    replication: FIND_INTRO_REPLICATION,
                },
            )));
            (path.upstream(), path.wrap_upstream(&msg))
        };
        if self.link_tx.clone().send((upstream, link)).await.is_ok() {
            if let Some(context) = state.remote_sessions.get_mut(&addr) {
                context.update_in_flight = true;
            }
        }
    }

    async fn start_tag_lookup(&self, state: &mut EndpointState, tag: Tag) {
        let tx_id = state.pending_lookups.new_tx_id(PendingLookup::Tag { tag });
        let (upstream, link) = {
            let path = match state.paths.pick_random_established_path() {
                Some(path) => path,
                None => return,
            };
            let msg = RoutingMessage::Dht(DhtRoutingMessage::new(DhtMessage::FindIntro(
                FindIntroMessage {
                    tx_id,
                    target: LookupTarget::Tag(tag),
                    replication: FIND_INTRO_REPLICATION,
                },
            )));
            (path.upstream(), path.wrap_upstream(&msg))
        };
        if self.link_tx.clone().send((upstream, link)).await.is_ok() {
            if let Some(cache) = state.tag_cache.get_mut(&tag) {
                cache.mark_requested();
            }
        }
    }

    /// Make sure a router's contact is known, looking it up over the
    /// closest established path when it is not.
    pub async fn ensure_router_is_known(&self, router: RouterId) {
        let now = clock_now();
        let mut guard = self.state.write().await;
        self.ensure_router_is_known_inner(&mut guard, router, now).await;
    }

    async fn ensure_router_is_known_inner(
        &self,
        state: &mut EndpointState,
        router: RouterId,
        now: Instant,
    ) {
        if router.is_zero() {
            return;
        }
        if self.nodedb.has(&router).await {
            return;
        }
        if state.pending_routers.contains_key(&router) {
            return;
        }
        let (upstream, link) = {
            let path = match state.paths.get_established_path_closest_to(&router.0) {
                Some(path) => path,
                None => {
                    error!("failed to send request for router lookup, no path");
                    return;
                }
            };
            let msg = RoutingMessage::Dht(DhtRoutingMessage::new(DhtMessage::FindRouter(
                FindRouterMessage {
                    tx_id: gen_tx_id(),
                    target: router,
                },
            )));
            (path.upstream(), path.wrap_upstream(&msg))
        };
        if self.link_tx.clone().send((upstream, link)).await.is_ok() {
            info!("looking up router {}", router);
            state
                .pending_routers
                .insert(router, RouterLookupJob { started_at: now });
        } else {
            error!("failed to send request for router lookup");
        }
    }

    /// Handle a `GotIntroMessage` routed back over one of our paths.
    pub async fn handle_got_intro(&self, msg: GotIntroMessage) {
        let mut guard = self.state.write().await;
        self.handle_got_intro_inner(&mut guard, msg);
    }

    fn handle_got_intro_inner(&self, state: &mut EndpointState, msg: GotIntroMessage) {
        let our_address = state.identity.address();
        let mut remote = Vec::new();
        for introset in msg.introsets {
            if !introset.verify_signature() {
                info!(
                    "invalid introset signature for {} txid={}",
                    introset.info.address(),
                    msg.tx_id
                );
                if introset.info.address() == our_address
                    && state.current_publish_tx == msg.tx_id
                {
                    warn!("failed to publish introset for {}", our_address);
                    state.current_publish_tx = 0;
                }
                return;
            }
            if introset.info.address() == our_address && state.current_publish_tx == msg.tx_id {
                state.current_publish_tx = 0;
                state.last_publish = Some(clock_now());
                info!("introset publish confirmed for {}", our_address);
                return;
            }
            remote.push(introset);
        }

        let lookup = match state.pending_lookups.check_tx_id(msg.tx_id, |_| true) {
            Some(lookup) => lookup,
            None => {
                warn!("invalid lookup response txid={}", msg.tx_id);
                return;
            }
        };
        match lookup {
            PendingLookup::HiddenService { addr } => {
                let found = remote
                    .into_iter()
                    .find(|introset| introset.info.address() == addr);
                match found {
                    Some(introset) => self.put_new_outbound_context(state, introset),
                    None => {
                        info!("no response in hidden service lookup for {}", addr);
                        state.pending_service_hooks.remove(&addr);
                    }
                }
            }
            PendingLookup::IntroSetUpdate { addr } => {
                let found = remote
                    .into_iter()
                    .find(|introset| introset.info.address() == addr);
                if let Some(context) = state.remote_sessions.get_mut(&addr) {
                    context.on_intro_set_update(found);
                }
            }
            PendingLookup::Tag { tag } => {
                if let Some(cache) = state.tag_cache.get_mut(&tag) {
                    cache.handle_response(remote);
                }
            }
        }
    }

    fn put_new_outbound_context(&self, state: &mut EndpointState, introset: IntroSet) {
        let addr = introset.info.address();
        if !state.remote_sessions.contains_key(&addr) {
            let mut context = OutboundContext::new(introset, self.num_paths, self.num_hops);
            // prefetched conversations open with a small keepalive
            let prefetched = state.config.prefetch_addrs.contains(&addr)
                || state
                    .tag_cache
                    .values()
                    .any(|cache| cache.result.iter().any(|s| s.info.address() == addr));
            if prefetched {
                context
                    .pending_payloads
                    .push((ProtocolType::Control, Vec::new()));
            }
            info!("created new outbound context for {}", addr);
            state.remote_sessions.insert(addr, context);
        }
        if let Some(hooks) = state.pending_service_hooks.remove(&addr) {
            for hook in hooks {
                let _ = hook.send(addr);
            }
        }
    }

    /// Handle a `GotRouterMessage`. Only responses carrying exactly one
    /// contact are considered; the contact is verified before it enters the
    /// node db.
    pub async fn handle_got_router(&self, msg: GotRouterMessage) {
        if msg.contacts.len() != 1 {
            return;
        }
        let rc = msg.contacts[0].clone();
        {
            let mut state = self.state.write().await;
            if state.pending_routers.remove(&rc.id).is_none() {
                return;
            }
        }
        if let Err(e) = self.nodedb.put_if_valid(rc).await {
            info!("router verify failed: {}", e);
        }
    }

    /// Handle a link message delivered by the router loop. Only downstream
    /// relay frames for one of our paths are meaningful here.
    pub async fn handle_link_message(&self, router: RouterId, msg: LinkMessage) {
        let frame = match msg {
            LinkMessage::RelayDownstream(frame) => frame,
            _ => return,
        };
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let unwrapped = state
            .paths
            .get_by_upstream(router, frame.path_id)
            .or_else(|| {
                state
                    .remote_sessions
                    .values()
                    .find_map(|context| context.paths.get_by_upstream(router, frame.path_id))
            })
            .map(|path| path.unwrap_downstream(&frame));
        let routing = match unwrapped {
            Some(Ok(routing)) => routing,
            Some(Err(e)) => {
                warn!("dropping malformed downstream frame: {}", e);
                return;
            }
            None => {
                warn!("downstream frame for unknown path {}", frame.path_id);
                return;
            }
        };

        let mut router_msgs = Vec::new();
        match routing {
            RoutingMessage::Dht(dht) => {
                for msg in dht.msgs {
                    match msg {
                        DhtMessage::GotIntro(msg) => self.handle_got_intro_inner(state, msg),
                        DhtMessage::GotRouter(msg) => router_msgs.push(msg),
                        msg => trace!("ignoring routed dht message {:?}", msg),
                    }
                }
            }
            RoutingMessage::PathTransfer(msg) => {
                if let Err(e) = self.handle_protocol_frame_inner(state, msg.frame) {
                    warn!("dropping protocol frame: {}", e);
                }
            }
        }
        // contact verification relocks the state
        drop(guard);
        for msg in router_msgs {
            self.handle_got_router(msg).await;
        }
    }

    fn handle_protocol_frame_inner(
        &self,
        state: &mut EndpointState,
        frame: ProtocolFrame,
    ) -> Result<(), HandleFrameError> {
        let (tag, proto, body) = if let Some(ct) = &frame.pq_ciphertext {
            // first frame of a conversation
            let pq_secret = pq_decapsulate(ct, state.identity.pq_secret())
                .ok_or(HandleFrameError::Decapsulation)?;
            let msg = frame
                .get_payload(&pq_secret)
                .map_err(HandleFrameError::InvalidPayload)?;
            if !frame.verify(&msg.sender.sign_pk) {
                return Err(HandleFrameError::SignatureInvalid);
            }
            let dh = keyed_shared_secret(
                state.identity.enc_secret(),
                &msg.sender.enc_pk,
                &frame.nonce,
            );
            let shared = conversation_key(&pq_secret, &dh);
            let convo = state
                .convos
                .entry(frame.tag)
                .or_insert_with(|| ConvoSession::new(msg.sender.clone()));
            convo.remote = msg.sender.clone();
            convo.intro = msg.intro_reply;
            convo.shared_key = Some(shared);
            convo.seq_no = convo.seq_no.max(frame.seq_no);
            convo.last_used = clock_now();
            debug!("new conversation {} with {}", frame.tag, msg.sender.address());
            (frame.tag, msg.proto, msg.body)
        } else {
            let convo = state
                .convos
                .get_mut(&frame.tag)
                .ok_or(HandleFrameError::UnknownTag)?;
            let key = convo.shared_key.ok_or(HandleFrameError::NoKey)?;
            let msg = frame
                .get_payload(&key)
                .map_err(HandleFrameError::InvalidPayload)?;
            if !frame.verify(&convo.remote.sign_pk) {
                return Err(HandleFrameError::SignatureInvalid);
            }
            // senders assign strictly monotonic numbers; gaps are fine
            convo.seq_no = convo.seq_no.max(frame.seq_no);
            convo.intro = msg.intro_reply;
            convo.last_used = clock_now();
            (frame.tag, msg.proto, msg.body)
        };
        if self.data_tx.unbounded_send((tag, proto, body)).is_err() {
            warn!("conversation data sink is gone");
        }
        Ok(())
    }

    /// Send application data to a remote service. The first message of a
    /// conversation runs the post-quantum handshake; later ones reuse the
    /// cached key. Without an aligned path yet the payload is queued and
    /// flushed by the tick.
    pub async fn send_to_service(
        &self,
        addr: Address,
        proto: ProtocolType,
        payload: Vec<u8>,
    ) -> Result<(), SendToServiceError> {
        let mut guard = self.state.write().await;
        self.send_to_context(&mut guard, addr, proto, payload).await
    }

    async fn send_to_context(
        &self,
        state: &mut EndpointState,
        addr: Address,
        proto: ProtocolType,
        payload: Vec<u8>,
    ) -> Result<(), SendToServiceError> {
        let (path, selected, convo_tag) = {
            let context = state
                .remote_sessions
                .get_mut(&addr)
                .ok_or(SendToServiceError::NoContext)?;
            match context.aligned_path() {
                Some(path) => (path.clone(), context.selected_intro, context.tag),
                None => {
                    context.pending_payloads.push((proto, payload));
                    return Err(SendToServiceError::NoPath);
                }
            }
        };

        let frame = match convo_tag {
            Some(tag) => {
                // established conversation, reuse the cached key
                let key = state
                    .convos
                    .get(&tag)
                    .and_then(|convo| convo.shared_key)
                    .ok_or(SendToServiceError::NoKey)?;
                let seq_no = get_seq_no_for_convo(&mut state.convos, tag);
                let msg = ProtocolMessage {
                    proto,
                    sender: state.identity.info(),
                    intro_reply: *path.intro(),
                    body: payload,
                };
                ProtocolFrame::encrypt_and_sign(
                    &msg,
                    &key,
                    None,
                    gen_nonce(),
                    tag,
                    seq_no,
                    state.identity.signing_key(),
                )
            }
            None => {
                // first message: encapsulate, derive and cache the key
                let (remote_info, pq_key) = {
                    let context = state
                        .remote_sessions
                        .get(&addr)
                        .ok_or(SendToServiceError::NoContext)?;
                    (
                        context.current_introset.info.clone(),
                        context.current_introset.pq_key.clone(),
                    )
                };
                let (ct, pq_secret) =
                    pq_encapsulate(&pq_key).ok_or(SendToServiceError::NoKey)?;
                let nonce = gen_nonce();
                let dh = keyed_shared_secret(
                    state.identity.enc_secret(),
                    &remote_info.enc_pk,
                    &nonce,
                );
                let tag = ConvoTag::random();
                let mut convo = ConvoSession::new(remote_info);
                convo.intro = *path.intro();
                convo.shared_key = Some(conversation_key(&pq_secret, &dh));
                state.convos.insert(tag, convo);
                let seq_no = get_seq_no_for_convo(&mut state.convos, tag);
                if let Some(context) = state.remote_sessions.get_mut(&addr) {
                    context.tag = Some(tag);
                }
                let msg = ProtocolMessage {
                    proto,
                    sender: state.identity.info(),
                    intro_reply: *path.intro(),
                    body: payload,
                };
                // the first frame travels under the encapsulated secret alone
                ProtocolFrame::encrypt_and_sign(
                    &msg,
                    &pq_secret,
                    Some(ct),
                    nonce,
                    tag,
                    seq_no,
                    state.identity.signing_key(),
                )
            }
        };

        let transfer = PathTransferMessage::new(selected.path_id, frame);
        let link = path.wrap_upstream(&RoutingMessage::PathTransfer(transfer));
        self.link_tx
            .clone()
            .send((path.upstream(), link))
            .await
            .map_err(SendToServiceError::SendTo)
    }

    /// Confirm a path build, ours or an outbound context's. Returns false
    /// when no such path is known.
    pub async fn handle_path_built(&self, router: RouterId, rx_id: PathId, now_ms: u64) -> bool {
        let now = clock_now();
        let mut state = self.state.write().await;
        if state.paths.handle_path_built(router, rx_id, now, now_ms) {
            return true;
        }
        state
            .remote_sessions
            .values_mut()
            .any(|context| context.paths.handle_path_built(router, rx_id, now, now_ms))
    }

    /// Report a failed path build.
    pub async fn handle_path_build_failed(&self, router: RouterId, rx_id: PathId) {
        let mut state = self.state.write().await;
        state.paths.handle_path_build_failed(router, rx_id);
        for context in state.remote_sessions.values_mut() {
            context.paths.handle_path_build_failed(router, rx_id);
        }
    }

    /// All conversation tags whose remote is the given service.
    pub async fn get_convo_tags_for_service(&self, info: &ServiceInfo) -> Vec<ConvoTag> {
        self.state
            .read()
            .await
            .convos
            .iter()
            .filter(|(_, convo)| &convo.remote == info)
            .map(|(tag, _)| *tag)
            .collect()
    }

    /// Record the remote identity of a conversation.
    pub async fn put_sender_for(&self, tag: ConvoTag, info: ServiceInfo) {
        let mut state = self.state.write().await;
        let convo = state
            .convos
            .entry(tag)
            .or_insert_with(|| ConvoSession::new(info.clone()));
        convo.remote = info;
        convo.last_used = clock_now();
    }

    /// Remote identity of a conversation.
    pub async fn get_sender_for(&self, tag: ConvoTag) -> Option<ServiceInfo> {
        self.state
            .read()
            .await
            .convos
            .get(&tag)
            .map(|convo| convo.remote.clone())
    }

    /// Record the introduction associated with a conversation.
    pub async fn put_intro_for(&self, tag: ConvoTag, intro: Introduction) {
        let mut state = self.state.write().await;
        if let Some(convo) = state.convos.get_mut(&tag) {
            convo.intro = intro;
            convo.last_used = clock_now();
        }
    }

    /// Introduction associated with a conversation.
    pub async fn get_intro_for(&self, tag: ConvoTag) -> Option<Introduction> {
        self.state
            .read()
            .await
            .convos
            .get(&tag)
            .map(|convo| convo.intro)
    }

    /// Cache the key of a conversation.
    pub async fn put_cached_session_key_for(&self, tag: ConvoTag, key: SessionKey) {
        let mut state = self.state.write().await;
        if let Some(convo) = state.convos.get_mut(&tag) {
            convo.shared_key = Some(key);
            convo.last_used = clock_now();
        }
    }

    /// Cached key of a conversation.
    pub async fn get_cached_session_key_for(&self, tag: ConvoTag) -> Option<SessionKey> {
        self.state
            .read()
            .await
            .convos
            .get(&tag)
            .and_then(|convo| convo.shared_key)
    }
}

fn should_publish_descriptors(state: &EndpointState, now: Instant, now_ms: u64) -> bool {
    if state.current_publish_tx != 0 {
        return false;
    }
    if state.introset.has_expired_intros(now_ms) {
        state
            .last_publish_attempt
            .map(|at| now.saturating_duration_since(at) >= PUBLISH_RETRY_INTERVAL)
            .unwrap_or(true)
    } else {
        state
            .last_publish
            .map(|at| now.saturating_duration_since(at) >= PUBLISH_INTERVAL)
            .unwrap_or(true)
    }
}

fn get_seq_no_for_convo(convos: &mut HashMap<ConvoTag, ConvoSession>, tag: ConvoTag) -> u64 {
    match convos.get_mut(&tag) {
        Some(convo) => {
            convo.seq_no += 1;
            convo.last_used = clock_now();
            convo.seq_no
        }
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    use veil_binary_io::FromBytes;
    use veil_packet::ip_port::IpPort;
    use veil_packet::router_contact::RouterContact;

    use crate::path::{Path, PathHop};

    struct TestEndpoint {
        endpoint: Endpoint,
        link_rx: mpsc::Receiver<(RouterId, LinkMessage)>,
        data_rx: mpsc::UnboundedReceiver<(ConvoTag, ProtocolType, Vec<u8>)>,
        nodedb: NodeDb,
    }

    fn test_endpoint(config: EndpointConfig) -> TestEndpoint {
        let nodedb = NodeDb::new();
        let (link_tx, link_rx) = mpsc::channel(64);
        let (data_tx, data_rx) = mpsc::unbounded();
        let endpoint = Endpoint::new(EndpointNewArgs {
            config,
            nodedb: nodedb.clone(),
            link_tx,
            data_tx,
        });
        TestEndpoint {
            endpoint,
            link_rx,
            data_rx,
            nodedb,
        }
    }

    fn test_contact() -> RouterContact {
        let mut rng = thread_rng();
        RouterContact::new(
            &SigningKey::generate(&mut rng),
            SecretKey::generate(&mut rng).public_key(),
            IpPort {
                ip_addr: "127.0.0.1".parse().unwrap(),
                port: 12345,
            },
            1234567890,
        )
    }

    fn established_path(now_ms: u64) -> Path {
        let mut path = Path::new((0..4).map(|_| PathHop::new(test_contact())).collect());
        path.handle_built(clock_now(), now_ms);
        path
    }

    fn established_path_to(terminal: RouterContact, now_ms: u64) -> Path {
        let mut hops = (0..3)
            .map(|_| PathHop::new(test_contact()))
            .collect::<Vec<_>>();
        hops.push(PathHop::new(terminal));
        let mut path = Path::new(hops);
        path.handle_built(clock_now(), now_ms);
        path
    }

    fn remote_service(intro_router: RouterId, expires_at: u64) -> (Identity, IntroSet) {
        let identity = Identity::regenerate();
        let mut introset = IntroSet::new(identity.info(), identity.pq_public_key(), Tag::default());
        introset.intros = vec![Introduction {
            router: intro_router,
            path_id: PathId([6; 16]),
            expires_at,
        }];
        identity.sign_introset(&mut introset);
        (identity, introset)
    }

    fn sent_routing(path: &Path, link: &LinkMessage) -> RoutingMessage {
        let frame = match link {
            LinkMessage::RelayUpstream(frame) => frame,
            other => panic!("unexpected link message {:?}", other),
        };
        let data = path.peel_forward(frame).unwrap();
        RoutingMessage::from_bytes(&data).unwrap().1
    }

    fn sent_dht(path: &Path, link: &LinkMessage) -> DhtMessage {
        match sent_routing(path, link) {
            RoutingMessage::Dht(mut dht) => dht.msgs.remove(0),
            other => panic!("unexpected routing message {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_and_confirmation() {
        let mut te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();
        let path = established_path(1_000_000);
        te.endpoint.state.write().await.paths.add_path(path.clone());

        te.endpoint.tick(1_000_000).await;

        let (tx_id, introset) = {
            let state = te.endpoint.state.read().await;
            assert_ne!(state.current_publish_tx, 0);
            (state.current_publish_tx, state.introset.clone())
        };
        assert!(introset.verify_signature());
        assert_eq!(introset.intros.len(), 1);

        let (router, link) = te.link_rx.try_next().unwrap().unwrap();
        assert_eq!(router, path.upstream());
        match sent_dht(&path, &link) {
            DhtMessage::PublishIntro(msg) => {
                assert_eq!(msg.tx_id, tx_id);
                assert_eq!(msg.replication, PUBLISH_REPLICATION);
                assert_eq!(msg.introset, introset);
            }
            other => panic!("unexpected dht message {:?}", other),
        }

        // confirmation flips the publish state
        te.endpoint
            .handle_got_intro(GotIntroMessage {
                tx_id,
                introsets: vec![introset.clone()],
            })
            .await;
        {
            let state = te.endpoint.state.read().await;
            assert_eq!(state.current_publish_tx, 0);
            assert!(state.last_publish.is_some());
        }

        // a duplicate confirmation is ignored
        te.endpoint
            .handle_got_intro(GotIntroMessage {
                tx_id,
                introsets: vec![introset],
            })
            .await;
        let state = te.endpoint.state.read().await;
        assert_eq!(state.current_publish_tx, 0);
    }

    #[tokio::test]
    async fn bad_signature_on_own_introset_fails_publish() {
        let mut te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();
        let path = established_path(1_000_000);
        te.endpoint.state.write().await.paths.add_path(path.clone());
        te.endpoint.tick(1_000_000).await;
        let _ = te.link_rx.try_next();

        let (tx_id, mut introset) = {
            let state = te.endpoint.state.read().await;
            (state.current_publish_tx, state.introset.clone())
        };
        // a mutated copy no longer verifies
        introset.intros[0].expires_at += 1;
        te.endpoint
            .handle_got_intro(GotIntroMessage {
                tx_id,
                introsets: vec![introset],
            })
            .await;
        let state = te.endpoint.state.read().await;
        assert_eq!(state.current_publish_tx, 0);
        assert!(state.last_publish.is_none());
    }

    #[tokio::test]
    async fn duplicate_service_lookup_emits_one_message() {
        let mut te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();
        let path = established_path(1_000_000);
        te.endpoint.state.write().await.paths.add_path(path.clone());

        let (_remote_identity, remote_introset) =
            remote_service(RouterId([5; 32]), u64::MAX);
        let addr = remote_introset.info.address();

        let (hook_1, rx_1) = oneshot::channel();
        let (hook_2, rx_2) = oneshot::channel();
        te.endpoint.ensure_path_to_service(addr, hook_1).await.unwrap();
        te.endpoint.ensure_path_to_service(addr, hook_2).await.unwrap();

        // exactly one FindIntro went out
        let (_, link) = te.link_rx.try_next().unwrap().unwrap();
        assert!(te.link_rx.try_next().is_err());
        let tx_id = match sent_dht(&path, &link) {
            DhtMessage::FindIntro(msg) => {
                assert_eq!(msg.target, LookupTarget::Address(addr));
                assert_eq!(msg.replication, FIND_INTRO_REPLICATION);
                msg.tx_id
            }
            other => panic!("unexpected dht message {:?}", other),
        };

        // both hooks fire on success
        te.endpoint
            .handle_got_intro(GotIntroMessage {
                tx_id,
                introsets: vec![remote_introset],
            })
            .await;
        assert_eq!(rx_1.await.unwrap(), addr);
        assert_eq!(rx_2.await.unwrap(), addr);
        let state = te.endpoint.state.read().await;
        assert!(state.remote_sessions.contains_key(&addr));
        assert!(state.pending_service_hooks.is_empty());
    }

    #[tokio::test]
    async fn lookup_timeout_reports_empty() {
        tokio::time::pause();
        let mut te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();
        let path = established_path(1_000_000);
        te.endpoint.state.write().await.paths.add_path(path);

        let addr = Address([9; 32]);
        let (hook, rx) = oneshot::channel();
        te.endpoint.ensure_path_to_service(addr, hook).await.unwrap();
        let _ = te.link_rx.try_next();

        tokio::time::advance(LOOKUP_TIMEOUT + Duration::from_secs(1)).await;
        te.endpoint.tick(1_100_000).await;

        // the dropped hook is the empty result
        assert!(rx.await.is_err());
        let state = te.endpoint.state.read().await;
        assert!(state.pending_service_hooks.is_empty());
        assert!(!state.remote_sessions.contains_key(&addr));
    }

    #[tokio::test]
    async fn intro_handshake_first_and_second_send() {
        let mut te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();

        let intro_router = test_contact();
        let (remote_identity, remote_introset) =
            remote_service(intro_router.id, u64::MAX);
        let addr = remote_introset.info.address();

        let path = established_path_to(intro_router, 1_000_000);
        let mut context = OutboundContext::new(remote_introset, 4, 4);
        context.paths.add_path(path.clone());
        te.endpoint
            .state
            .write()
            .await
            .remote_sessions
            .insert(addr, context);

        te.endpoint
            .send_to_service(addr, ProtocolType::Text, b"hello".to_vec())
            .await
            .unwrap();
        let (_, link_1) = te.link_rx.try_next().unwrap().unwrap();
        let transfer_1 = match sent_routing(&path, &link_1) {
            RoutingMessage::PathTransfer(msg) => msg,
            other => panic!("unexpected routing message {:?}", other),
        };
        assert_eq!(transfer_1.dest_path_id, PathId([6; 16]));
        let frame_1 = transfer_1.frame;
        assert!(frame_1.pq_ciphertext.is_some());
        assert_eq!(frame_1.seq_no, 1);

        te.endpoint
            .send_to_service(addr, ProtocolType::Text, b"again".to_vec())
            .await
            .unwrap();
        let (_, link_2) = te.link_rx.try_next().unwrap().unwrap();
        let frame_2 = match sent_routing(&path, &link_2) {
            RoutingMessage::PathTransfer(msg) => msg.frame,
            other => panic!("unexpected routing message {:?}", other),
        };
        assert_eq!(frame_2.pq_ciphertext, None);
        assert_eq!(frame_2.tag, frame_1.tag);
        assert_eq!(frame_2.seq_no, 2);

        // the remote can decrypt the first frame and derive the same key
        let pq_secret = pq_decapsulate(
            frame_1.pq_ciphertext.as_ref().unwrap(),
            remote_identity.pq_secret(),
        )
        .unwrap();
        let msg = frame_1.get_payload(&pq_secret).unwrap();
        assert_eq!(msg.body, b"hello");
        assert!(frame_1.verify(&msg.sender.sign_pk));
        let dh = keyed_shared_secret(
            remote_identity.enc_secret(),
            &msg.sender.enc_pk,
            &frame_1.nonce,
        );
        let shared = conversation_key(&pq_secret, &dh);
        assert_eq!(
            te.endpoint.get_cached_session_key_for(frame_1.tag).await,
            Some(shared)
        );
        // and that key opens the second frame
        assert_eq!(frame_2.get_payload(&shared).unwrap().body, b"again");
    }

    #[tokio::test]
    async fn inbound_frames_create_and_reuse_conversation() {
        let mut te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();
        let path = established_path(1_000_000);
        te.endpoint.state.write().await.paths.add_path(path.clone());

        let (our_info, our_pq_pk) = {
            let state = te.endpoint.state.read().await;
            (state.identity.info(), state.identity.pq_public_key())
        };

        let sender = Identity::regenerate();
        let reply_intro = Introduction {
            router: RouterId([8; 32]),
            path_id: PathId([9; 16]),
            expires_at: u64::MAX,
        };

        // first frame with the pq ciphertext
        let (ct, pq_secret) = pq_encapsulate(&our_pq_pk).unwrap();
        let nonce = gen_nonce();
        let tag = ConvoTag::random();
        let msg = ProtocolMessage {
            proto: ProtocolType::Text,
            sender: sender.info(),
            intro_reply: reply_intro,
            body: b"ping".to_vec(),
        };
        let frame = ProtocolFrame::encrypt_and_sign(
            &msg,
            &pq_secret,
            Some(ct),
            nonce,
            tag,
            1,
            sender.signing_key(),
        );
        let relay = path.wrap_downstream(&RoutingMessage::PathTransfer(
            PathTransferMessage::new(path.rx_id(), frame),
        ));
        te.endpoint
            .handle_link_message(path.upstream(), LinkMessage::RelayDownstream(relay))
            .await;

        let (got_tag, proto, body) = te.data_rx.try_next().unwrap().unwrap();
        assert_eq!(got_tag, tag);
        assert_eq!(proto, ProtocolType::Text);
        assert_eq!(body, b"ping");
        assert_eq!(te.endpoint.get_sender_for(tag).await, Some(sender.info()));
        assert_eq!(te.endpoint.get_intro_for(tag).await, Some(reply_intro));

        // second frame under the derived conversation key, with a gap in the
        // sequence numbers
        let dh = keyed_shared_secret(sender.enc_secret(), &our_info.enc_pk, &nonce);
        let shared = conversation_key(&pq_secret, &dh);
        assert_eq!(
            te.endpoint.get_cached_session_key_for(tag).await,
            Some(shared)
        );
        let msg_2 = ProtocolMessage {
            proto: ProtocolType::Text,
            sender: sender.info(),
            intro_reply: reply_intro,
            body: b"pong".to_vec(),
        };
        let frame_2 = ProtocolFrame::encrypt_and_sign(
            &msg_2,
            &shared,
            None,
            gen_nonce(),
            tag,
            5,
            sender.signing_key(),
        );
        let relay_2 = path.wrap_downstream(&RoutingMessage::PathTransfer(
            PathTransferMessage::new(path.rx_id(), frame_2),
        ));
        te.endpoint
            .handle_link_message(path.upstream(), LinkMessage::RelayDownstream(relay_2))
            .await;
        let (_, _, body_2) = te.data_rx.try_next().unwrap().unwrap();
        assert_eq!(body_2, b"pong");
        let state = te.endpoint.state.read().await;
        assert_eq!(state.convos[&tag].seq_no, 5);
    }

    #[tokio::test]
    async fn frame_for_unknown_tag_dropped() {
        let mut te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();
        let path = established_path(1_000_000);
        te.endpoint.state.write().await.paths.add_path(path.clone());

        let sender = Identity::regenerate();
        let msg = ProtocolMessage {
            proto: ProtocolType::Text,
            sender: sender.info(),
            intro_reply: Introduction::default(),
            body: b"stray".to_vec(),
        };
        let frame = ProtocolFrame::encrypt_and_sign(
            &msg,
            &[42; SESSION_KEY_SIZE],
            None,
            gen_nonce(),
            ConvoTag::random(),
            1,
            sender.signing_key(),
        );
        let relay = path.wrap_downstream(&RoutingMessage::PathTransfer(
            PathTransferMessage::new(path.rx_id(), frame),
        ));
        te.endpoint
            .handle_link_message(path.upstream(), LinkMessage::RelayDownstream(relay))
            .await;
        assert!(te.data_rx.try_next().is_err());
    }

    #[tokio::test]
    async fn convo_tags_unrelated_session() {
        let te = test_endpoint(Default::default());
        let service_a = Identity::regenerate().info();
        let service_b = Identity::regenerate().info();

        let tag_1 = ConvoTag::random();
        let tag_2 = ConvoTag::random();
        let tag_3 = ConvoTag::random();
        te.endpoint.put_sender_for(tag_1, service_a.clone()).await;
        te.endpoint.put_sender_for(tag_2, service_b.clone()).await;
        te.endpoint.put_sender_for(tag_3, service_a.clone()).await;

        // the unrelated session must neither appear nor hang the iteration
        let mut tags = te.endpoint.get_convo_tags_for_service(&service_a).await;
        tags.sort();
        let mut expected = vec![tag_1, tag_3];
        expected.sort();
        assert_eq!(tags, expected);
        assert_eq!(
            te.endpoint.get_convo_tags_for_service(&service_b).await,
            vec![tag_2]
        );
    }

    #[tokio::test]
    async fn ensure_router_is_known_flow() {
        let mut te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();
        let path = established_path(1_000_000);
        te.endpoint.state.write().await.paths.add_path(path.clone());

        // zero router id is a no-op
        te.endpoint.ensure_router_is_known(RouterId::default()).await;
        assert!(te.link_rx.try_next().is_err());

        // known router is a no-op
        let known = test_contact();
        te.nodedb.put(known.clone()).await;
        te.endpoint.ensure_router_is_known(known.id).await;
        assert!(te.link_rx.try_next().is_err());

        // unknown router triggers exactly one lookup
        let unknown = test_contact();
        te.endpoint.ensure_router_is_known(unknown.id).await;
        let (_, link) = te.link_rx.try_next().unwrap().unwrap();
        match sent_dht(&path, &link) {
            DhtMessage::FindRouter(msg) => assert_eq!(msg.target, unknown.id),
            other => panic!("unexpected dht message {:?}", other),
        }
        te.endpoint.ensure_router_is_known(unknown.id).await;
        assert!(te.link_rx.try_next().is_err());

        // a single contact response is verified and stored
        te.endpoint
            .handle_got_router(GotRouterMessage {
                tx_id: 1,
                contacts: vec![unknown.clone()],
            })
            .await;
        assert!(te.nodedb.has(&unknown.id).await);
    }

    #[tokio::test]
    async fn got_router_rejects_bad_and_multiple_contacts() {
        let te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();

        let mut tampered = test_contact();
        te.endpoint
            .state
            .write()
            .await
            .pending_routers
            .insert(tampered.id, RouterLookupJob { started_at: clock_now() });
        tampered.last_updated += 1;
        te.endpoint
            .handle_got_router(GotRouterMessage {
                tx_id: 1,
                contacts: vec![tampered.clone()],
            })
            .await;
        assert!(!te.nodedb.has(&tampered.id).await);

        // responses with more than one contact are ignored
        let rc = test_contact();
        te.endpoint
            .state
            .write()
            .await
            .pending_routers
            .insert(rc.id, RouterLookupJob { started_at: clock_now() });
        te.endpoint
            .handle_got_router(GotRouterMessage {
                tx_id: 2,
                contacts: vec![rc.clone(), test_contact()],
            })
            .await;
        assert!(!te.nodedb.has(&rc.id).await);
        assert!(te
            .endpoint
            .state
            .read()
            .await
            .pending_routers
            .contains_key(&rc.id));
    }

    #[tokio::test]
    async fn prefetch_addr_looks_up_and_opens_with_keepalive() {
        let mut config = EndpointConfig::default();
        let (_remote_identity, remote_introset) = remote_service(RouterId([5; 32]), u64::MAX);
        let addr = remote_introset.info.address();
        config.prefetch_addrs.insert(addr);

        let mut te = test_endpoint(config);
        te.endpoint.start().await.unwrap();
        let path = established_path(1_000_000);
        te.endpoint.state.write().await.paths.add_path(path.clone());

        te.endpoint.tick(1_000_000).await;
        // tick publishes first, then prefetches the address
        let mut find_tx = None;
        while let Ok(Some((_, link))) = te.link_rx.try_next() {
            if let RoutingMessage::Dht(mut dht) = sent_routing(&path, &link) {
                if let DhtMessage::FindIntro(msg) = dht.msgs.remove(0) {
                    assert_eq!(msg.target, LookupTarget::Address(addr));
                    find_tx = Some(msg.tx_id);
                }
            }
        }
        let tx_id = find_tx.expect("prefetch emitted no lookup");

        te.endpoint
            .handle_got_intro(GotIntroMessage {
                tx_id,
                introsets: vec![remote_introset],
            })
            .await;
        let state = te.endpoint.state.read().await;
        let context = &state.remote_sessions[&addr];
        // the keepalive waits for an aligned path
        assert_eq!(
            context.pending_payloads,
            vec![(ProtocolType::Control, Vec::new())]
        );
    }

    #[tokio::test]
    async fn expiring_intro_reselects_and_refreshes() {
        let te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();
        let path = established_path(1_000_000);
        te.endpoint.state.write().await.paths.add_path(path.clone());

        // two intros: the selected one is about to expire, the other is fresh
        let remote_identity = Identity::regenerate();
        let mut introset = IntroSet::new(
            remote_identity.info(),
            remote_identity.pq_public_key(),
            Tag::default(),
        );
        let fresh_router = RouterId([7; 32]);
        introset.intros = vec![Introduction {
            router: RouterId([5; 32]),
            path_id: PathId([6; 16]),
            expires_at: 1_010_000,
        }];
        remote_identity.sign_introset(&mut introset);
        let addr = introset.info.address();
        let mut context = OutboundContext::new(introset, 4, 4);
        context.current_introset.intros.push(Introduction {
            router: fresh_router,
            path_id: PathId([8; 16]),
            expires_at: 2_000_000,
        });
        te.endpoint
            .state
            .write()
            .await
            .remote_sessions
            .insert(addr, context);

        te.endpoint.tick(1_000_000).await;

        let state = te.endpoint.state.read().await;
        let context = &state.remote_sessions[&addr];
        // the selection moved to the freshest intro and a refresh went out
        assert_eq!(context.selected_intro.router, fresh_router);
        assert!(context.update_in_flight);
        assert!(state
            .pending_lookups
            .any(|lookup| matches!(lookup, PendingLookup::IntroSetUpdate { addr: a } if *a == addr)));
        // the intro router is unknown, so a router lookup is pending too
        assert!(state.pending_routers.contains_key(&fresh_router));
    }

    #[tokio::test]
    async fn path_built_confirms_own_and_context_paths() {
        let te = test_endpoint(Default::default());
        te.endpoint.start().await.unwrap();

        let building = Path::new((0..4).map(|_| PathHop::new(test_contact())).collect());
        let (router, rx_id) = (building.upstream(), building.rx_id());
        te.endpoint.state.write().await.paths.add_path(building);

        assert!(te.endpoint.handle_path_built(router, rx_id, 1_000_000).await);
        assert!(!te.endpoint.handle_path_built(router, PathId([1; 16]), 1_000_000).await);
        let state = te.endpoint.state.read().await;
        assert_eq!(state.paths.get_current_introductions().len(), 1);
    }

    #[tokio::test]
    async fn idle_conversations_pruned() {
        tokio::time::pause();
        let te = test_endpoint(Default::default());
        let tag = ConvoTag::random();
        te.endpoint
            .put_sender_for(tag, Identity::regenerate().info())
            .await;

        tokio::time::advance(CONVO_TTL + Duration::from_secs(1)).await;
        te.endpoint.tick(1_000_000).await;
        assert_eq!(te.endpoint.get_sender_for(tag).await, None);
    }
}

//! TURN Harvester (spec §4.8): extends the STUN Harvester's
//! retransmit/challenge logic with ALLOCATE's error taxonomy, relayed
//! candidates, and a keep-alive schedule per allocation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;

use codec::Attributes;
use codec::crypto::Password;
use codec::message::attributes::{
    AlternateServer, ChannelNumber, DontFragment, ErrorCode, EvenPort, Lifetime, MappedAddress, Nonce, Realm,
    RequestedTransport, UnknownAttributes, UserName, XorPeerAddress, XorRelayedAddress,
};
use codec::message::methods::{ALLOCATE_REQUEST, CHANNEL_BIND_REQUEST, CREATE_PERMISSION_REQUEST, REFRESH_REQUEST};
use codec::message::{Message, MessageEncoder};

use crate::candidate::{Candidate, CandidateKind};
use crate::component::ComponentSink;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::socket::BindingTable;
use crate::stun::credentials::{CredentialManager, LongTermCredentialProvider};
use crate::stun::transaction::{ApplicationData, Endpoint, TransactionLayer};
use crate::transport::{Transport, TransportAddress};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_LIFETIME_SECS: u32 = 600;
const MAX_ALLOCATE_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct TurnHarvesterConfig {
    pub enable_tcp: bool,
    pub enable_tls: bool,
    pub try_alternate: bool,
    pub use_even_port: bool,
    /// Accepted for parity with the configuration surface; the codec's
    /// EVEN-PORT attribute carries only the reserve bit itself, so this
    /// has no separate wire effect.
    pub even_port_rflag: bool,
    pub dont_fragment: bool,
}

impl From<&Config> for TurnHarvesterConfig {
    fn from(config: &Config) -> Self {
        Self {
            enable_tcp: config.turn_enable_tcp,
            enable_tls: config.turn_enable_tls,
            try_alternate: config.turn_try_alternate,
            use_even_port: config.turn_use_even_port,
            even_port_rflag: config.turn_even_port_rflag,
            dont_fragment: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct DisabledAttributes {
    dont_fragment: bool,
    even_port: bool,
}

enum TurnResponse {
    Allocated { mapped: SocketAddr, relayed: SocketAddr, lifetime: u32 },
    RefreshOk { lifetime: u32 },
    Unauthorized { realm: String, nonce: String },
    StaleNonce { nonce: String },
    TryAlternate { server: SocketAddr },
    UnknownAttribute { codes: Vec<u16> },
    OtherError { code: u16 },
}

/// What a granted allocation needs to build CreatePermission/ChannelBind
/// requests later: which host socket it was allocated from, and which
/// server address ultimately granted it (post TRY_ALTERNATE redirection).
#[derive(Clone, Copy)]
struct AllocationState {
    host_local: TransportAddress,
    server_addr: SocketAddr,
}

pub struct TurnHarvester {
    server: TransportAddress,
    transactions: Arc<TransactionLayer>,
    bindings: Arc<BindingTable>,
    credentials: Arc<CredentialManager>,
    provider: Arc<dyn LongTermCredentialProvider>,
    config: TurnHarvesterConfig,
    /// Relayed address -> allocation state, so `create_permission`/
    /// `bind_channel` can service any relayed candidate this instance
    /// has produced (spec §4.8: "a single harvester instance can
    /// service multiple relayed streams concurrently").
    allocations: Mutex<HashMap<SocketAddr, AllocationState>>,
    /// Set by `close()`; checked by every keep-alive task on each
    /// iteration so closing after a task has already woken up from its
    /// sleep still takes effect before it sends another REFRESH.
    closed: Arc<AtomicBool>,
    /// Notified by `close()`; every keep-alive task for this harvester
    /// races its sleep against this to exit promptly instead of
    /// leaking for the process lifetime (spec §5: "terminates the
    /// keep-alive threads").
    close_signal: Arc<tokio::sync::Notify>,
}

impl TurnHarvester {
    pub fn new(
        server: TransportAddress,
        transactions: Arc<TransactionLayer>,
        bindings: Arc<BindingTable>,
        credentials: Arc<CredentialManager>,
        provider: Arc<dyn LongTermCredentialProvider>,
        config: TurnHarvesterConfig,
    ) -> Self {
        Self {
            server,
            transactions,
            bindings,
            credentials,
            provider,
            config,
            allocations: Mutex::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            close_signal: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn identity(&self) -> String {
        format!("turn:{}:{}", self.server, self.credentials.short_term().map(|c| c.username).unwrap_or_default())
    }

    /// Close this harvest (spec §5): cancel in-flight transactions and
    /// terminate every keep-alive task this harvester has spawned.
    /// Idempotent — `Notify::notify_waiters` is a no-op when nothing is
    /// waiting, and `cancel_all` on an empty transaction table is a
    /// no-op too.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.transactions.cancel_all();
        self.close_signal.notify_waiters();
    }

    pub async fn harvest(&self, component: &dyn ComponentSink) -> Result<Vec<Candidate>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Disabled);
        }
        if matches!(self.server.transport, Transport::Tcp) && !self.config.enable_tcp {
            return Ok(Vec::new());
        }
        if matches!(self.server.transport, Transport::Tls) && !self.config.enable_tls {
            return Ok(Vec::new());
        }

        let hosts: Vec<Candidate> = component
            .local_candidates()
            .into_iter()
            .filter(|c| c.kind == CandidateKind::Host)
            .filter(|c| c.local.transport == self.server.transport)
            .filter(|c| c.local.addr.is_ipv4() == self.server.addr.is_ipv4())
            .collect();

        let component_id = component.component_id();
        let mut candidates = Vec::new();

        for host in hosts {
            match self.allocate_for_host(&host, component_id).await {
                Ok(Some((srflx, relayed))) => {
                    candidates.push(srflx);
                    candidates.push(relayed);
                }
                Ok(None) => {}
                Err(err) => log::info!("turn harvest against {}: {err} (host {})", self.server, host.local),
            }
        }

        Ok(candidates)
    }

    async fn allocate_for_host(
        &self,
        host: &Candidate,
        component_id: u16,
    ) -> Result<Option<(Candidate, Candidate)>> {
        let mut disabled = DisabledAttributes::default();
        let mut server_addr = self.server.addr;
        let mut auth_retried = false;
        let mut stale_nonce_retried = false;
        let mut fallen_back_to_binding = false;

        for _attempt in 0..MAX_ALLOCATE_ATTEMPTS {
            let endpoint = self.endpoint_for(host.local, server_addr).await?;
            let long_term = self.credentials.long_term();
            let password = long_term.as_ref().map(|s| s.password.clone());

            let (_, request) =
                self.build_allocate_request(host.local.transport, long_term.as_ref(), &disabled);
            let response = self.send_and_decode(endpoint, request).await?;

            match response {
                TurnResponse::Allocated { mapped, relayed, lifetime } => {
                    let stun_server = Some(server_addr);
                    let srflx = Candidate::derived(
                        CandidateKind::ServerReflexive,
                        TransportAddress::new(mapped, host.local.transport),
                        host.base,
                        component_id,
                        Some(host.local.addr),
                        stun_server,
                    );
                    let relay = Candidate::derived(
                        CandidateKind::Relayed,
                        TransportAddress::new(relayed, host.local.transport),
                        host.base,
                        component_id,
                        Some(host.local.addr),
                        stun_server,
                    );

                    self.allocations.lock().insert(
                        relayed,
                        AllocationState { host_local: host.local, server_addr },
                    );

                    self.spawn_keep_alive(
                        host,
                        server_addr,
                        password,
                        lifetime,
                        Arc::clone(&self.closed),
                        Arc::clone(&self.close_signal),
                    );
                    return Ok(Some((srflx, relay)));
                }

                TurnResponse::RefreshOk { .. } => {
                    // Only reachable if a REFRESH were mistakenly routed
                    // through the allocate path; ALLOCATE never yields
                    // this variant.
                    return Ok(None);
                }

                TurnResponse::Unauthorized { realm, nonce } => {
                    if auth_retried {
                        return Err(Error::AuthFailed);
                    }
                    auth_retried = true;
                    if self.credentials.establish_long_term(&realm, &nonce, self.provider.as_ref()).is_none() {
                        return Ok(None);
                    }
                }

                TurnResponse::StaleNonce { nonce } => {
                    if stale_nonce_retried {
                        return Err(Error::AuthFailed);
                    }
                    stale_nonce_retried = true;
                    self.credentials.update_nonce(&nonce);
                }

                TurnResponse::TryAlternate { server } => {
                    if !self.config.try_alternate {
                        return Err(Error::AllocationFailed("TRY_ALTERNATE refused by configuration".into()));
                    }
                    self.credentials.clear_long_term();
                    server_addr = server;
                }

                TurnResponse::UnknownAttribute { codes } => {
                    for code in codes {
                        match code {
                            0x001A => disabled.dont_fragment = true,
                            0x0018 => disabled.even_port = true,
                            _ => {}
                        }
                    }
                }

                TurnResponse::OtherError { code: 437 } => {
                    // Restart allocation as if first attempt.
                    disabled = DisabledAttributes::default();
                }

                TurnResponse::OtherError { code: 440 } => {
                    // REQUESTED-ADDRESS-FAMILY is never attached by this
                    // harvester, so removing it is a no-op; retry as-is.
                }

                TurnResponse::OtherError { code: 442 | 486 | 508 } => {
                    if fallen_back_to_binding {
                        return Err(Error::AllocationFailed("relayed candidate unobtainable".into()));
                    }
                    fallen_back_to_binding = true;
                    log::info!(
                        "turn allocate against {server_addr}: falling back to plain binding, relayed candidate unobtainable"
                    );
                    return Ok(None);
                }

                TurnResponse::OtherError { code } => {
                    return Err(Error::AllocationFailed(format!("unhandled error code {code}")));
                }
            }
        }

        Err(Error::AllocationFailed("exhausted allocate retry budget".into()))
    }

    fn build_allocate_request(
        &self,
        transport: Transport,
        long_term: Option<&crate::stun::credentials::LongTermSession>,
        disabled: &DisabledAttributes,
    ) -> ([u8; 12], Bytes) {
        let mut tx_id = [0u8; 12];
        rand::rng().fill(&mut tx_id);

        let mut buf = BytesMut::new();
        let mut encoder = MessageEncoder::new(ALLOCATE_REQUEST, &tx_id, &mut buf);

        let requested = match transport {
            Transport::Udp => RequestedTransport::Udp,
            Transport::Tcp | Transport::Tls => RequestedTransport::Tcp,
        };
        encoder.append::<RequestedTransport>(requested);

        if self.config.use_even_port && !disabled.even_port {
            encoder.append::<EvenPort>(true);
        }
        if self.config.dont_fragment && !disabled.dont_fragment {
            encoder.append::<DontFragment>(());
        }

        if let Some(session) = long_term {
            encoder.append::<UserName>(&session.username);
            encoder.append::<Realm>(&session.realm);
            encoder.append::<Nonce>(&session.nonce);
        }

        let password = long_term.map(|s| &s.password);
        let _ = encoder.flush(password);

        (tx_id, Bytes::from(buf))
    }

    async fn send_and_decode(&self, endpoint: Endpoint, request: Bytes) -> Result<TurnResponse> {
        let (_, receiver) = self.transactions.send(endpoint, request);
        let result = receiver.await.map_err(|_| Error::TransactionFailure("transaction canceled".into()))?;
        let bytes = result.outcome.map_err(|err| Error::TransactionFailure(format!("{err:?}")))?;

        let mut attrs = Attributes::default();
        let message = Message::decode(&bytes, &mut attrs)?;

        if message.method().is_error() {
            let err = message.get::<ErrorCode>().ok_or_else(|| Error::MalformedMessage("missing ERROR-CODE".into()))?;

            return Ok(match err.code {
                300 => {
                    let server = message
                        .get::<AlternateServer>()
                        .ok_or_else(|| Error::MalformedMessage("300 missing ALTERNATE-SERVER".into()))?;
                    TurnResponse::TryAlternate { server }
                }
                401 => TurnResponse::Unauthorized {
                    realm: message.get::<Realm>().unwrap_or("").to_string(),
                    nonce: message.get::<Nonce>().unwrap_or("").to_string(),
                },
                420 => TurnResponse::UnknownAttribute { codes: message.get::<UnknownAttributes>().unwrap_or_default() },
                438 => TurnResponse::StaleNonce { nonce: message.get::<Nonce>().unwrap_or("").to_string() },
                code => TurnResponse::OtherError { code },
            });
        }

        if message.method() == REFRESH_RESPONSE_METHOD {
            let lifetime = message.get::<Lifetime>().unwrap_or(DEFAULT_LIFETIME_SECS);
            return Ok(TurnResponse::RefreshOk { lifetime });
        }

        let mapped = message
            .get::<MappedAddress>()
            .ok_or_else(|| Error::MalformedMessage("allocate success missing MAPPED-ADDRESS".into()))?;
        let relayed = message
            .get::<XorRelayedAddress>()
            .ok_or_else(|| Error::MalformedMessage("allocate success missing XOR-RELAYED-ADDRESS".into()))?;
        let lifetime = message.get::<Lifetime>().unwrap_or(DEFAULT_LIFETIME_SECS);

        Ok(TurnResponse::Allocated { mapped, relayed, lifetime })
    }

    async fn endpoint_for(&self, host_local: TransportAddress, server_addr: SocketAddr) -> Result<Endpoint> {
        match host_local.transport {
            Transport::Udp => {
                let local = TransportAddress::new(host_local.addr, Transport::Udp);
                let socket = self.bindings.get(&local).ok_or_else(|| {
                    Error::NetworkError(std::io::Error::new(std::io::ErrorKind::NotFound, "host socket not found"))
                })?;
                Ok(Endpoint::Udp { socket, target: server_addr })
            }
            Transport::Tcp | Transport::Tls => {
                let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(server_addr))
                    .await
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "turn tcp connect timed out"))??;
                Ok(Endpoint::Stream { stream: Arc::new(tokio::sync::Mutex::new(stream)) })
            }
        }
    }

    /// Send a CreatePermission request for `peer` against `relayed`'s
    /// allocation (RFC 5766 §9), retrying once on 438 Stale Nonce.
    /// `relayed` must be an address this harvester's `harvest` call
    /// previously returned as a `CandidateKind::Relayed` candidate.
    pub async fn create_permission(&self, relayed: SocketAddr, peer: std::net::IpAddr) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Disabled);
        }
        let state = self.allocation_state(relayed)?;
        let peer_addr = SocketAddr::new(peer, 0);

        self.send_permission_request(state, CREATE_PERMISSION_REQUEST, peer_addr, |encoder| {
            encoder.append::<XorPeerAddress>(peer_addr);
        })
        .await
    }

    /// Send a ChannelBind request binding `channel` to `peer` against
    /// `relayed`'s allocation (RFC 5766 §11), retrying once on 438 Stale
    /// Nonce. ChannelBind implicitly installs the matching permission.
    pub async fn bind_channel(&self, relayed: SocketAddr, peer: SocketAddr, channel: u16) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Disabled);
        }
        let state = self.allocation_state(relayed)?;

        self.send_permission_request(state, CHANNEL_BIND_REQUEST, peer, |encoder| {
            encoder.append::<ChannelNumber>(channel);
            encoder.append::<XorPeerAddress>(peer);
        })
        .await
    }

    fn allocation_state(&self, relayed: SocketAddr) -> Result<AllocationState> {
        self.allocations
            .lock()
            .get(&relayed)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("no allocation for relayed address {relayed}")))
    }

    /// Shared CreatePermission/ChannelBind request/retry logic: both
    /// methods differ only in which method code and attributes they
    /// attach, via `build_attrs`.
    async fn send_permission_request(
        &self,
        state: AllocationState,
        method: codec::message::methods::Method,
        peer: SocketAddr,
        build_attrs: impl Fn(&mut MessageEncoder<'_>),
    ) -> Result<()> {
        let mut retried_stale_nonce = false;

        loop {
            let endpoint = self.endpoint_for(state.host_local, state.server_addr).await?;
            let long_term = self.credentials.long_term();
            let password = long_term.as_ref().map(|s| s.password.clone());

            let mut tx_id = [0u8; 12];
            rand::rng().fill(&mut tx_id);
            let mut buf = BytesMut::new();
            let mut encoder = MessageEncoder::new(method, &tx_id, &mut buf);
            build_attrs(&mut encoder);
            if let Some(session) = &long_term {
                encoder.append::<UserName>(&session.username);
                encoder.append::<Realm>(&session.realm);
                encoder.append::<Nonce>(&session.nonce);
            }
            let _ = encoder.flush(password.as_ref());
            let request = Bytes::from(buf);

            let app_data: ApplicationData = Arc::new(peer);
            let (_, receiver) = self.transactions.send_with_data(endpoint, request, Some(app_data));
            let result = receiver.await.map_err(|_| Error::TransactionFailure("transaction canceled".into()))?;
            let bytes = match result.outcome {
                Ok(bytes) => bytes,
                Err(err) => {
                    let peer = result
                        .application_data
                        .and_then(|data| data.downcast::<SocketAddr>().ok())
                        .map(|addr| *addr)
                        .unwrap_or(peer);
                    return Err(Error::TransactionFailure(format!("permission/channel request for {peer} failed: {err:?}")));
                }
            };

            let mut attrs = Attributes::default();
            let message = Message::decode(&bytes, &mut attrs)?;

            if !message.method().is_error() {
                return Ok(());
            }

            let err = message.get::<ErrorCode>().ok_or_else(|| Error::MalformedMessage("missing ERROR-CODE".into()))?;
            if err.code == 438 && !retried_stale_nonce {
                retried_stale_nonce = true;
                if let Some(nonce) = message.get::<Nonce>() {
                    self.credentials.update_nonce(nonce);
                }
                continue;
            }

            return Err(Error::AllocationFailed(format!("permission/channel request for {peer} rejected: {} {}", err.code, err.message)));
        }
    }

    /// Spawn the per-allocation keep-alive: sleep `lifetime/2`, send
    /// REFRESH; on failure, retry once immediately then defer to the
    /// next interval; exit when LIFETIME is set to zero or the harvest
    /// is closed (spec §4.8, spec §5).
    fn spawn_keep_alive(
        &self,
        host: &Candidate,
        server_addr: SocketAddr,
        password: Option<Password>,
        lifetime: u32,
        closed: Arc<AtomicBool>,
        close_signal: Arc<tokio::sync::Notify>,
    ) {
        let transactions = Arc::clone(&self.transactions);
        let bindings = Arc::clone(&self.bindings);
        let credentials = Arc::clone(&self.credentials);
        let host_local = host.local;
        let lifetime_secs = Arc::new(AtomicU32::new(lifetime));

        tokio::spawn(async move {
            loop {
                if closed.load(Ordering::Relaxed) {
                    return;
                }

                let current = lifetime_secs.load(Ordering::Relaxed);
                if current == 0 {
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(u64::from(current) / 2)) => {}
                    _ = close_signal.notified() => return,
                }

                if closed.load(Ordering::Relaxed) {
                    return;
                }

                let endpoint = match host_local.transport {
                    Transport::Udp => {
                        let local = TransportAddress::new(host_local.addr, Transport::Udp);
                        match bindings.get(&local) {
                            Some(socket) => Endpoint::Udp { socket, target: server_addr },
                            None => return,
                        }
                    }
                    Transport::Tcp | Transport::Tls => match TcpStream::connect(server_addr).await {
                        Ok(stream) => Endpoint::Stream { stream: Arc::new(tokio::sync::Mutex::new(stream)) },
                        Err(_) => return,
                    },
                };

                let mut refreshed = Self::send_refresh(&transactions, &credentials, endpoint.clone(), password.as_ref()).await;
                if refreshed.is_none() {
                    refreshed = Self::send_refresh(&transactions, &credentials, endpoint, password.as_ref()).await;
                }

                match refreshed {
                    Some(next_lifetime) => lifetime_secs.store(next_lifetime, Ordering::Relaxed),
                    None => log::info!("turn keep-alive: REFRESH failed twice for {host_local}, deferring"),
                }
            }
        });
    }

    async fn send_refresh(
        transactions: &Arc<TransactionLayer>,
        credentials: &Arc<CredentialManager>,
        endpoint: Endpoint,
        password: Option<&Password>,
    ) -> Option<u32> {
        let mut tx_id = [0u8; 12];
        rand::rng().fill(&mut tx_id);

        let mut buf = BytesMut::new();
        let mut encoder = MessageEncoder::new(REFRESH_REQUEST, &tx_id, &mut buf);
        if let Some(session) = credentials.long_term() {
            encoder.append::<UserName>(&session.username);
            encoder.append::<Realm>(&session.realm);
            encoder.append::<Nonce>(&session.nonce);
        }
        let _ = encoder.flush(password);

        let (_, receiver) = transactions.send(endpoint, Bytes::from(buf));
        let bytes = receiver.await.ok()?.outcome.ok()?;

        let mut attrs = Attributes::default();
        let message = Message::decode(&bytes, &mut attrs).ok()?;
        if message.method().is_error() {
            if let Some(err) = message.get::<ErrorCode>() {
                if err.code == 438 {
                    if let Some(nonce) = message.get::<Nonce>() {
                        credentials.update_nonce(nonce);
                    }
                }
            }
            return None;
        }

        Some(message.get::<Lifetime>().unwrap_or(DEFAULT_LIFETIME_SECS))
    }
}

const REFRESH_RESPONSE_METHOD: codec::message::methods::Method = codec::message::methods::REFRESH_RESPONSE;

//! TCP Listener (spec §4.12): accepts TCP connections on a Host
//! Candidate's listening socket, frames inbound bytes per RFC 4571
//! (a 2-byte big-endian length prefix per datagram), optionally
//! negotiates the legacy pseudo-SSL handshake first, and hands the
//! channel off to the Component whose ufrag the first STUN Binding
//! Request names.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use codec::Attributes;
use codec::message::Message;
use codec::message::attributes::UserName;
use codec::message::methods::BINDING_REQUEST;

use crate::address::AddressInventory;
use crate::candidate::{Candidate, TcpType};
use crate::component::ComponentSink;
use crate::error::{Error, Result};
use crate::socket::{BindingTable, SocketWrapper};
use crate::stun::classifier::{classify, PacketClass};
use crate::transport::{Transport, TransportAddress};

/// Idle-channel timeout (spec §4.12, §6 `SOCKET_CHANNEL_READ_TIMEOUT`):
/// a channel that produces no readable bytes within this long is
/// canceled and closed.
const SOCKET_CHANNEL_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Legacy pseudo-SSL handshake (design notes §9: a Google libjingle
/// TURN-over-TCP extension predating real TLS support). The exact
/// historical byte sequences aren't present in this pack's source
/// material; these are fixed-length placeholder literals that
/// preserve the protocol's shape — a 79-byte client hello answered by
/// a 76-byte server hello, both compared for an exact match.
const CLIENT_HELLO: [u8; 79] = {
    let mut buf = [0u8; 79];
    buf[0] = 0x80;
    buf[1] = 0x4d;
    buf
};

const SERVER_HELLO: [u8; 76] = {
    let mut buf = [0u8; 76];
    buf[0] = 0x16;
    buf[1] = 0x4d;
    buf
};

#[derive(Debug, Clone, Copy)]
pub struct TcpListenerHarvesterConfig {
    pub preferred_port: u16,
    pub min_port: u16,
    pub max_port: u16,
    pub bind_retries: u32,
    /// Whether to attempt the pseudo-SSL handshake before RFC 4571
    /// framing (spec §9 Open Questions: "an implementer may elide this
    /// path if TCP/TLS candidates are not required").
    pub pseudo_ssl: bool,
    pub read_timeout: Duration,
}

impl Default for TcpListenerHarvesterConfig {
    fn default() -> Self {
        Self {
            preferred_port: 0,
            min_port: crate::socket::MIN_PORT,
            max_port: crate::socket::MAX_PORT,
            bind_retries: 50,
            pseudo_ssl: false,
            read_timeout: SOCKET_CHANNEL_READ_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    AwaitingHandshake,
    AwaitingLength,
    AwaitingPayload(usize),
    HandedOff,
    Closed,
}

struct TcpListenerInner {
    inventory: Arc<AddressInventory>,
    bindings: Arc<BindingTable>,
    config: TcpListenerHarvesterConfig,
    /// ufrag -> owning Component. A `Weak` handle so a Component
    /// dropped by its owner is tombstoned rather than kept alive by
    /// this registry (design notes §9).
    registry: Mutex<HashMap<String, Weak<dyn ComponentSink>>>,
    started: Mutex<HashSet<SocketAddr>>,
}

impl TcpListenerInner {
    fn lookup(&self, ufrag: &str) -> Option<Arc<dyn ComponentSink>> {
        let mut guard = self.registry.lock();
        match guard.get(ufrag).and_then(Weak::upgrade) {
            Some(component) => Some(component),
            None => {
                guard.remove(ufrag);
                None
            }
        }
    }
}

pub struct TcpListenerHarvester {
    inner: Arc<TcpListenerInner>,
}

impl TcpListenerHarvester {
    pub fn new(
        inventory: Arc<AddressInventory>,
        bindings: Arc<BindingTable>,
        config: TcpListenerHarvesterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TcpListenerInner {
                inventory,
                bindings,
                config,
                registry: Mutex::new(HashMap::new()),
                started: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn identity(&self) -> String {
        format!("tcp-listener:{}", self.inner.config.preferred_port)
    }

    pub async fn harvest(&self, component: Arc<dyn ComponentSink>) -> Result<Vec<Candidate>> {
        let entries = self.inner.inventory.enumerate()?;
        let component_id = component.component_id();
        let ufrag = component.local_ufrag();

        self.inner.registry.lock().insert(ufrag, Arc::downgrade(&component));

        let mut candidates = Vec::new();

        for entry in entries {
            let wrapper = match self
                .inner
                .bindings
                .bind_tcp_range(
                    entry.address,
                    self.inner.config.preferred_port,
                    self.inner.config.min_port,
                    self.inner.config.max_port,
                    self.inner.config.bind_retries,
                )
                .await
            {
                Ok(w) => w,
                Err(err) => {
                    log::info!("tcp listener: failed to bind {}: {err}", entry.address);
                    continue;
                }
            };

            let local_addr = match wrapper.local_addr() {
                Ok(a) => a,
                Err(_) => continue,
            };

            {
                let mut started = self.inner.started.lock();
                if started.insert(local_addr) {
                    drop(started);
                    self.spawn_accept_loop(Arc::clone(&wrapper), local_addr);
                }
            }

            let local = TransportAddress::new(local_addr, Transport::Tcp);
            let base_index = candidates.len();
            let mut candidate = Candidate::host(local, component_id, entry.virtual_interface, base_index);
            candidate.tcp_type = Some(TcpType::Passive);
            candidates.push(candidate);
        }

        if candidates.is_empty() {
            return Err(Error::NoLocalCandidates);
        }

        Ok(candidates)
    }

    fn spawn_accept_loop(&self, wrapper: Arc<SocketWrapper>, local_addr: SocketAddr) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let accept_result = match wrapper.as_tcp_listener() {
                    Some(listener) => listener.accept().await,
                    None => return,
                };

                match accept_result {
                    Ok((stream, peer)) => {
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move { handle_channel(inner, stream, peer).await });
                    }
                    Err(err) => {
                        log::info!("tcp listener on {local_addr}: accept failed: {err}");
                        break;
                    }
                }
            }
        });
    }
}

async fn handle_channel(inner: Arc<TcpListenerInner>, mut stream: TcpStream, peer: SocketAddr) {
    let read_timeout = inner.config.read_timeout;
    let mut pending = BytesMut::new();
    let mut state = if inner.config.pseudo_ssl { ChannelState::AwaitingHandshake } else { ChannelState::AwaitingLength };

    loop {
        state = match state {
            ChannelState::AwaitingHandshake => {
                match read_buffered(&mut stream, &mut pending, CLIENT_HELLO.len(), read_timeout).await {
                    Ok(probe) if probe == CLIENT_HELLO => {
                        if stream.write_all(&SERVER_HELLO).await.is_err() {
                            ChannelState::Closed
                        } else {
                            ChannelState::AwaitingLength
                        }
                    }
                    // Not a pseudo-SSL hello: the 79 bytes already read
                    // are genuine RFC 4571 framing input.
                    Ok(probe) => {
                        pending.extend_from_slice(&probe);
                        ChannelState::AwaitingLength
                    }
                    Err(_) => ChannelState::Closed,
                }
            }

            ChannelState::AwaitingLength => match read_buffered(&mut stream, &mut pending, 2, read_timeout).await {
                Ok(prefix) => ChannelState::AwaitingPayload(u16::from_be_bytes([prefix[0], prefix[1]]) as usize),
                Err(_) => ChannelState::Closed,
            },

            ChannelState::AwaitingPayload(0) => ChannelState::Closed,

            // The payload read always ends this channel's life in the
            // read loop above, either handed off or closed, so this
            // branch returns directly rather than flowing back through
            // `state` (which would require moving `stream` out on a
            // loop back-edge the borrow checker can't rule out).
            ChannelState::AwaitingPayload(len) => {
                match read_buffered(&mut stream, &mut pending, len, read_timeout).await {
                    Ok(payload) => {
                        dispatch_first_frame(&inner, stream, peer, payload).await;
                        return;
                    }
                    Err(_) => ChannelState::Closed,
                }
            }

            ChannelState::HandedOff | ChannelState::Closed => break,
        };
    }
}

/// Classifies the first RFC 4571 frame and, if it is a STUN Binding
/// Request naming a registered ufrag, hands `stream` off to that
/// Component. Otherwise the channel (and `stream`) is simply dropped.
async fn dispatch_first_frame(inner: &Arc<TcpListenerInner>, stream: TcpStream, peer: SocketAddr, payload: Vec<u8>) {
    if classify(&payload) != PacketClass::Stun {
        return;
    }

    let mut attrs = Attributes::default();
    let Ok(message) = Message::decode(&payload, &mut attrs) else {
        return;
    };
    if message.method() != BINDING_REQUEST {
        return;
    }

    let Some(username) = message.get::<UserName>() else {
        return;
    };
    let Some((_, local_ufrag)) = username.split_once(':') else {
        return;
    };
    let local_ufrag = local_ufrag.to_string();

    let Some(component) = inner.lookup(&local_ufrag) else {
        log::info!("tcp channel from {peer}: no registered component for ufrag {local_ufrag}");
        return;
    };

    component.accept_tcp_channel(stream, local_ufrag, payload);
}

/// Read exactly `len` bytes, draining `pending` first.
async fn read_buffered(
    stream: &mut TcpStream,
    pending: &mut BytesMut,
    len: usize,
    read_timeout: Duration,
) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);

    if !pending.is_empty() {
        let take = pending.len().min(len);
        out.extend_from_slice(&pending[..take]);
        pending.advance(take);
    }

    if out.len() < len {
        let mut rest = vec![0u8; len - out.len()];
        timeout(read_timeout, stream.read_exact(&mut rest))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tcp channel read timed out"))??;
        out.extend_from_slice(&rest);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::config::Config;
    use bytes::BytesMut as TestBytesMut;
    use codec::message::MessageEncoder;
    use codec::message::methods::BINDING_REQUEST;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingComponent {
        accepted: AtomicBool,
        ufrag: StdMutex<Option<String>>,
    }

    impl ComponentSink for RecordingComponent {
        fn add_local_candidate(&self, _candidate: Candidate) -> bool {
            true
        }

        fn local_candidates(&self) -> Vec<Candidate> {
            Vec::new()
        }

        fn local_ufrag(&self) -> String {
            "local-ufrag".to_string()
        }

        fn agent_component_count(&self) -> usize {
            1
        }

        fn component_id(&self) -> u16 {
            1
        }

        fn accept_tcp_channel(&self, _stream: TcpStream, ufrag: String, _pushback: Vec<u8>) {
            self.accepted.store(true, Ordering::SeqCst);
            *self.ufrag.lock().unwrap() = Some(ufrag);
        }
    }

    fn framed_binding_request(username: &str) -> Vec<u8> {
        let tx_id = [9u8; 12];
        let mut buf = TestBytesMut::new();
        let mut encoder = MessageEncoder::new(BINDING_REQUEST, &tx_id, &mut buf);
        encoder.append::<codec::message::attributes::UserName>(username);
        encoder.flush(None).unwrap();

        let mut framed = Vec::with_capacity(2 + buf.len());
        framed.extend_from_slice(&(buf.len() as u16).to_be_bytes());
        framed.extend_from_slice(&buf);
        framed
    }

    #[tokio::test]
    async fn rfc4571_frame_is_handed_off_to_registered_component() {
        let inner = Arc::new(TcpListenerInner {
            inventory: Arc::new(AddressInventory::new(Config::default()).unwrap()),
            bindings: Arc::new(BindingTable::new()),
            config: TcpListenerHarvesterConfig { pseudo_ssl: false, ..TcpListenerHarvesterConfig::default() },
            registry: Mutex::new(HashMap::new()),
            started: Mutex::new(HashSet::new()),
        });

        let component = Arc::new(RecordingComponent { accepted: AtomicBool::new(false), ufrag: StdMutex::new(None) });
        let component_sink: Arc<dyn ComponentSink> = component.clone();
        inner.registry.lock().insert("local-ufrag".to_string(), Arc::downgrade(&component_sink));

        let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_inner = Arc::clone(&inner);
        let server_task = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_channel(accept_inner, stream, peer).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let frame = framed_binding_request("remote:local-ufrag");
        client.write_all(&frame).await.unwrap();

        server_task.await.unwrap();

        assert!(component.accepted.load(Ordering::SeqCst));
        assert_eq!(component.ufrag.lock().unwrap().as_deref(), Some("local-ufrag"));
    }

    #[test]
    fn identity_is_stable_for_same_port() {
        let config = Config::default();
        let a = TcpListenerHarvester::new(
            Arc::new(AddressInventory::new(config.clone()).unwrap()),
            Arc::new(BindingTable::new()),
            TcpListenerHarvesterConfig::default(),
        );
        let b = TcpListenerHarvester::new(
            Arc::new(AddressInventory::new(config).unwrap()),
            Arc::new(BindingTable::new()),
            TcpListenerHarvesterConfig::default(),
        );
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn dropped_component_is_tombstoned_from_registry() {
        let inner = Arc::new(TcpListenerInner {
            inventory: Arc::new(AddressInventory::new(Config::default()).unwrap()),
            bindings: Arc::new(BindingTable::new()),
            config: TcpListenerHarvesterConfig::default(),
            registry: Mutex::new(HashMap::new()),
            started: Mutex::new(HashSet::new()),
        });

        {
            let component: Arc<dyn ComponentSink> = Arc::new(Component::new(1, "ufrag", 1));
            inner.registry.lock().insert("ufrag".to_string(), Arc::downgrade(&component));
            assert!(inner.lookup("ufrag").is_some());
        }

        assert!(inner.lookup("ufrag").is_none());
    }
}

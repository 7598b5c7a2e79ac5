//! Peer roster and connection lifecycle.
//!
//! The manager owns the table of known peers, keyed by normalized onion
//! address. For each connected peer it holds the sending half of the
//! encrypted channel and runs one receiver task; received `MSG` frames and
//! connection state changes are delivered to the application through a
//! bounded event queue rather than callbacks, so the shell drains events
//! on its own schedule.
//!
//! Errors on a peer never poison the manager: the receiver or send path
//! catches them, marks the peer disconnected, emits a status event, and
//! moves on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::guard::PrivacyGuard;
use crate::identity::Identity;
use crate::overlay::{IncomingConnection, OverlayService};
use crate::protocol::channel::{BoxedTransport, ChannelReceiver, ChannelSender};
use crate::protocol::framing::TYPE_MSG;
use crate::protocol::handshake::{Handshake, HandshakeOutcome};

/// Depth of the application event queue.
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// Name of the encrypted roster blob inside the guard's store.
const ROSTER_FILE: &str = "contacts.dat";

/// Connection state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No channel.
    Disconnected,
    /// Dial or handshake in progress.
    Handshaking,
    /// Channel up; messages flow.
    Connected,
    /// The last attempt failed.
    Failed,
}

/// Events the application drains from the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A chat message arrived from a peer.
    Message {
        /// Normalized address of the sender.
        address: String,
        /// Message text, already unpadded.
        text: String,
    },
    /// A peer connected or disconnected.
    ConnectionStatus {
        /// Normalized address of the peer.
        address: String,
        /// True on connect, false on disconnect or failure.
        connected: bool,
    },
}

/// Read-only snapshot of one peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Normalized onion address.
    pub address: String,
    /// Optional human name.
    pub name: Option<String>,
    /// Connection state at snapshot time.
    pub state: PeerState,
    /// When the last frame arrived, if any.
    pub last_seen: Option<Instant>,
    /// The peer's identity key, once a handshake has completed.
    pub identity: Option<[u8; 32]>,
}

impl PeerInfo {
    /// Name if set, otherwise a shortened address.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => crate::overlay::shorten_onion(&self.address),
        }
    }
}

/// Roster entry as persisted through the encrypted store.
#[derive(Serialize, Deserialize)]
struct StoredPeer {
    address: String,
    name: Option<String>,
}

/// Live state of one peer.
#[derive(Default)]
struct PeerEntry {
    name: Option<String>,
    state: PeerStateCell,
    last_seen: Option<Instant>,
    identity: Option<[u8; 32]>,
    sender: Option<Arc<tokio::sync::Mutex<ChannelSender>>>,
    receiver_task: Option<JoinHandle<()>>,
}

struct PeerStateCell(PeerState);

impl Default for PeerStateCell {
    fn default() -> Self {
        Self(PeerState::Disconnected)
    }
}

struct Shared {
    identity: Arc<Identity>,
    guard: Arc<PrivacyGuard>,
    overlay: Arc<OverlayService>,
    sign_transcript: bool,
    peers: RwLock<HashMap<String, PeerEntry>>,
    events: mpsc::Sender<PeerEvent>,
}

/// Roster of peers and their connection lifecycles.
pub struct PeerManager {
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    /// Build a manager over the overlay, identity, and privacy guard.
    pub fn new(
        overlay: Arc<OverlayService>,
        identity: Arc<Identity>,
        guard: Arc<PrivacyGuard>,
        sign_transcript: bool,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        Self {
            shared: Arc::new(Shared {
                identity,
                guard,
                overlay,
                sign_transcript,
                peers: RwLock::new(HashMap::new()),
                events: events_tx,
            }),
            events_rx: Mutex::new(Some(events_rx)),
            inbound_task: Mutex::new(None),
        }
    }

    /// Take the event queue. The application drains this.
    pub fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.events_rx.lock().expect("events lock poisoned").take()
    }

    /// Start draining inbound sockets from the overlay service.
    ///
    /// Each accepted socket gets a responder handshake on its own task.
    pub fn start(&self) {
        let Some(mut incoming) = self.shared.overlay.take_incoming() else {
            return;
        };
        let shared = Arc::clone(&self.shared);

        let task = tokio::spawn(async move {
            while let Some(conn) = incoming.recv().await {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = Shared::handle_incoming(shared, conn).await {
                        debug!("inbound handshake failed: {e}");
                    }
                });
            }
        });

        *self.inbound_task.lock().expect("inbound lock poisoned") = Some(task);
    }

    /// Add a peer to the roster, or update its name.
    pub fn add(&self, address: &str, name: Option<&str>) -> PeerInfo {
        let address = normalize_address(address);
        let mut peers = self.shared.peers.write().expect("peer table poisoned");
        let entry = peers.entry(address.clone()).or_default();
        if let Some(name) = name {
            entry.name = Some(name.to_string());
        }
        snapshot(&address, entry)
    }

    /// Snapshot one peer.
    pub fn peer(&self, address: &str) -> Option<PeerInfo> {
        let address = normalize_address(address);
        let peers = self.shared.peers.read().expect("peer table poisoned");
        peers.get(&address).map(|entry| snapshot(&address, entry))
    }

    /// Snapshot the whole roster.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.shared.peers.read().expect("peer table poisoned");
        peers
            .iter()
            .map(|(address, entry)| snapshot(address, entry))
            .collect()
    }

    /// Dial a peer through the overlay and run the initiator handshake.
    ///
    /// The peer is added to the roster if unknown. On failure the peer is
    /// marked [`PeerState::Failed`], a disconnected status event fires,
    /// and the error is returned.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let address = normalize_address(address);
        self.shared.set_state(&address, PeerState::Handshaking);

        let result = async {
            let transport = self.shared.overlay.dial(&address).await?;
            let mut handshake =
                Handshake::new(Arc::clone(&self.shared.identity), self.shared.sign_transcript);
            handshake.initiate(transport).await
        }
        .await;

        match result {
            Ok(outcome) => {
                Shared::install(Arc::clone(&self.shared), &address, outcome).await;
                Ok(())
            }
            Err(e) => {
                warn!(peer = %address, "connect failed: {e}");
                self.shared.set_state(&address, PeerState::Failed);
                self.shared.emit_status(&address, false).await;
                Err(e)
            }
        }
    }

    /// Run the initiator handshake over an already-established transport.
    ///
    /// Loopback path for offline mode and tests; `connect` is this plus
    /// the overlay dial.
    pub async fn connect_transport(&self, address: &str, transport: BoxedTransport) -> Result<()> {
        let address = normalize_address(address);
        self.shared.set_state(&address, PeerState::Handshaking);

        let mut handshake =
            Handshake::new(Arc::clone(&self.shared.identity), self.shared.sign_transcript);
        match handshake.initiate(transport).await {
            Ok(outcome) => {
                Shared::install(Arc::clone(&self.shared), &address, outcome).await;
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(&address, PeerState::Failed);
                self.shared.emit_status(&address, false).await;
                Err(e)
            }
        }
    }

    /// Run the responder handshake over an inbound transport.
    ///
    /// The peer is keyed by `peer_hint` when its address is not already
    /// known; the overlay cannot see through its own anonymity, so the
    /// hint is best-effort.
    pub async fn attach_incoming(&self, transport: BoxedTransport, peer_hint: &str) -> Result<()> {
        Shared::handle_incoming(
            Arc::clone(&self.shared),
            IncomingConnection {
                transport,
                peer_hint: peer_hint.to_string(),
            },
        )
        .await
    }

    /// Pad, jitter, and send a message to a connected peer.
    ///
    /// Returns false when the peer is unknown or not connected, or when
    /// the send fails (in which case the peer is marked disconnected).
    pub async fn send(&self, address: &str, text: &str) -> bool {
        let address = normalize_address(address);

        let sender = {
            let peers = self.shared.peers.read().expect("peer table poisoned");
            match peers.get(&address) {
                Some(entry) if entry.state.0 == PeerState::Connected => entry.sender.clone(),
                _ => None,
            }
        };
        let Some(sender) = sender else {
            return false;
        };

        let payload = self.shared.guard.pad_message(text);
        let delay = self.shared.guard.random_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = sender.lock().await.send(TYPE_MSG, payload.as_bytes()).await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %address, "send failed: {e}");
                if self.shared.mark_disconnected(&address) {
                    self.shared.emit_status(&address, false).await;
                }
                false
            }
        }
    }

    /// Close a peer's channel. The roster entry remains.
    pub async fn disconnect(&self, address: &str) {
        let address = normalize_address(address);
        if Shared::teardown(&self.shared, &address).await {
            self.shared.emit_status(&address, false).await;
        }
    }

    /// Disconnect a peer and drop it from the roster.
    pub async fn remove(&self, address: &str) {
        let address = normalize_address(address);
        self.disconnect(&address).await;
        self.shared
            .peers
            .write()
            .expect("peer table poisoned")
            .remove(&address);
    }

    /// Close every channel and stop draining inbound sockets.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inbound_task.lock().expect("inbound lock poisoned").take() {
            task.abort();
        }

        let addresses: Vec<String> = {
            let peers = self.shared.peers.read().expect("peer table poisoned");
            peers.keys().cloned().collect()
        };
        for address in addresses {
            Shared::teardown(&self.shared, &address).await;
        }
        info!("peer manager shut down");
    }

    /// Persist the roster through the guard's encrypted store.
    pub fn save_roster(&self) -> Result<()> {
        let stored: Vec<StoredPeer> = {
            let peers = self.shared.peers.read().expect("peer table poisoned");
            peers
                .iter()
                .map(|(address, entry)| StoredPeer {
                    address: address.clone(),
                    name: entry.name.clone(),
                })
                .collect()
        };

        let blob = serde_json::to_vec(&stored)
            .map_err(|e| Error::Protocol(format!("roster serialization failed: {e}")))?;
        self.shared.guard.save(ROSTER_FILE, &blob)
    }

    /// Restore a roster saved with [`PeerManager::save_roster`].
    ///
    /// Returns the number of peers loaded; zero when nothing was stored.
    pub fn load_roster(&self) -> Result<usize> {
        let Some(blob) = self.shared.guard.load(ROSTER_FILE)? else {
            return Ok(0);
        };
        let stored: Vec<StoredPeer> = serde_json::from_slice(&blob)
            .map_err(|e| Error::Protocol(format!("roster deserialization failed: {e}")))?;

        let count = stored.len();
        for peer in stored {
            self.add(&peer.address, peer.name.as_deref());
        }
        Ok(count)
    }
}

impl Shared {
    /// Responder side of an inbound socket.
    async fn handle_incoming(shared: Arc<Self>, conn: IncomingConnection) -> Result<()> {
        let mut handshake = Handshake::new(Arc::clone(&shared.identity), shared.sign_transcript);
        let outcome = handshake.respond(conn.transport).await?;

        let address = normalize_address(&conn.peer_hint);
        Self::install(shared, &address, outcome).await;
        Ok(())
    }

    /// Wire a completed handshake into the roster and start its receiver.
    async fn install(shared: Arc<Self>, address: &str, outcome: HandshakeOutcome) {
        // One channel per peer: any previous channel goes down first.
        Self::teardown(&shared, address).await;

        let (sender, receiver) = outcome.channel.into_split();
        let sender = Arc::new(tokio::sync::Mutex::new(sender));

        {
            let mut peers = shared.peers.write().expect("peer table poisoned");
            let entry = peers.entry(address.to_string()).or_default();
            entry.state = PeerStateCell(PeerState::Connected);
            entry.last_seen = Some(Instant::now());
            entry.identity = Some(outcome.peer_identity);
            entry.sender = Some(sender);
        }

        info!(peer = %address, "peer connected");
        shared.emit_status(address, true).await;

        // Entry and status event are in place; frames may now flow.
        let task = tokio::spawn(Self::receiver_loop(
            Arc::clone(&shared),
            address.to_string(),
            receiver,
        ));
        let mut peers = shared.peers.write().expect("peer table poisoned");
        if let Some(entry) = peers.get_mut(address) {
            entry.receiver_task = Some(task);
        }
    }

    /// Per-peer receive loop: runs until error, EOF, or local close.
    async fn receiver_loop(shared: Arc<Self>, address: String, mut receiver: ChannelReceiver) {
        loop {
            match receiver.receive().await {
                Ok(frame) => {
                    shared.touch(&address);
                    if frame.frame_type == TYPE_MSG {
                        let text = match frame.text() {
                            Ok(text) => shared.guard.unpad_message(text),
                            Err(e) => {
                                debug!(peer = %address, "dropping non-UTF-8 message: {e}");
                                continue;
                            }
                        };
                        let event = PeerEvent::Message {
                            address: address.clone(),
                            text,
                        };
                        if shared.events.send(event).await.is_err() {
                            break;
                        }
                    } else {
                        debug!(peer = %address, frame_type = %frame.frame_type, "ignoring frame");
                    }
                }
                Err(Error::Closed) => break,
                Err(e) => {
                    debug!(peer = %address, "receive ended: {e}");
                    break;
                }
            }
        }

        // Only report the transition if nobody else already did.
        if shared.mark_disconnected(&address) {
            shared.emit_status(&address, false).await;
        }
    }

    /// Close and clear a peer's channel. True if a channel was up.
    async fn teardown(shared: &Arc<Self>, address: &str) -> bool {
        let (sender, task, was_connected) = {
            let mut peers = shared.peers.write().expect("peer table poisoned");
            match peers.get_mut(address) {
                Some(entry) => {
                    let was_connected = entry.state.0 == PeerState::Connected;
                    entry.state = PeerStateCell(PeerState::Disconnected);
                    (entry.sender.take(), entry.receiver_task.take(), was_connected)
                }
                None => (None, None, false),
            }
        };

        if let Some(sender) = sender {
            // Zeroizes the session key and wakes the receiver task.
            if let Err(e) = sender.lock().await.close().await {
                debug!(peer = %address, "close failed: {e}");
            }
        }
        if let Some(task) = task {
            // The close flag stops the task within one read; the abort is
            // a backstop for a transport that never returns.
            task.abort();
        }

        was_connected
    }

    fn set_state(&self, address: &str, state: PeerState) {
        let mut peers = self.peers.write().expect("peer table poisoned");
        let entry = peers.entry(address.to_string()).or_default();
        entry.state = PeerStateCell(state);
    }

    /// Flip a connected peer to disconnected. True if this call did it.
    fn mark_disconnected(&self, address: &str) -> bool {
        let mut peers = self.peers.write().expect("peer table poisoned");
        match peers.get_mut(address) {
            Some(entry) if entry.state.0 == PeerState::Connected => {
                entry.state = PeerStateCell(PeerState::Disconnected);
                entry.sender = None;
                true
            }
            _ => false,
        }
    }

    fn touch(&self, address: &str) {
        let mut peers = self.peers.write().expect("peer table poisoned");
        if let Some(entry) = peers.get_mut(address) {
            entry.last_seen = Some(Instant::now());
        }
    }

    async fn emit_status(&self, address: &str, connected: bool) {
        let event = PeerEvent::ConnectionStatus {
            address: address.to_string(),
            connected,
        };
        let _ = self.events.send(event).await;
    }
}

fn snapshot(address: &str, entry: &PeerEntry) -> PeerInfo {
    PeerInfo {
        address: address.to_string(),
        name: entry.name.clone(),
        state: entry.state.0,
        last_seen: entry.last_seen,
        identity: entry.identity,
    }
}

/// Canonical form of an overlay address: trimmed, lowercased, with the
/// `.onion` suffix. Addresses are only ever compared normalized.
pub fn normalize_address(address: &str) -> String {
    let mut address = address.trim().to_lowercase();
    if !address.ends_with(".onion") {
        address.push_str(".onion");
    }
    address
}

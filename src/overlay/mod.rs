//! Overlay service supervisor.
//!
//! Owns the local inbound listener, publishes the hidden-service mapping
//! through the daemon's control endpoint, and dials peers through the
//! local SOCKS5 proxy. Observable state (onion address, status text,
//! progress) is broadcast on a watch channel; accepted sockets are handed
//! to the peer manager through an mpsc queue.
//!
//! Offline mode skips the overlay bootstrap entirely: a plausible address
//! is fabricated for display and the listener still binds locally, so
//! loopback testing works without a running daemon.

mod control;
mod socks;

pub use control::ControlConnection;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::protocol::channel::BoxedTransport;

/// Port the local listener binds and the hidden service maps to.
pub const DEFAULT_HIDDEN_SERVICE_PORT: u16 = 9878;

/// Deadline for an outbound dial through the proxy.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Base32 alphabet onion addresses are drawn from.
const ONION_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Depth of the inbound-socket handoff queue.
const INCOMING_QUEUE_DEPTH: usize = 32;

/// Overlay supervisor configuration.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Local port the inbound listener binds. Zero lets the OS pick.
    pub listen_port: u16,
    /// External virtual port of the hidden service.
    pub virtual_port: u16,
    /// Address of the daemon's SOCKS5 proxy.
    pub socks_addr: SocketAddr,
    /// Address of the daemon's control endpoint.
    pub control_addr: SocketAddr,
    /// Cookie file override; by default the daemon is asked for the path.
    pub control_cookie: Option<PathBuf>,
    /// Skip the overlay and fabricate an address.
    pub offline_mode: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_HIDDEN_SERVICE_PORT,
            virtual_port: DEFAULT_HIDDEN_SERVICE_PORT,
            socks_addr: ([127, 0, 0, 1], 9050).into(),
            control_addr: ([127, 0, 0, 1], 9051).into(),
            control_cookie: None,
            offline_mode: false,
        }
    }
}

/// Observable overlay state, delivered through a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStatus {
    /// Our published (or fabricated) onion address.
    pub onion_address: Option<String>,
    /// Human-readable progress line.
    pub status_message: String,
    /// Whether the service is up and reachable.
    pub connected: bool,
    /// Bootstrap progress in `[0, 1]`.
    pub progress: f64,
}

impl Default for OverlayStatus {
    fn default() -> Self {
        Self {
            onion_address: None,
            status_message: "Initializing...".into(),
            connected: false,
            progress: 0.0,
        }
    }
}

/// An accepted inbound socket, on its way to the peer manager.
pub struct IncomingConnection {
    /// The raw transport; the handshake has not run yet.
    pub transport: BoxedTransport,
    /// Best-effort peer address, as much as the transport knows.
    pub peer_hint: String,
}

/// Lifecycle supervisor for the hidden-service endpoint.
pub struct OverlayService {
    config: OverlayConfig,
    running: Arc<AtomicBool>,
    status_tx: watch::Sender<OverlayStatus>,
    incoming_tx: mpsc::Sender<IncomingConnection>,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingConnection>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    control: tokio::sync::Mutex<Option<ControlConnection>>,
}

impl OverlayService {
    /// Build an unstarted service.
    pub fn new(config: OverlayConfig) -> Self {
        let (status_tx, _) = watch::channel(OverlayStatus::default());
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);

        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            status_tx,
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            control: tokio::sync::Mutex::new(None),
        }
    }

    /// Watch the observable state.
    pub fn subscribe(&self) -> watch::Receiver<OverlayStatus> {
        self.status_tx.subscribe()
    }

    /// Current snapshot of the observable state.
    pub fn status(&self) -> OverlayStatus {
        self.status_tx.borrow().clone()
    }

    /// Take the inbound-socket queue. The peer manager drains this.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<IncomingConnection>> {
        self.incoming_rx.lock().expect("incoming lock poisoned").take()
    }

    /// Where the local listener actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr lock poisoned")
    }

    /// Our published onion address, once known.
    pub fn onion_address(&self) -> Option<String> {
        self.status_tx.borrow().onion_address.clone()
    }

    /// Bind the listener, publish the hidden service (or fabricate one in
    /// offline mode), and start accepting.
    pub async fn start(&self) -> Result<()> {
        if self.config.offline_mode {
            return self.start_offline().await;
        }

        self.update(|s| {
            s.status_message = "Starting hidden service...".into();
            s.progress = 0.05;
        });

        let listener = self.bind_listener().await?;
        let local_port = self
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.listen_port);

        self.update(|s| {
            s.status_message = "Authenticating to control endpoint...".into();
            s.progress = 0.3;
        });
        let mut control = ControlConnection::connect(
            self.config.control_addr,
            self.config.control_cookie.as_deref(),
        )
        .await?;

        self.update(|s| {
            s.status_message = "Publishing hidden service...".into();
            s.progress = 0.6;
        });
        let onion = control
            .publish_hidden_service(self.config.virtual_port, local_port)
            .await?;
        *self.control.lock().await = Some(control);

        info!(onion = %onion, "hidden service published");
        self.update(|s| {
            s.status_message = format!("Connected - {}", shorten_onion(&onion));
            s.onion_address = Some(onion);
            s.connected = true;
            s.progress = 1.0;
        });

        self.spawn_accept_loop(listener);
        Ok(())
    }

    /// Offline bootstrap: staged progress, fabricated address, local
    /// listener only.
    async fn start_offline(&self) -> Result<()> {
        self.update(|s| {
            s.status_message = "Starting in offline mode...".into();
            s.progress = 0.3;
        });
        tokio::time::sleep(Duration::from_millis(150)).await;

        self.update(|s| {
            s.status_message = "Generating identity...".into();
            s.progress = 0.6;
        });
        let onion = fabricate_onion();
        tokio::time::sleep(Duration::from_millis(150)).await;

        self.update(|s| {
            s.status_message = "Setting up local listener...".into();
            s.progress = 0.8;
        });
        let listener = self.bind_listener().await?;

        info!(onion = %onion, "offline mode ready");
        self.update(|s| {
            s.status_message = format!("OFFLINE MODE - {}", shorten_onion(&onion));
            s.onion_address = Some(onion);
            s.connected = true;
            s.progress = 1.0;
        });

        self.spawn_accept_loop(listener);
        Ok(())
    }

    async fn bind_listener(&self) -> Result<TcpListener> {
        let listener =
            TcpListener::bind(("127.0.0.1", self.config.listen_port)).await?;
        *self.local_addr.lock().expect("local addr lock poisoned") =
            Some(listener.local_addr()?);
        Ok(listener)
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let incoming_tx = self.incoming_tx.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let conn = IncomingConnection {
                            transport: Box::new(stream),
                            peer_hint: addr.to_string(),
                        };
                        if incoming_tx.send(conn).await.is_err() {
                            // Manager went away; nothing left to accept for.
                            break;
                        }
                    }
                    Err(e) => {
                        if running.load(Ordering::Acquire) {
                            warn!("accept failed: {e}");
                        } else {
                            break;
                        }
                    }
                }
            }
        });

        *self.accept_task.lock().expect("accept task lock poisoned") = Some(task);
    }

    /// Dial a peer through the SOCKS5 proxy, 60-second deadline.
    ///
    /// In offline mode the dial goes straight to the local listener, so
    /// two offline instances on one machine can talk over loopback.
    pub async fn dial(&self, peer_addr: &str) -> Result<BoxedTransport> {
        self.update(|s| {
            s.status_message = format!("Connecting to {}...", shorten_onion(peer_addr));
        });

        let result = if self.config.offline_mode {
            let port = self
                .local_addr()
                .map(|a| a.port())
                .unwrap_or(self.config.listen_port);
            tokio::time::timeout(
                DIAL_TIMEOUT,
                tokio::net::TcpStream::connect(("127.0.0.1", port)),
            )
            .await
            .map(|r| r.map_err(Error::Io))
        } else {
            tokio::time::timeout(
                DIAL_TIMEOUT,
                socks::connect(self.config.socks_addr, peer_addr, self.config.virtual_port),
            )
            .await
        };

        match result {
            Ok(Ok(stream)) => {
                self.update(|s| {
                    s.status_message = format!("Connected to {}", shorten_onion(peer_addr));
                });
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout("dial")),
        }
    }

    /// Abort an in-progress bootstrap or connection attempt.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::Release);
        self.update(|s| {
            s.status_message = "Connection cancelled".into();
            s.connected = false;
            s.progress = 0.0;
        });
    }

    /// Stop accepting, tear the hidden service down, and go quiet.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);

        if let Some(task) = self
            .accept_task
            .lock()
            .expect("accept task lock poisoned")
            .take()
        {
            task.abort();
        }

        if let Some(mut control) = self.control.lock().await.take() {
            if let Err(e) = control.remove_hidden_service().await {
                warn!("hidden service teardown failed: {e}");
            }
        }

        self.update(|s| {
            s.status_message = "Disconnected".into();
            s.onion_address = None;
            s.connected = false;
            s.progress = 0.0;
        });
    }

    fn update(&self, mutate: impl FnOnce(&mut OverlayStatus)) {
        self.status_tx.send_modify(mutate);
    }
}

/// Fabricate a plausible v3-style onion address for offline display.
fn fabricate_onion() -> String {
    let mut addr = String::with_capacity(62);
    for _ in 0..56 {
        addr.push(ONION_ALPHABET[OsRng.gen_range(0..ONION_ALPHABET.len())] as char);
    }
    addr.push_str(".onion");
    addr
}

/// Abbreviate an onion address for status lines.
pub fn shorten_onion(onion: &str) -> String {
    if onion.len() < 16 {
        return onion.to_string();
    }
    format!("{}...{}", &onion[..8], &onion[onion.len() - 8..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn offline_config() -> OverlayConfig {
        OverlayConfig {
            listen_port: 0,
            offline_mode: true,
            ..OverlayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_offline_start_fabricates_address() {
        let service = OverlayService::new(offline_config());
        service.start().await.unwrap();

        let status = service.status();
        assert!(status.connected);
        assert_eq!(status.progress, 1.0);

        let onion = status.onion_address.unwrap();
        assert_eq!(onion.len(), 62);
        assert!(onion.ends_with(".onion"));
        assert!(onion[..56]
            .bytes()
            .all(|b| ONION_ALPHABET.contains(&b)));

        service.stop().await;
        assert!(!service.status().connected);
    }

    #[tokio::test]
    async fn test_offline_loopback_accept() {
        let service = OverlayService::new(offline_config());
        let mut incoming = service.take_incoming().unwrap();
        service.start().await.unwrap();

        let mut outbound = service.dial("anything.onion").await.unwrap();
        outbound.write_all(b"ping").await.unwrap();

        let mut accepted = incoming.recv().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        service.stop().await;
    }

    #[tokio::test]
    async fn test_status_watch_progresses() {
        let service = OverlayService::new(offline_config());
        let watch = service.subscribe();

        service.start().await.unwrap();

        let final_status = watch.borrow().clone();
        assert!(final_status.connected);
        assert!(final_status.status_message.starts_with("OFFLINE MODE"));

        service.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_resets_status() {
        let service = OverlayService::new(offline_config());
        service.start().await.unwrap();

        service.cancel();
        let status = service.status();
        assert!(!status.connected);
        assert_eq!(status.progress, 0.0);
    }

    #[test]
    fn test_shorten_onion() {
        assert_eq!(shorten_onion("short.onion"), "short.onion");
        let long = format!("{}.onion", "a".repeat(56));
        let short = shorten_onion(&long);
        assert!(short.starts_with("aaaaaaaa"));
        assert!(short.contains("..."));
    }
}

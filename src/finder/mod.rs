// ABOUTME: The Encode Server Finder: maintains the live set of remote workers
// ABOUTME: A search task solicits and ages out servers; a listen task records replies as they arrive

use crate::config::{
    resolve_host, BATCH_SERVER_PRESENCE_PORT, ConfigHandle, HELLO_PORT, HELLO_TOKEN,
    MAIN_SERVER_PRESENCE_PORT, SEARCH_INTERVAL_SECS,
};
use crate::error::NetworkError;
use crate::frame::read_server_available;
use crate::socket::Socket;
use crate::types::ServerDescription;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Which presence port this finder listens on, matching whether the caller
/// is a full interactive player (main) or an unattended batch converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderRole {
    Main,
    Batch,
}

impl FinderRole {
    fn presence_port(self) -> u16 {
        match self {
            FinderRole::Main => MAIN_SERVER_PRESENCE_PORT,
            FinderRole::Batch => BATCH_SERVER_PRESENCE_PORT,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FinderEvent {
    ServersListChanged,
}

/// A server is considered gone once it's been silent for more than twice
/// the search interval.
fn stale_after_secs() -> u64 {
    2 * SEARCH_INTERVAL_SECS
}

pub struct EncodeServerFinder {
    role: FinderRole,
    config: ConfigHandle,
    servers: Arc<Mutex<HashMap<String, ServerDescription>>>,
    events: broadcast::Sender<FinderEvent>,
    terminating: Arc<AtomicBool>,
}

impl EncodeServerFinder {
    pub fn new(role: FinderRole, config: ConfigHandle) -> Self {
        let (events, _rx) = broadcast::channel(32);
        Self {
            role,
            config,
            servers: Arc::new(Mutex::new(HashMap::new())),
            events,
            terminating: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FinderEvent> {
        self.events.subscribe()
    }

    pub async fn servers(&self) -> Vec<ServerDescription> {
        self.servers.lock().await.values().cloned().collect()
    }

    pub fn shutdown(&self) {
        self.terminating.store(true, Ordering::SeqCst);
    }

    fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Relaxed)
    }

    pub async fn run(&self) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(("0.0.0.0", self.role.presence_port())).await?;
        let udp = UdpSocket::bind(("0.0.0.0", 0)).await?;
        udp.set_broadcast(true)?;

        info!(role = ?self.role, "encode server finder starting");

        tokio::join!(self.search_loop(udp), self.listen_loop(listener));
        Ok(())
    }

    async fn search_loop(&self, udp: UdpSocket) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(SEARCH_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if self.is_terminating() {
                break;
            }
            self.broadcast_hello(&udp).await;
            self.probe_explicit_servers(&udp).await;
            self.evict_stale_servers().await;
        }
    }

    async fn broadcast_hello(&self, udp: &UdpSocket) {
        if !self.config.current().use_any_servers {
            return;
        }
        let addr = (std::net::Ipv4Addr::BROADCAST, HELLO_PORT);
        if let Err(e) = udp.send_to(HELLO_TOKEN.as_bytes(), addr).await {
            warn!(error = %e, "broadcast hello failed");
        }
    }

    async fn probe_explicit_servers(&self, udp: &UdpSocket) {
        for host in &self.config.current().explicit_servers {
            let Some(ip) = resolve_host(host) else {
                warn!(host, "could not resolve explicit server");
                continue;
            };
            if let Err(e) = udp.send_to(HELLO_TOKEN.as_bytes(), (ip, HELLO_PORT)).await {
                warn!(host, error = %e, "unicast hello failed");
            }
        }
    }

    async fn evict_stale_servers(&self) {
        let mut servers = self.servers.lock().await;
        let before = servers.len();
        servers.retain(|_, desc| desc.last_seen_secs() <= stale_after_secs());
        if servers.len() != before {
            debug!(removed = before - servers.len(), "evicted stale servers");
            let _ = self.events.send(FinderEvent::ServersListChanged);
        }
    }

    async fn listen_loop(&self, listener: TcpListener) {
        loop {
            if self.is_terminating() {
                break;
            }
            let accepted = tokio::time::timeout(
                std::time::Duration::from_millis(200),
                listener.accept(),
            )
            .await;
            let (stream, peer) = match accepted {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!(error = %e, "presence accept failed");
                    continue;
                }
                Err(_timeout) => continue,
            };
            let mut socket = Socket::new(stream);
            match read_server_available(&mut socket).await {
                Ok(reply) => self.record_server(peer.ip().to_string(), reply).await,
                Err(e) => warn!(%peer, error = %e, "malformed ServerAvailable reply"),
            }
        }
    }

    async fn record_server(&self, host: String, reply: crate::frame::ServerAvailableXml) {
        let mut servers = self.servers.lock().await;
        match servers.get_mut(&host) {
            Some(existing) => {
                existing.threads = reply.threads;
                existing.protocol_version = reply.link_version;
                existing.touch();
            }
            None => {
                servers.insert(
                    host.clone(),
                    ServerDescription::new(host, reply.threads, reply.link_version),
                );
                let _ = self.events.send(FinderEvent::ServersListChanged);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;
    use crate::frame::ServerAvailableXml;

    #[tokio::test]
    async fn recording_a_new_server_emits_an_event() {
        let finder = EncodeServerFinder::new(FinderRole::Main, ConfigHandle::new(ConfigSnapshot::default()));
        let mut events = finder.subscribe();

        finder
            .record_server(
                "10.0.0.5".to_string(),
                ServerAvailableXml {
                    link_version: 2,
                    threads: 4,
                },
            )
            .await;

        assert_eq!(finder.servers().await.len(), 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            FinderEvent::ServersListChanged
        ));
    }

    #[tokio::test]
    async fn repeated_reply_from_known_server_does_not_emit_again() {
        let finder = EncodeServerFinder::new(FinderRole::Main, ConfigHandle::new(ConfigSnapshot::default()));
        let mut events = finder.subscribe();

        let reply = ServerAvailableXml {
            link_version: 2,
            threads: 4,
        };
        finder.record_server("10.0.0.5".to_string(), reply).await;
        events.try_recv().unwrap();

        finder.record_server("10.0.0.5".to_string(), reply).await;
        assert!(events.try_recv().is_err());
        assert_eq!(finder.servers().await.len(), 1);
    }
}

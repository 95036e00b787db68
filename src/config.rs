// ABOUTME: Process-wide configuration snapshot, replacing the original's Config::instance() singleton
// ABOUTME: Distributed via a watch channel so components re-read on change rather than holding a lock

use std::net::IpAddr;
use tokio::sync::watch;

/// Inputs to the worker-pool scheduler.
///
/// This is the Rust analogue of `Config::instance()` in the original: rather
/// than a global singleton, callers are handed a `ConfigHandle` at
/// construction and subscribe to changes explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// Number of local CPU worker threads to run (`master_encoder_threads`).
    pub master_encoder_threads: usize,
    /// If true, no local CPU threads are started regardless of `master_encoder_threads`.
    pub only_servers_encode: bool,
    /// If true, GPU-offload threads are used instead of CPU threads.
    pub gpu_enabled: bool,
    /// If true, broadcast for any server on the LAN; otherwise only `explicit_servers` are probed.
    pub use_any_servers: bool,
    /// Hosts configured explicitly (queried directly by the finder, regardless of `use_any_servers`).
    pub explicit_servers: Vec<String>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            master_encoder_threads: 1,
            only_servers_encode: false,
            gpu_enabled: false,
            use_any_servers: true,
            explicit_servers: Vec::new(),
        }
    }
}

/// A shared, observable configuration handle.
///
/// Cloning a `ConfigHandle` is cheap; every clone observes the same
/// underlying value. Components subscribe with [`ConfigHandle::subscribe`]
/// and poll `changed()` on the returned receiver, rather than holding any
/// lock while they work.
#[derive(Clone)]
pub struct ConfigHandle {
    sender: std::sync::Arc<watch::Sender<ConfigSnapshot>>,
}

impl ConfigHandle {
    pub fn new(initial: ConfigSnapshot) -> Self {
        let (sender, _receiver) = watch::channel(initial);
        Self {
            sender: std::sync::Arc::new(sender),
        }
    }

    pub fn current(&self) -> ConfigSnapshot {
        self.sender.borrow().clone()
    }

    pub fn set(&self, snapshot: ConfigSnapshot) {
        // `send` only errors if there are no receivers left, which is fine:
        // the next `current()` caller will still see the new value.
        let _ = self.sender.send(snapshot);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigSnapshot> {
        self.sender.subscribe()
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(ConfigSnapshot::default())
    }
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("current", &self.current())
            .finish()
    }
}

/// Fixed network ports. Implementer-chosen literal values.
pub const HELLO_PORT: u16 = 6504;
pub const ENCODE_FRAME_PORT: u16 = 6503;
pub const MAIN_SERVER_PRESENCE_PORT: u16 = 6510;
pub const BATCH_SERVER_PRESENCE_PORT: u16 = 6511;

/// Current wire protocol version; a remote worker is only dispatched to if
/// its reported version equals this.
pub const SERVER_LINK_VERSION: i32 = 2;

/// UDP hello payload used to solicit a `ServerAvailable` reply.
/// Treated as an opaque byte string; any other payload is ignored.
pub const HELLO_TOKEN: &str = "dcp-encode-engine hello";

/// Search interval used by the Encode Server Finder.
pub const SEARCH_INTERVAL_SECS: u64 = 10;

pub fn resolve_host(host: &str) -> Option<IpAddr> {
    use std::net::ToSocketAddrs;
    (host, 0u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .map(|addr| addr.ip())
}

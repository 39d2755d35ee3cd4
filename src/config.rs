use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{MAX_OUTSTANDING_CONNECTIONS, MAX_REQUEST_SIZE_BYTES};

const DEFAULT_PORT: u16 = 10105;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_COMPLETER_THREADS: usize = 10;

/// The http handler configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// If specified, the bound port is reported to this file once the
    /// listener is up. Useful when binding to port 0.
    pub port_file_path: Option<PathBuf>,
    /// Advertised address of this node, stamped into every request.
    pub server_ip: IpAddr,
    /// Charset advertised on plaintext validation responses.
    pub charset: String,
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub max_request_size_bytes: u64,
    /// Threads of the pool on which processors may schedule deferred
    /// completion.
    pub completer_threads: usize,
    /// Serve TLS when a TLS acceptor was supplied at construction.
    pub use_tls: bool,
}

impl Config {
    pub(crate) fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            port_file_path: None,
            server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            charset: "utf-8".to_owned(),
            max_connections: MAX_OUTSTANDING_CONNECTIONS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_request_size_bytes: MAX_REQUEST_SIZE_BYTES.get_bytes() as u64,
            completer_threads: DEFAULT_COMPLETER_THREADS,
            use_tls: false,
        }
    }
}

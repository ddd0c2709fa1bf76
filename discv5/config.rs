use std::net::SocketAddr;

use clap::Parser;

use crate::node::Enr;

/// Tunables recognized by the discv5 core.
///
/// Mirrors the teacher's `clap`-derived network configuration: every field
/// doubles as a CLI flag and an environment variable, so the thin binary
/// adapter around this crate needs no separate parsing layer.
#[derive(Debug, Clone, Parser)]
#[command(name = "discv5", about = "Discovery v5 node configuration")]
pub struct Discv5Config {
    /// UDP socket(s) to bind at start. At least one of IPv4/IPv6.
    #[arg(long = "listen-addr", env = "DISCV5_LISTEN_ADDR", num_args = 1..)]
    pub listen_addrs: Vec<SocketAddr>,

    /// ENRs to seed the routing table with at start.
    #[arg(skip)]
    pub bootstrap_enrs: Vec<Enr>,

    /// Timeout for an outstanding request, in milliseconds.
    #[arg(long, env = "DISCV5_REQUEST_TIMEOUT_MS", default_value_t = 1_000)]
    pub request_timeout_ms: u64,

    /// Number of retries before a request fails with `RequestTimeout`.
    #[arg(long, env = "DISCV5_REQUEST_RETRIES", default_value_t = 1)]
    pub request_retries: u32,

    /// Lifetime of an established session before it must be re-established.
    #[arg(long, env = "DISCV5_SESSION_TIMEOUT_MS", default_value_t = 86_400_000)]
    pub session_timeout_ms: u64,

    /// Time allowed for a WHOAREYOU handshake to complete.
    #[arg(long, env = "DISCV5_SESSION_ESTABLISH_TIMEOUT_MS", default_value_t = 15_000)]
    pub session_establish_timeout_ms: u64,

    /// Upper bound on the wall-clock duration of a single lookup.
    #[arg(long, env = "DISCV5_LOOKUP_TIMEOUT_MS", default_value_t = 60_000)]
    pub lookup_timeout_ms: u64,

    /// Alpha: maximum concurrent outstanding FINDNODE queries per lookup.
    #[arg(long, env = "DISCV5_LOOKUP_PARALLELISM", default_value_t = 3)]
    pub lookup_parallelism: usize,

    /// K: bucket size and lookup result count.
    #[arg(long, env = "DISCV5_LOOKUP_NUM_RESULTS", default_value_t = 16)]
    pub lookup_num_results: usize,

    /// Maximum FINDNODE requests sent to any single peer during a lookup.
    #[arg(long, env = "DISCV5_LOOKUP_REQUEST_LIMIT", default_value_t = 3)]
    pub lookup_request_limit: usize,

    /// Interval between liveness pings to routing table entries.
    #[arg(long, env = "DISCV5_PING_INTERVAL_MS", default_value_t = 300_000)]
    pub ping_interval_ms: u64,

    /// Whether a PONG-observed address may update and re-sign the local ENR.
    #[arg(long, env = "DISCV5_ENR_UPDATE", default_value_t = true)]
    pub enr_update: bool,
}

impl Default for Discv5Config {
    fn default() -> Self {
        Self {
            listen_addrs: Vec::new(),
            bootstrap_enrs: Vec::new(),
            request_timeout_ms: 1_000,
            request_retries: 1,
            session_timeout_ms: 86_400_000,
            session_establish_timeout_ms: 15_000,
            lookup_timeout_ms: 60_000,
            lookup_parallelism: 3,
            lookup_num_results: 16,
            lookup_request_limit: 3,
            ping_interval_ms: 300_000,
            enr_update: true,
        }
    }
}

impl Discv5Config {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    pub fn session_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.session_timeout_ms)
    }

    pub fn session_establish_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.session_establish_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_interval_ms)
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addrs.push(addr);
        self
    }

    pub fn with_bootstrap_enrs(mut self, enrs: Vec<Enr>) -> Self {
        self.bootstrap_enrs = enrs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Discv5Config::default();
        assert_eq!(cfg.request_timeout_ms, 1_000);
        assert_eq!(cfg.request_retries, 1);
        assert_eq!(cfg.lookup_parallelism, 3);
        assert_eq!(cfg.lookup_num_results, 16);
        assert_eq!(cfg.lookup_request_limit, 3);
        assert!(cfg.enr_update);
    }

    #[test]
    fn builder_accumulates_listen_addrs() {
        let cfg = Discv5Config::default()
            .with_listen_addr("127.0.0.1:9000".parse().unwrap())
            .with_listen_addr("[::1]:9000".parse().unwrap());
        assert_eq!(cfg.listen_addrs.len(), 2);
    }
}

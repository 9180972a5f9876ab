//! Configuration surface (spec.md §6). Unlike a long-running server this
//! crate has no CLI or config file of its own: callers read `Config` from
//! the process environment directly, or build one by hand (or from a map)
//! for tests and embedders.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use engine::{ContextOptions, FlushStrategy};
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Discovery {
    /// `address-list`: extra unicast/broadcast search targets beyond
    /// whatever `auto_address_list` finds on the local interfaces.
    #[serde(default = "Discovery::address_list")]
    pub address_list: Vec<SocketAddr>,

    /// `auto-address-list`: derive broadcast targets from local interface
    /// subnets in addition to `address_list`.
    #[serde(default = "Discovery::auto_address_list")]
    pub auto_address_list: bool,

    /// `beacon-period`, in seconds: how often a connected server's beacon
    /// is expected; missing beacons do not themselves tear down channels
    /// in this engine (spec.md §4.3), but embedders may use it for their
    /// own liveness policy.
    #[serde(default = "Discovery::beacon_period_secs")]
    pub beacon_period_secs: u64,

    /// `broadcast-port`: the UDP port search datagrams and beacons use.
    #[serde(default = "Discovery::broadcast_port")]
    pub broadcast_port: u16,
}

impl Discovery {
    fn address_list() -> Vec<SocketAddr> {
        Vec::new()
    }

    fn auto_address_list() -> bool {
        true
    }

    fn beacon_period_secs() -> u64 {
        15
    }

    fn broadcast_port() -> u16 {
        5076
    }

    pub fn beacon_period(&self) -> Duration {
        Duration::from_secs(self.beacon_period_secs)
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            address_list: Self::address_list(),
            auto_address_list: Self::auto_address_list(),
            beacon_period_secs: Self::beacon_period_secs(),
            broadcast_port: Self::broadcast_port(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FlushStrategyConfig {
    Immediate,
    Delayed,
    UserControlled,
}

impl From<FlushStrategyConfig> for FlushStrategy {
    fn from(value: FlushStrategyConfig) -> Self {
        match value {
            FlushStrategyConfig::Immediate => FlushStrategy::Immediate,
            FlushStrategyConfig::Delayed => FlushStrategy::Delayed,
            FlushStrategyConfig::UserControlled => FlushStrategy::UserControlled,
        }
    }
}

impl Default for FlushStrategyConfig {
    fn default() -> Self {
        FlushStrategyConfig::Delayed
    }
}

#[derive(Deserialize, Debug)]
pub struct Transport {
    /// `conn-timeout`, in seconds: TCP connect and handshake deadline.
    #[serde(default = "Transport::conn_timeout_secs")]
    pub conn_timeout_secs: u64,

    /// `receive-buffer-size`, in bytes: the socket receive buffer each
    /// transport requests from the kernel.
    #[serde(default = "Transport::receive_buffer_size")]
    pub receive_buffer_size: usize,

    /// `flush-strategy`.
    #[serde(default)]
    pub flush_strategy: FlushStrategyConfig,
}

impl Transport {
    fn conn_timeout_secs() -> u64 {
        30
    }

    fn receive_buffer_size() -> usize {
        16 * 1024 * 1024
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout_secs)
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            conn_timeout_secs: Self::conn_timeout_secs(),
            receive_buffer_size: Self::receive_buffer_size(),
            flush_strategy: FlushStrategyConfig::default(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub discovery: Discovery,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub log: Log,

    /// `provider-names`: which introspection/type-registry providers to
    /// consult when resolving a channel's structure. This engine treats
    /// the list opaquely and hands it straight to the embedder.
    #[serde(default)]
    pub provider_names: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery: Discovery::default(),
            transport: Transport::default(),
            log: Log::default(),
            provider_names: Vec::new(),
        }
    }
}

impl Config {
    /// Reads the table in spec.md §6 from the process environment,
    /// falling back field-by-field to the defaults above.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// The in-process override path used by tests and embedders that
    /// don't want to touch real environment variables.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        Self::from_lookup(|key| map.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        if let Some(raw) = lookup("address-list") {
            config.discovery.address_list =
                raw.split_whitespace().filter_map(|s| parse_search_target(s)).collect();
        }
        if let Some(raw) = lookup("auto-address-list") {
            if let Ok(v) = raw.parse() {
                config.discovery.auto_address_list = v;
            }
        }
        if let Some(raw) = lookup("beacon-period") {
            if let Ok(v) = raw.parse() {
                config.discovery.beacon_period_secs = v;
            }
        }
        if let Some(raw) = lookup("broadcast-port") {
            if let Ok(v) = raw.parse() {
                config.discovery.broadcast_port = v;
            }
        }
        if let Some(raw) = lookup("conn-timeout") {
            if let Ok(v) = raw.parse() {
                config.transport.conn_timeout_secs = v;
            }
        }
        if let Some(raw) = lookup("receive-buffer-size") {
            if let Ok(v) = raw.parse() {
                config.transport.receive_buffer_size = v;
            }
        }
        if let Some(raw) = lookup("flush-strategy") {
            config.transport.flush_strategy = match raw.as_str() {
                "immediate" => FlushStrategyConfig::Immediate,
                "user-controlled" => FlushStrategyConfig::UserControlled,
                _ => FlushStrategyConfig::Delayed,
            };
        }
        if let Some(raw) = lookup("provider-names") {
            config.provider_names = raw.split(',').map(str::to_string).filter(|s| !s.is_empty()).collect();
        }

        config
    }

    /// Maps this configuration onto the engine's own options type
    /// (spec.md §6). A bare port with no host resolves against the
    /// subnet broadcast address `255.255.255.255` on that port; a
    /// hostless entry is otherwise rejected by `parse_search_target`.
    pub fn to_context_options(&self) -> ContextOptions {
        ContextOptions {
            search_targets: self.discovery.address_list.clone(),
            discovery_bind: format!("0.0.0.0:{}", self.discovery.broadcast_port)
                .parse()
                .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap()),
            conn_timeout: self.transport.conn_timeout(),
            flush_strategy: self.transport.flush_strategy.into(),
        }
    }
}

fn parse_search_target(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    let port = Discovery::broadcast_port();
    format!("{s}:{port}").parse().ok()
}

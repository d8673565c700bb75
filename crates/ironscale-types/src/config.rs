//! configuration types for ironscale.

use std::path::PathBuf;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// main configuration for ironscale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// server url advertised to clients.
    pub server_url: String,

    /// address to bind the http server to.
    pub listen_addr: String,

    /// path to the noise protocol private key file.
    pub noise_private_key_path: PathBuf,

    /// ipv4 prefix for node address allocation.
    pub prefix_v4: Option<IpNet>,

    /// ipv6 prefix for node address allocation.
    pub prefix_v6: Option<IpNet>,

    /// base domain for magicdns names.
    pub base_domain: String,

    /// minimum client capability version accepted on the control channel.
    pub min_capability_version: u32,

    /// database configuration.
    pub database: DatabaseConfig,

    /// derp configuration.
    pub derp: DerpConfig,

    /// dns configuration pushed to clients.
    pub dns: DnsConfig,

    /// performance tuning options.
    pub tuning: TuningConfig,

    /// accept /machine/register without a noise handshake.
    ///
    /// exists for handler tests that drive the router directly; a real
    /// deployment leaves this off so the machine key always comes from the
    /// cryptographic handshake.
    pub allow_unauthenticated_registration: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            noise_private_key_path: PathBuf::from("/var/lib/ironscale/noise_private.key"),
            prefix_v4: Some("100.64.0.0/10".parse().unwrap()),
            prefix_v6: Some("fd7a:115c:a1e0::/48".parse().unwrap()),
            base_domain: "ironscale.net".to_string(),
            min_capability_version: 68,
            database: DatabaseConfig::default(),
            derp: DerpConfig::default(),
            dns: DnsConfig::default(),
            tuning: TuningConfig::default(),
            allow_unauthenticated_registration: false,
        }
    }
}

/// database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// database type: "sqlite" or "postgres".
    pub db_type: String,

    /// database connection string or file path.
    pub connection_string: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: "sqlite".to_string(),
            connection_string: "/var/lib/ironscale/db.sqlite".to_string(),
        }
    }
}

/// derp (relay) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DerpConfig {
    /// path to a local derp map file (json).
    pub derp_map_path: Option<PathBuf>,

    /// region id of the built-in fallback region.
    pub fallback_region_id: i32,

    /// hostname of the built-in fallback region.
    pub fallback_region_host: String,
}

impl Default for DerpConfig {
    fn default() -> Self {
        Self {
            derp_map_path: None,
            fallback_region_id: 999,
            fallback_region_host: "derp.ironscale.net".to_string(),
        }
    }
}

/// dns configuration pushed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// enable magicdns.
    pub magic_dns: bool,

    /// global nameservers.
    pub nameservers: Vec<String>,

    /// search domains.
    pub search_domains: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            magic_dns: true,
            nameservers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            search_domains: vec![],
        }
    }
}

/// performance tuning for the session fan-out and map pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// number of map-generation workers in the batcher pool.
    pub batcher_workers: usize,

    /// depth of the bounded batcher work queue.
    pub work_queue_depth: usize,

    /// interval between flushes of batched (non-immediate) changes.
    pub batch_tick_ms: u64,

    /// per-channel send timeout; a blocked channel past this is stale.
    pub send_timeout_ms: u64,

    /// deadline for delivering the initial map on a new stream.
    pub initial_map_timeout_secs: u64,

    /// how long a disconnected node still counts as connected.
    pub disconnect_grace_secs: u64,

    /// idle age after which a connection is reaped as stale.
    pub stale_connection_secs: u64,

    /// interval of the stale-connection reaper.
    pub stale_reaper_interval_secs: u64,

    /// offline age after which a node's connection set is dropped.
    pub offline_cleanup_secs: u64,

    /// interval of the long-offline sweep.
    pub offline_cleanup_interval_secs: u64,

    /// interval between keep-alive messages on streaming connections.
    /// keep-alives travel through the per-connection channels and double
    /// as liveness probes, so this must stay below
    /// `stale_connection_secs`. 0 disables keep-alives.
    pub map_keepalive_interval_secs: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            batcher_workers: 6,
            work_queue_depth: 512,
            batch_tick_ms: 1000,
            send_timeout_ms: 50,
            initial_map_timeout_secs: 5,
            disconnect_grace_secs: 45,
            stale_connection_secs: 30,
            stale_reaper_interval_secs: 2,
            offline_cleanup_secs: 900,
            offline_cleanup_interval_secs: 300,
            map_keepalive_interval_secs: 25,
        }
    }
}

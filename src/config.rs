//! Process-wide configuration (spec §6).
//!
//! Read once from the environment at `Config::from_env()`. There is no
//! CLI surface (spec §6: "CLI/file-state: none") — this is a library
//! consumed by an embedding ICE agent, so environment variables are the
//! only configuration source, matching the spec's naming convention
//! exactly (`ALLOWED_INTERFACES`, `BIND_RETRIES`, ...).

use std::env;
use std::time::Duration;

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "TRUE" | "True"),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// `§6` table, one field per row, defaults matching the spec exactly.
#[derive(Debug, Clone)]
pub struct Config {
    pub allowed_interfaces: Option<Vec<String>>,
    pub blocked_interfaces: Option<Vec<String>>,
    pub allowed_addresses: Option<Vec<String>>,
    pub blocked_addresses: Option<Vec<String>>,
    pub disable_ipv6: bool,
    pub disable_link_local_addresses: bool,
    pub bind_wildcard: bool,
    pub bind_retries: u32,
    pub max_ctran_retrans_timer: Duration,
    pub max_ctran_retransmissions: u32,
    pub harvesting_timeout: Duration,
    pub turn_enable_tcp: bool,
    pub turn_enable_tls: bool,
    pub turn_use_even_port: bool,
    pub turn_even_port_rflag: bool,
    pub turn_try_alternate: bool,
    pub stun_mapping_harvester_addresses: Option<Vec<String>>,
    pub nat_harvester_local_address: Option<String>,
    pub nat_harvester_public_address: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_interfaces: None,
            blocked_interfaces: None,
            allowed_addresses: None,
            blocked_addresses: None,
            disable_ipv6: true,
            disable_link_local_addresses: false,
            bind_wildcard: false,
            bind_retries: 50,
            max_ctran_retrans_timer: Duration::from_millis(1600),
            max_ctran_retransmissions: 7,
            harvesting_timeout: Duration::from_secs(15),
            turn_enable_tcp: true,
            turn_enable_tls: false,
            turn_use_even_port: false,
            turn_even_port_rflag: false,
            turn_try_alternate: true,
            stun_mapping_harvester_addresses: None,
            nat_harvester_local_address: None,
            nat_harvester_public_address: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment, falling back to
    /// the spec's defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            allowed_interfaces: env_list("ALLOWED_INTERFACES"),
            blocked_interfaces: env_list("BLOCKED_INTERFACES"),
            allowed_addresses: env_list("ALLOWED_ADDRESSES"),
            blocked_addresses: env_list("BLOCKED_ADDRESSES"),
            disable_ipv6: env_bool("DISABLE_IPv6", defaults.disable_ipv6),
            disable_link_local_addresses: env_bool(
                "DISABLE_LINK_LOCAL_ADDRESSES",
                defaults.disable_link_local_addresses,
            ),
            bind_wildcard: env_bool("BIND_WILDCARD", defaults.bind_wildcard),
            bind_retries: env_u32("BIND_RETRIES", defaults.bind_retries),
            max_ctran_retrans_timer: Duration::from_millis(u64::from(env_u32(
                "MAX_CTRAN_RETRANS_TIMER",
                defaults.max_ctran_retrans_timer.as_millis() as u32,
            ))),
            max_ctran_retransmissions: env_u32(
                "MAX_CTRAN_RETRANSMISSIONS",
                defaults.max_ctran_retransmissions,
            ),
            harvesting_timeout: Duration::from_secs(u64::from(env_u32(
                "HARVESTING_TIMEOUT",
                defaults.harvesting_timeout.as_secs() as u32,
            ))),
            turn_enable_tcp: env_bool("TURN_ENABLE_TCP", defaults.turn_enable_tcp),
            turn_enable_tls: env_bool("TURN_ENABLE_TLS", defaults.turn_enable_tls),
            turn_use_even_port: env_bool("TURN_USE_EVEN_PORT", defaults.turn_use_even_port),
            turn_even_port_rflag: env_bool(
                "TURN_EVEN_PORT_RFLAG",
                defaults.turn_even_port_rflag,
            ),
            turn_try_alternate: env_bool("TURN_TRY_ALTERNATE", defaults.turn_try_alternate),
            stun_mapping_harvester_addresses: env_list("STUN_MAPPING_HARVESTER_ADDRESSES"),
            nat_harvester_local_address: env::var("NAT_HARVESTER_LOCAL_ADDRESS").ok(),
            nat_harvester_public_address: env::var("NAT_HARVESTER_PUBLIC_ADDRESS").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::default();
        assert!(cfg.disable_ipv6);
        assert!(!cfg.disable_link_local_addresses);
        assert!(!cfg.bind_wildcard);
        assert_eq!(cfg.bind_retries, 50);
        assert_eq!(cfg.max_ctran_retrans_timer, Duration::from_millis(1600));
        assert_eq!(cfg.max_ctran_retransmissions, 7);
        assert_eq!(cfg.harvesting_timeout, Duration::from_secs(15));
        assert!(cfg.turn_enable_tcp);
        assert!(!cfg.turn_enable_tls);
        assert!(cfg.turn_try_alternate);
    }
}

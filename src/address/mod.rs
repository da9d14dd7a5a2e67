//! Address Inventory (spec §4.1): enumerate interfaces, apply the
//! allow/block filter pipeline, and classify virtual/loopback/v6
//! addresses.

use std::net::IpAddr;

use crate::config::Config;
use crate::error::{Error, Result};

/// One allowed local address, with whether it sits on a virtual
/// interface (spec §4.1: "`virtual` is true for addresses on virtual
/// interfaces").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryEntry {
    pub address: IpAddr,
    pub virtual_interface: bool,
}

/// The set of local addresses a harvest may bind sockets on, as of the
/// last refresh.
pub struct AddressInventory {
    config: Config,
    /// Interfaces known to be virtual (heuristically: common tunnel /
    /// container / VPN interface name prefixes), used to set
    /// `InventoryEntry::virtual_interface`.
    virtual_interface_prefixes: Vec<&'static str>,
}

const DEFAULT_VIRTUAL_PREFIXES: &[&str] =
    &["docker", "veth", "br-", "tun", "tap", "utun", "wg", "zt", "virbr"];

impl AddressInventory {
    /// Construct the inventory. Fails loudly (`InvalidConfig`) if a
    /// named interface in `ALLOWED_INTERFACES`/`BLOCKED_INTERFACES`
    /// does not exist on the host — spec §4.1: "Initialization is
    /// once-per-process and must fail loudly".
    pub fn new(config: Config) -> Result<Self> {
        let inventory = Self { config, virtual_interface_prefixes: DEFAULT_VIRTUAL_PREFIXES.to_vec() };
        inventory.validate_named_interfaces()?;
        Ok(inventory)
    }

    fn validate_named_interfaces(&self) -> Result<()> {
        let Ok(interfaces) = if_addrs::get_if_addrs() else {
            return Ok(());
        };
        let names: Vec<&str> = interfaces.iter().map(|i| i.name.as_str()).collect();

        for list in [&self.config.allowed_interfaces, &self.config.blocked_interfaces]
            .into_iter()
            .flatten()
        {
            for wanted in list {
                if !names.contains(&wanted.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "named interface '{wanted}' does not exist"
                    )));
                }
            }
        }

        Ok(())
    }

    fn is_virtual(&self, name: &str) -> bool {
        self.virtual_interface_prefixes.iter().any(|p| name.starts_with(p))
    }

    /// Re-run the filter pipeline against the current interface set
    /// (spec §4.1: "Filters are re-queried on each harvest").
    ///
    /// Order, per spec:
    /// 1. drop interfaces not in `ALLOWED_INTERFACES` (if set) or in
    ///    `BLOCKED_INTERFACES` (else)
    /// 2. drop interfaces that are down
    /// 3. drop loopback
    /// 4. within remaining interfaces, drop addresses in
    ///    `BLOCKED_ADDRESSES`; if `ALLOWED_ADDRESSES` is set, require
    ///    membership
    /// 5. drop IPv6 if `DISABLE_IPv6`; drop IPv6 link-local if
    ///    `DISABLE_LINK_LOCAL_ADDRESSES`
    pub fn enumerate(&self) -> Result<Vec<InventoryEntry>> {
        self.enumerate_with(false)
    }

    /// Same filter pipeline as [`Self::enumerate`], but step 3 (drop
    /// loopback) is skipped when `include_loopback` is set — the Host
    /// Harvester config flag that lets a harvester opt into loopback
    /// addresses (useful against a loopback-only test fixture or a
    /// server bound to `127.0.0.1`).
    pub fn enumerate_with(&self, include_loopback: bool) -> Result<Vec<InventoryEntry>> {
        let interfaces = if_addrs::get_if_addrs()
            .map_err(|e| Error::InvalidConfig(format!("interface enumeration failed: {e}")))?;

        let mut out = Vec::new();

        for iface in interfaces {
            // Step 1.
            if let Some(allowed) = &self.config.allowed_interfaces {
                if !allowed.iter().any(|n| n == &iface.name) {
                    continue;
                }
            } else if let Some(blocked) = &self.config.blocked_interfaces {
                if blocked.iter().any(|n| n == &iface.name) {
                    continue;
                }
            }

            // Step 2: `if-addrs` only surfaces interfaces the OS
            // reports an address for, which in practice excludes
            // administratively-down interfaces; there is no separate
            // up/down flag to consult here.

            // Step 3.
            if iface.is_loopback() && !include_loopback {
                continue;
            }

            let addr = iface.ip();

            // Step 4.
            if let Some(blocked) = &self.config.blocked_addresses {
                if blocked.iter().any(|a| a.parse::<IpAddr>().map(|p| p == addr).unwrap_or(false)) {
                    continue;
                }
            }
            if let Some(allowed) = &self.config.allowed_addresses {
                if !allowed.iter().any(|a| a.parse::<IpAddr>().map(|p| p == addr).unwrap_or(false)) {
                    continue;
                }
            }

            // Step 5.
            if addr.is_ipv6() {
                if self.config.disable_ipv6 {
                    continue;
                }
                if self.config.disable_link_local_addresses {
                    if let IpAddr::V6(v6) = addr {
                        if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                            continue;
                        }
                    }
                }
            }

            out.push(InventoryEntry {
                address: addr,
                virtual_interface: self.is_virtual(&iface.name),
            });
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_prefix_detection() {
        let inv = AddressInventory { config: Config::default(), virtual_interface_prefixes: DEFAULT_VIRTUAL_PREFIXES.to_vec() };
        assert!(inv.is_virtual("docker0"));
        assert!(inv.is_virtual("tun0"));
        assert!(!inv.is_virtual("eth0"));
    }
}

//! Records this server answers for: its own hostname's A/AAAA records.

use std::net::{IpAddr, Ipv6Addr};

use parking_lot::RwLock;

use super::protocol::{self, Question, Record};

pub const DEFAULT_HOSTNAME: &str = "matter-server";
pub const RECORD_TTL: u32 = 120;

const LOCAL_SUFFIX: &str = ".local";

/// Source of answers for incoming questions.
pub trait Zone: Send + Sync {
    fn records(&self, question: &Question) -> Vec<Record>;
}

pub struct MatterZone {
    hostname: String,
    addresses: RwLock<Vec<IpAddr>>,
}

fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

fn is_advertisable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local(),
        IpAddr::V6(v6) => !v6.is_loopback() && !is_link_local_v6(v6),
    }
}

/// Non-loopback, non-link-local addresses of all local interfaces.
pub fn local_addresses() -> Vec<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| iface.ip())
            .filter(is_advertisable)
            .collect(),
        Err(e) => {
            log::error!("failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}

/// Hostname as advertised: never empty, always ending in `.local`.
pub fn normalize_hostname(hostname: &str) -> String {
    let trimmed = hostname.trim().trim_end_matches('.');
    let base = if trimmed.is_empty() {
        DEFAULT_HOSTNAME
    } else {
        trimmed
    };
    if base.to_lowercase().ends_with(LOCAL_SUFFIX) {
        base.to_owned()
    } else {
        format!("{}{}", base, LOCAL_SUFFIX)
    }
}

impl MatterZone {
    /// Zone for `hostname`, seeded with the current interface addresses.
    pub fn new(hostname: &str) -> Self {
        Self::with_addresses(hostname, local_addresses())
    }

    pub fn with_addresses(hostname: &str, addresses: Vec<IpAddr>) -> Self {
        let zone = Self {
            hostname: normalize_hostname(hostname),
            addresses: RwLock::new(addresses),
        };
        log::debug!(
            "mdns zone for {} with {} addresses",
            zone.hostname,
            zone.addresses.read().len()
        );
        zone
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.addresses.read().clone()
    }

    pub fn set_addresses(&self, addresses: Vec<IpAddr>) {
        *self.addresses.write() = addresses;
    }

    /// Re-read interface addresses. Safe to call while queries are answered.
    pub fn refresh_addresses(&self) {
        let addresses = local_addresses();
        log::debug!("updated mdns addresses: {}", addresses.len());
        self.set_addresses(addresses);
    }
}

impl Zone for MatterZone {
    fn records(&self, question: &Question) -> Vec<Record> {
        let qname = question.name.trim_end_matches('.');
        log::debug!(
            "mdns query {} {} (advertising {})",
            qname,
            protocol::type_name(question.typ),
            self.hostname
        );
        if !qname.eq_ignore_ascii_case(&self.hostname) {
            return Vec::new();
        }

        let addresses = self.addresses.read();
        let records: Vec<Record> = match question.typ {
            protocol::TYPE_A => addresses
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) if !v4.is_loopback() => {
                        Some(Record::a(&self.hostname, *v4, RECORD_TTL))
                    }
                    _ => None,
                })
                .collect(),
            protocol::TYPE_AAAA => addresses
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V6(v6) if !v6.is_loopback() && !is_link_local_v6(v6) => {
                        Some(Record::aaaa(&self.hostname, *v6, RECORD_TTL))
                    }
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        log::debug!("mdns answer for {}: {} records", self.hostname, records.len());
        records
    }
}

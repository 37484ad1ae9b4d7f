use crate::{
    config::{PoolEntry, ZoneConfig},
    delivery::{Delivery, SourceAddress},
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

/// Source-address pool of a zone.
///
/// Selection is deterministic per delivery id (a retried message keeps its
/// source IP) while still spreading distinct messages across the pool.
pub struct IpPool {
    v4: Vec<PoolEntry>,
    v6: Vec<PoolEntry>,
    salt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Selection outcome; `pool_disabled` is set when every pool entry of the
/// required family was disabled for this delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub source: SourceAddress,
    pub pool_disabled: bool,
}

impl IpPool {
    pub fn new(zone: &ZoneConfig) -> Self {
        Self {
            v4: zone.pool.clone(),
            v6: zone.pool_v6.clone(),
            salt: zone.salt.clone().unwrap_or_else(|| zone.name.clone()),
        }
    }

    pub fn has_v6(&self) -> bool {
        !self.v6.is_empty()
    }

    pub fn select(&self, delivery: &Delivery, family: Family) -> Selection {
        let pool = match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        };

        let filtered: Vec<&PoolEntry> = pool
            .iter()
            .filter(|entry| !delivery.disabled_addresses.contains(&entry.address))
            .collect();

        if filtered.is_empty() {
            warn!(
                id = delivery.id,
                "every source address of the required family is disabled"
            );
            let address = match family {
                Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            return Selection {
                source: SourceAddress {
                    address,
                    ehlo_name: String::new(),
                },
                pool_disabled: true,
            };
        }

        let index = (fnv1a(delivery.id.as_bytes(), self.salt.as_bytes())
            % filtered.len() as u64) as usize;
        let entry = filtered[index];
        Selection {
            source: SourceAddress {
                address: entry.address,
                ehlo_name: entry.hostname.clone(),
            },
            pool_disabled: false,
        }
    }
}

/// Stable 64-bit FNV-1a over `id || salt`. Must not change between runs:
/// retried deliveries have to land on the same pool slot.
fn fnv1a(id: &[u8], salt: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x1_0000_01b3;
    let mut hash = OFFSET;
    for byte in id.iter().chain(salt) {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

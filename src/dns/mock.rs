//! A table-driven stand-in for the wire resolver, swapped in at the type
//! level under `cfg(test)`.

use super::LookupOutcome;
use crate::classify::DeliveryError;
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Default)]
pub struct MockDns {
    pub mx: HashMap<String, Vec<(u16, String)>>,
    pub a: HashMap<String, Vec<Ipv4Addr>>,
    pub aaaa: HashMap<String, Vec<Ipv6Addr>>,
    pub txt: HashMap<String, Vec<String>>,
    /// Names whose every query fails like a SERVFAIL.
    pub failing: HashSet<String>,
}

fn key(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

impl MockDns {
    pub fn add_mx(&mut self, name: &str, priority: u16, exchange: &str) {
        self.mx
            .entry(key(name))
            .or_default()
            .push((priority, exchange.to_string()));
    }

    pub fn add_a(&mut self, name: &str, address: &str) {
        self.a
            .entry(key(name))
            .or_default()
            .push(address.parse().expect("ipv4 literal"));
    }

    pub fn add_aaaa(&mut self, name: &str, address: &str) {
        self.aaaa
            .entry(key(name))
            .or_default()
            .push(address.parse().expect("ipv6 literal"));
    }

    pub fn add_txt(&mut self, name: &str, record: &str) {
        self.txt
            .entry(key(name))
            .or_default()
            .push(record.to_string());
    }

    pub fn fail(&mut self, name: &str) {
        self.failing.insert(key(name));
    }

    pub(super) fn query<T: Clone>(
        &self,
        table: &HashMap<String, Vec<T>>,
        qname: &str,
    ) -> Result<LookupOutcome<T>, DeliveryError> {
        let name = key(qname);
        if self.failing.contains(&name) {
            return Err(DeliveryError::dns(format!("lookup of {qname} failed: SERVFAIL")));
        }
        match table.get(&name) {
            Some(records) if !records.is_empty() => Ok(LookupOutcome::Records(records.clone())),
            _ => Ok(LookupOutcome::NoRecords),
        }
    }
}

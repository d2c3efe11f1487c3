//! Table of active remote port forwardings.

use super::types::ForwardAddr;
use std::collections::HashMap;
use tracing::debug;

/// Active `tcpip-forward` bindings, keyed by the address the server reported.
///
/// The value is the real port the server listens on. For a dynamic bind the
/// key normally carries the allocated port too; peers with the OpenSSH 5.x
/// quirk keep announcing port 0, so those entries stay keyed by `addr:0`.
#[derive(Debug, Default, Clone)]
pub struct ForwardingTable {
    entries: HashMap<ForwardAddr, Binding>,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    real_port: u32,
    /// Requested with port 0.
    dynamic: bool,
}

impl ForwardingTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful bind of `host:bind_port`.
    ///
    /// `requested_port` is the port the user asked for; 0 marks the entry as
    /// dynamic.
    pub fn insert(&mut self, host: &str, requested_port: u32, bind_port: u32, real_port: u32) {
        let key = ForwardAddr::new(host, bind_port);
        debug!(forward = %key, real_port, "remote forwarding active");
        self.entries.insert(
            key,
            Binding {
                real_port,
                dynamic: requested_port == 0,
            },
        );
    }

    /// Removes the bind stored under exactly `host:port`. Unknown entries
    /// are ignored.
    pub fn remove(&mut self, host: &str, port: u32) -> Option<u32> {
        self.entries
            .remove(&ForwardAddr::new(host, port))
            .map(|binding| binding.real_port)
    }

    /// Removes the binding a successful `cancel-tcpip-forward` for
    /// `host:port` ended.
    ///
    /// Besides the exact key, a cancel naming the real port drops an entry
    /// kept under `host:0`, and a cancel naming port 0 drops the dynamic
    /// entries on `host`, whatever port the server picked for them.
    /// Returns the real ports released.
    pub fn release(&mut self, host: &str, port: u32) -> Vec<u32> {
        if let Some(real_port) = self.remove(host, port) {
            return vec![real_port];
        }
        let stale: Vec<ForwardAddr> = self
            .entries
            .iter()
            .filter(|(key, binding)| {
                key.host == host
                    && if port == 0 {
                        binding.dynamic
                    } else {
                        key.port == 0 && binding.real_port == port
                    }
            })
            .map(|(key, _)| key.clone())
            .collect();
        stale
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .map(|binding| {
                debug!(host, real_port = binding.real_port, "remote forwarding released");
                binding.real_port
            })
            .collect()
    }

    /// Returns true if `host:port` is an active binding.
    pub fn contains(&self, host: &str, port: u32) -> bool {
        self.entries.contains_key(&ForwardAddr::new(host, port))
    }

    /// Resolves the destination of an incoming `forwarded-tcpip` open.
    ///
    /// Returns the port to report to the user, or `None` when no matching
    /// binding exists. A port-0 announcement maps to the recorded real port.
    /// An announcement carrying the real port also matches a dynamic entry
    /// still keyed by `addr:0`.
    pub fn resolve(&self, host: &str, port: u32) -> Option<u32> {
        if let Some(binding) = self.entries.get(&ForwardAddr::new(host, port)) {
            return Some(if port == 0 { binding.real_port } else { port });
        }
        if port == 0 {
            return None;
        }
        match self.entries.get(&ForwardAddr::new(host, 0)) {
            Some(binding) if binding.real_port == port => Some(port),
            _ => None,
        }
    }

    /// Number of active bindings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is forwarded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every binding.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates over `(bind address, real port)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&ForwardAddr, u32)> {
        self.entries.iter().map(|(k, v)| (k, v.real_port))
    }
}

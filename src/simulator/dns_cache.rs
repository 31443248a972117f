//! Per-host DNS resolution cache.

use std::collections::HashMap;

use crate::network::request::NetworkRequest;
use crate::types::Milliseconds;

/// A lookup costs this many round trips.
pub const DNS_RESOLUTION_RTT_MULTIPLIER: f64 = 2.0;

/// Tracks when each host finished resolving during a simulation.
#[derive(Clone, Debug)]
pub struct DnsCache {
    rtt: Milliseconds,
    resolved_at: HashMap<String, Milliseconds>,
}

impl DnsCache {
    pub fn new(rtt: Milliseconds) -> Self {
        Self {
            rtt,
            resolved_at: HashMap::new(),
        }
    }

    /// Time until the request's host is resolved when asked at `requested_at`.
    ///
    /// A cached host costs whatever remains of its earlier resolution. With
    /// `update_cache` the resolution time is recorded, keeping the earliest.
    pub fn time_until_resolution(
        &mut self,
        request: &NetworkRequest,
        requested_at: Milliseconds,
        update_cache: bool,
    ) -> Milliseconds {
        let host = request.parsed_url.host.as_str();
        let mut time_until_resolved = self.rtt * DNS_RESOLUTION_RTT_MULTIPLIER;
        if let Some(&resolved_at) = self.resolved_at.get(host) {
            let remaining = (resolved_at - requested_at).max(0.0);
            time_until_resolved = time_until_resolved.min(remaining);
        }

        if update_cache {
            let resolved_at = requested_at + time_until_resolved;
            self.resolved_at
                .entry(host.to_string())
                .and_modify(|existing| *existing = existing.min(resolved_at))
                .or_insert(resolved_at);
        }
        time_until_resolved
    }

    /// Marks `host` as resolved at `resolved_at`.
    pub fn set_resolved_at(&mut self, host: impl Into<String>, resolved_at: Milliseconds) {
        self.resolved_at.insert(host.into(), resolved_at);
    }
}

//! Per-origin pool of simulated TCP connections.
//!
//! Connections are created up front from the observed requests: one per
//! request that opened a fresh connection, padded to the per-origin minimum.
//! Nothing is created while a simulation runs.
//!
//! Which request uses which connection is planned before a run by replaying
//! the observed load in simulation order, so the assignment never depends on
//! simulated rtt or throughput.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::SimulationError;
use crate::network::analyzer::NetworkAnalyzer;
use crate::network::request::NetworkRequest;
use crate::simulator::engine::SimulatorOptions;
use crate::simulator::tcp_connection::TcpConnection;
use crate::types::Milliseconds;

pub const DEFAULT_SERVER_RESPONSE_TIME: Milliseconds = 30.0;
pub const CONNECTIONS_PER_ORIGIN: usize = 6;

/// Handle to a connection owned by a [`ConnectionPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(usize);

/// Connection a request is planned to use.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedConnection {
    pub connection: ConnectionId,
    /// Position of the request that used the connection before
    pub previous: Option<usize>,
    /// Connection state when the request starts
    pub state: TcpConnection,
}

/// Pool of connections, checked out per request.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    connections: Vec<TcpConnection>,
    by_origin: BTreeMap<String, Vec<ConnectionId>>,
    origin_of: Vec<String>,
    by_request: HashMap<String, ConnectionId>,
    in_use: Vec<bool>,
    connection_reused: BTreeMap<String, bool>,
}

impl ConnectionPool {
    /// Builds the pool for `records`.
    ///
    /// Fails if some origin has no request that opened a connection.
    pub fn new(records: &[Arc<NetworkRequest>], options: &SimulatorOptions) -> Result<Self, SimulationError> {
        let connection_reused = NetworkAnalyzer::estimate_if_connection_was_reused(records, true);
        let mut pool = Self {
            connections: Vec::new(),
            by_origin: BTreeMap::new(),
            origin_of: Vec::new(),
            by_request: HashMap::new(),
            in_use: Vec::new(),
            connection_reused,
        };

        for (origin, origin_records) in NetworkAnalyzer::group_by_origin(records) {
            let additional_rtt = options.additional_rtt_by_origin.get(&origin).copied().unwrap_or(0.0);
            let response_time = options
                .server_response_time_by_origin
                .get(&origin)
                .copied()
                .unwrap_or(DEFAULT_SERVER_RESPONSE_TIME);

            let mut connections: Vec<TcpConnection> = origin_records
                .iter()
                .filter(|r| !pool.connection_reused.get(&r.request_id).copied().unwrap_or(false))
                .map(|r| {
                    TcpConnection::new(
                        options.rtt + additional_rtt,
                        options.throughput,
                        response_time,
                        r.parsed_url.is_secure(),
                        r.is_h2(),
                    )
                })
                .collect();

            let Some(first) = connections.first().cloned() else {
                return Err(SimulationError::NoConnectionForOrigin(origin));
            };
            let minimum = if first.is_h2() { 1 } else { CONNECTIONS_PER_ORIGIN };
            while connections.len() < minimum {
                connections.push(first.clone());
            }

            let ids = connections
                .into_iter()
                .map(|connection| {
                    let id = ConnectionId(pool.connections.len());
                    pool.connections.push(connection);
                    pool.origin_of.push(origin.clone());
                    pool.in_use.push(false);
                    id
                })
                .collect();
            pool.by_origin.insert(origin, ids);
        }

        tracing::trace!(
            origins = pool.by_origin.len(),
            connections = pool.connections.len(),
            "initialized connection pool"
        );
        Ok(pool)
    }

    /// Whether the request was estimated to reuse a warm connection.
    pub fn observed_connection_reused(&self, request: &NetworkRequest) -> bool {
        self.connection_reused.get(&request.request_id).copied().unwrap_or(false)
    }

    /// Checks out the free connection with the largest congestion window.
    ///
    /// Unless `ignore_connection_reused` is set, only connections whose warmth
    /// matches the request's observed reuse qualify. Returns `Ok(None)` when
    /// nothing is available.
    pub fn acquire(
        &mut self,
        request: &NetworkRequest,
        ignore_connection_reused: bool,
    ) -> Result<Option<ConnectionId>, SimulationError> {
        if self.by_request.contains_key(&request.request_id) {
            return Err(SimulationError::ConnectionAlreadyAcquired(request.request_id.clone()));
        }
        let observed_reused = self.observed_connection_reused(request);
        let Some(candidates) = self.by_origin.get(request.origin()) else {
            return Ok(None);
        };

        let mut best: Option<ConnectionId> = None;
        for &id in candidates {
            let connection = &self.connections[id.0];
            if !ignore_connection_reused && connection.is_warm() != observed_reused {
                continue;
            }
            if self.in_use[id.0] {
                continue;
            }
            let larger = best.map_or(true, |b| connection.congestion_window() > self.connections[b.0].congestion_window());
            if larger {
                best = Some(id);
            }
        }

        if let Some(id) = best {
            self.in_use[id.0] = true;
            self.by_request.insert(request.request_id.clone(), id);
        }
        Ok(best)
    }

    /// Checks out the connection planned for `request`.
    ///
    /// Fails if the request already holds a connection or the connection is
    /// still held by another request.
    pub fn check_out(&mut self, request: &NetworkRequest, id: ConnectionId) -> Result<(), SimulationError> {
        if self.by_request.contains_key(&request.request_id) {
            return Err(SimulationError::ConnectionAlreadyAcquired(request.request_id.clone()));
        }
        match self.in_use.get_mut(id.0) {
            Some(in_use) if !*in_use => *in_use = true,
            _ => return Err(SimulationError::ConnectionBusy(request.request_id.clone())),
        }
        self.by_request.insert(request.request_id.clone(), id);
        Ok(())
    }

    /// Assigns a connection to each of `requests`, taken in simulation order.
    ///
    /// A connection is free again once the observed end of its request is no
    /// later than the observed start of the next one. When nothing suitable is
    /// free, the origin's busy connection whose request ended first is handed
    /// over, preferring matching warmth. The pool itself is left untouched.
    pub fn plan(
        &self,
        requests: &[Arc<NetworkRequest>],
        ignore_connection_reused: bool,
    ) -> Result<Vec<PlannedConnection>, SimulationError> {
        let mut pool = self.clone();
        let mut holders: Vec<Option<usize>> = vec![None; pool.connections.len()];
        let mut last_user: Vec<Option<usize>> = vec![None; pool.connections.len()];
        let mut planned = Vec::with_capacity(requests.len());

        for (position, request) in requests.iter().enumerate() {
            let origin_ids = pool.by_origin.get(request.origin()).cloned().unwrap_or_default();
            for &id in &origin_ids {
                if let Some(holder) = holders[id.0] {
                    if requests[holder].network_end_time <= request.network_request_time {
                        pool.finish(&requests[holder], id);
                        holders[id.0] = None;
                    }
                }
            }

            let id = match pool.acquire(request, ignore_connection_reused)? {
                Some(id) => id,
                None => {
                    let earliest = origin_ids
                        .iter()
                        .filter_map(|&id| holders[id.0].map(|holder| (id, holder)))
                        .min_by(|a, b| {
                            requests[a.1]
                                .network_end_time
                                .total_cmp(&requests[b.1].network_end_time)
                                .then(a.1.cmp(&b.1))
                        });
                    if let Some((busy, holder)) = earliest {
                        pool.finish(&requests[holder], busy);
                        holders[busy.0] = None;
                    }
                    match pool.acquire(request, ignore_connection_reused)? {
                        Some(id) => id,
                        None => pool
                            .acquire(request, true)?
                            .ok_or_else(|| SimulationError::NoConnectionForOrigin(request.origin().to_string()))?,
                    }
                }
            };

            holders[id.0] = Some(position);
            planned.push(PlannedConnection {
                connection: id,
                previous: last_user[id.0].replace(position),
                state: pool.connections[id.0].clone(),
            });
        }
        Ok(planned)
    }

    fn finish(&mut self, request: &NetworkRequest, id: ConnectionId) {
        self.connections[id.0].complete_download(request.transfer_size);
        self.release(request);
    }

    /// The connection currently held by `request`.
    pub fn active_connection(&self, request: &NetworkRequest) -> Result<ConnectionId, SimulationError> {
        self.by_request
            .get(&request.request_id)
            .copied()
            .ok_or_else(|| SimulationError::NoActiveConnection(request.request_id.clone()))
    }

    /// Returns the request's connection to the pool, if it holds one.
    pub fn release(&mut self, request: &NetworkRequest) {
        if let Some(id) = self.by_request.remove(&request.request_id) {
            self.in_use[id.0] = false;
        }
    }

    pub fn connection(&self, id: ConnectionId) -> &TcpConnection {
        &self.connections[id.0]
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> &mut TcpConnection {
        &mut self.connections[id.0]
    }

    /// Connections currently checked out.
    pub fn connections_in_use(&self) -> Vec<ConnectionId> {
        (0..self.connections.len())
            .filter(|&i| self.in_use[i])
            .map(ConnectionId)
            .collect()
    }


    /// Number of connections held for `origin`.
    pub fn connection_count(&self, origin: &str) -> usize {
        self.by_origin.get(origin).map_or(0, Vec::len)
    }

    /// Number of connections of `origin` currently checked out.
    pub fn in_use_count(&self, origin: &str) -> usize {
        self.by_origin
            .get(origin)
            .map_or(0, |ids| ids.iter().filter(|id| self.in_use[id.0]).count())
    }

    pub fn origin(&self, id: ConnectionId) -> &str {
        &self.origin_of[id.0]
    }
}

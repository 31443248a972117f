//! Page load simulation: TCP model, DNS cache, connection pool, per-node
//! timing state and the discrete-event engine driving them.

pub mod connection_pool;
pub mod dns_cache;
pub mod engine;
pub mod tcp_connection;
pub mod timing;

pub use connection_pool::{ConnectionId, ConnectionPool, PlannedConnection};
pub use dns_cache::DnsCache;
pub use engine::{
    DebugNodeTiming, NodeTiming, SimulateOptions, SimulationResult, Simulator, SimulatorOptions,
};
pub use tcp_connection::{ConnectionTiming, DownloadOptions, DownloadResult, TcpConnection, WindowGrowth};
pub use timing::{NetworkProgress, NodeTimingState, SimulatorTimingMap, TimingPhase};

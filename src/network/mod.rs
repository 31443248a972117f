//! Network request records and the pure analysis functions over them.

pub mod analyzer;
pub mod request;

pub use analyzer::{LanternData, NetworkAnalysis, NetworkAnalyzer, RttEstimateOptions, Summary};
pub use request::{
    Initiator, InitiatorStack, NetworkRequest, ParsedUrl, Priority, ResourceTiming, ResourceType,
};

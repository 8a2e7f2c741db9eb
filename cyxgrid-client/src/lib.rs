//! CyxGrid Client Library
//!
//! Moves objects to and from a pool of storage endpoints.
//!
//! The client performs:
//! - Share placement across failure domains (diversity policy with fallback)
//! - Upload: segment, seal, encode, place, await acknowledgements
//! - Download: resolve version, fetch k verified shares, decode, unseal
//! - Share audits with verify-only capabilities
//! - Mutable slots with signed, sequence-numbered versions

pub mod config;
pub mod download;
pub mod health;
pub mod orchestrator;
pub mod placement;
pub mod transport;
pub mod upload;

// Re-export main types
pub use config::{BreakerSettings, GridConfig};
pub use download::{DownloadState, SegmentReport, ShareStatus, VerifyReport};
pub use health::{BreakerConfig, CircuitState, EndpointHealth};
pub use orchestrator::Orchestrator;
pub use placement::{
    permute_endpoints, DiversityPolicy, Endpoint, EndpointId, PlacementMap, PlacementPlanner,
};
pub use transport::{MemoryTransport, ShareTransport, TransportError};
pub use upload::UploadState;

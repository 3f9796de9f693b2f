//! Locating a service that runs inside a remote workload
//!
//! Tool output on the host is inconsistent between images and versions, so the
//! port is looked for by an ordered chain of read-only [`DiscoveryStrategy`]
//! probes. The first hit short-circuits the chain; when all of them miss, the
//! error carries every strategy's diagnostic.

pub mod chain;
pub mod error;
pub mod parse;
pub mod profile;
pub mod strategy;

pub use chain::EndpointDiscovery;
pub use error::{Attempt, DiscoveryError};
pub use profile::ServiceProfile;
pub use strategy::{
    AlternateListing, DiscoveryStrategy, Endpoint, LogScan, ProbeContext, ProbeOutcome,
    SocketTable, StructuredListing,
};

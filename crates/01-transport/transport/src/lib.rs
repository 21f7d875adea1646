//! Point-to-point transport primitives underneath the communication engine.
//!
//! * [`Transport`] – tag-matched, non-blocking send/receive endpoint with
//!   persistent receives and batched completion testing.
//! * [`MemRegion`] / [`Span`] – shared byte buffers that transfers read from
//!   and write into.
//! * [`Datatype`] – element description attached to registered memory.
//! * [`LocalFabric`] – in-process fabric of N ranks wired through channels.
//! * [`TransportError`] – lightweight error surface for the above.

mod datatype;
mod endpoint;
mod error;
mod local;
mod region;

pub use datatype::Datatype;
pub use endpoint::{Completion, Completions, Rank, RequestId, Source, Status, Tag, Transport};
pub use error::{TransportError, TransportResult};
pub use local::{EndpointMetrics, FabricConfig, LocalEndpoint, LocalFabric};
pub use region::{MemRegion, Span};

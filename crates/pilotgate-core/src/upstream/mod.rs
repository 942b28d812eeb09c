//! Upstream backend transport
//!
//! Everything that leaves the gateway over HTTP goes through the
//! [`Upstream`] trait: streamed completions, the model catalog, the
//! identity-to-service token exchange and the device-authorization flow.
//! [`HttpUpstream`] is the real implementation, [`ScriptedUpstream`] a
//! replayable double for tests.

mod error;
mod http;
mod mock;
pub mod sse;
mod traits;
mod wire;

pub use error::{UpstreamError, UpstreamResult};
pub use http::HttpUpstream;
pub use mock::{RecordedRequest, ScriptedReply, ScriptedUpstream};
pub use traits::{Authorization, HttpMethod, LineStream, RequestBody, Upstream, UpstreamRequest};
pub use wire::{StreamDecoder, TurnRequest, UpstreamEvent, WireFormat};

//! Per-model resolution: reasoning-effort ceilings and upstream wire format

mod effort;
mod endpoint;

pub use effort::{is_effort_rejection, ReasoningEffortResolver};
pub use endpoint::{ModelEndpointResolver, ModelProfile};

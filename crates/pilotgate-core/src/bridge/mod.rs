//! Tool bridge: a child process exposing tools over line-delimited JSON-RPC
//!
//! ```text
//!   orchestrator ──► ToolRegistry ──► ToolBridge ──stdin──► child
//!                                        ▲                    │
//!                                        └── reader ◄─stdout──┘
//! ```

mod client;
mod protocol;

pub use client::ToolBridge;

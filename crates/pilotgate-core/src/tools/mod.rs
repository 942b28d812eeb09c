//! Tool management module
//!
//! Tool discovery, permission policy and execution for model tool calls.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  ToolRegistry                               │
//! │                                             │
//! │  - Lists tools via the backend              │
//! │  - Filters them with the ToolPolicy         │
//! │  - Checks calls before dispatch             │
//! │  - Folds failures into error results        │
//! └─────────────────────────────────────────────┘
//!           │
//!           │ ToolBackend (list_tools, call_tool)
//!           ▼
//! ┌─────────────────────────────────────────────┐
//! │  ToolBridge (child process, JSON-RPC/stdio) │
//! │  or MockToolBackend in tests                │
//! └─────────────────────────────────────────────┘
//! ```

mod backend;
mod error;
mod policy;
mod registry;

pub use backend::{MockToolBackend, ToolBackend};
pub use error::{ToolError, ToolsResult};
pub use policy::ToolPolicy;
pub use registry::ToolRegistry;

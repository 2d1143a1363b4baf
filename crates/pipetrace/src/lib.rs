//! Tracing and remote-debugging proxy for the `pipe` rendering API.
//!
//! [`wrap_screen`] puts a [`ProxyScreen`] in front of a backend [`pipe::Screen`]. Every call that
//! passes through it is recorded into an XML trace, and an optional debug server lets a remote
//! tool inspect textures, pause draws and hot-swap shaders while the application runs.

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod debug;
pub mod logging;
pub mod pipe;
pub mod registry;
pub mod resource;
mod screen;
pub mod trace;

pub use config::{parse_block_flags, ConfigError, TraceConfig};
pub use context::block::{BlockFlags, DrawRule};
pub use context::ProxyContext;
pub use debug::{DebugServer, DebugServerConfig, DebugServerError};
pub use screen::{wrap_screen, ProxyScreen, WrapError};
pub use trace::{TraceError, TraceWriter};

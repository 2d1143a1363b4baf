//! Remote debug server.
//!
//! One dedicated thread accepts one TCP client at a time and answers `pipetrace-protocol`
//! requests against the live screen: enumerate textures and contexts, read texture contents,
//! pause and step draws, disable or hot-replace shaders.

mod dispatch;
mod server;

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use pipetrace_protocol::{Limits, DEFAULT_PORT};

use crate::context::block::BlockFlags;
use crate::pipe::Handle;

pub use server::DebugServer;

/// Notifications from draw threads to the debug client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEvent {
    DrawBlocked { context: Handle, blocked: BlockFlags },
}

impl DebugEvent {
    fn to_wire(self) -> pipetrace_protocol::Event {
        match self {
            DebugEvent::DrawBlocked { context, blocked } => {
                pipetrace_protocol::Event::DrawBlocked {
                    context: context.get(),
                    blocked: blocked.bits(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugServerConfig {
    pub bind_addr: IpAddr,
    /// First candidate port. 0 binds an OS-assigned port.
    pub port: u16,
    /// Number of consecutive ports tried, starting at `port`.
    pub port_retries: u16,
    /// How often the server thread checks for shutdown and pending events.
    pub poll_interval: Duration,
    pub limits: Limits,
}

impl Default for DebugServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            port_retries: 10,
            poll_interval: Duration::from_millis(50),
            limits: Limits::default(),
        }
    }
}

impl DebugServerConfig {
    /// Loopback, OS-assigned port.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            port_retries: 1,
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DebugServerError {
    #[error("no free debug port on {addr} in {first}..{first}+{attempts}: {source}")]
    NoPortAvailable {
        addr: IpAddr,
        first: u16,
        attempts: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure debug listener: {0}")]
    Io(#[from] io::Error),

    #[error("failed to spawn debug server thread: {0}")]
    Spawn(#[source] io::Error),
}

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pipetrace_protocol::{encode_event, FrameParser, Limits};

use super::dispatch::handle_frame;
use super::{DebugEvent, DebugServerConfig, DebugServerError};
use crate::screen::ScreenShared;

/// Events queued beyond this are dropped rather than stalling draw threads.
const EVENT_QUEUE_DEPTH: usize = 256;

const READ_BUF_LEN: usize = 64 * 1024;

/// Handle to the running debug server thread. Dropping it stops the thread.
///
/// Stopping never releases paused draws: a draw blocked by the debugger stays blocked until it is
/// stepped or unblocked (by a later client) or its context is destroyed.
pub struct DebugServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DebugServer {
    /// Bind the listener and spawn the `pipetrace-debug` thread.
    pub(crate) fn start(
        screen: Arc<ScreenShared>,
        config: DebugServerConfig,
    ) -> Result<Self, DebugServerError> {
        let listener = bind(&config)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        screen.attach_events(tx);

        let running = Arc::new(AtomicBool::new(true));
        let spawned = thread::Builder::new()
            .name("pipetrace-debug".to_owned())
            .spawn({
                let screen = Arc::clone(&screen);
                let running = Arc::clone(&running);
                move || run(listener, screen, rx, running, config)
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                screen.detach_events();
                return Err(DebugServerError::Spawn(err));
            }
        };

        tracing::info!(%addr, "debug server listening");
        Ok(Self {
            addr,
            running,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("debug server thread panicked");
            }
            tracing::info!(addr = %self.addr, "debug server stopped");
        }
    }
}

impl Drop for DebugServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind(config: &DebugServerConfig) -> Result<TcpListener, DebugServerError> {
    let attempts = if config.port == 0 {
        1
    } else {
        config.port_retries.max(1)
    };

    let mut last_err = io::Error::from(io::ErrorKind::AddrNotAvailable);
    for offset in 0..attempts {
        let Some(port) = config.port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((config.bind_addr, port)) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                tracing::debug!(port, "debug port unavailable: {err}");
                last_err = err;
            }
        }
    }

    Err(DebugServerError::NoPortAvailable {
        addr: config.bind_addr,
        first: config.port,
        attempts,
        source: last_err,
    })
}

fn run(
    listener: TcpListener,
    screen: Arc<ScreenShared>,
    events: Receiver<DebugEvent>,
    running: Arc<AtomicBool>,
    config: DebugServerConfig,
) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "debug client connected");
                let mut conn = Connection {
                    stream,
                    screen: &screen,
                    events: &events,
                    running: &running,
                    limits: config.limits,
                };
                match conn.serve(config.poll_interval) {
                    Ok(()) => tracing::debug!(%peer, "debug client disconnected"),
                    Err(err) => tracing::debug!(%peer, "debug connection closed: {err}"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Nobody is listening; stale events are meaningless to the next client.
                while events.try_recv().is_ok() {}
                thread::sleep(config.poll_interval);
            }
            Err(err) => {
                tracing::warn!("debug accept failed: {err}");
                thread::sleep(config.poll_interval);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] pipetrace_protocol::Error),
}

struct Connection<'a> {
    stream: TcpStream,
    screen: &'a ScreenShared,
    events: &'a Receiver<DebugEvent>,
    running: &'a AtomicBool,
    limits: Limits,
}

impl Connection<'_> {
    fn serve(&mut self, poll_interval: Duration) -> Result<(), ConnectionError> {
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(poll_interval))?;
        self.stream.set_nodelay(true)?;

        let mut parser = FrameParser::with_limits(self.limits);
        let mut buf = vec![0u8; READ_BUF_LEN];

        while self.running.load(Ordering::Acquire) {
            self.forward_events()?;

            let n = match self.stream.read(&mut buf) {
                Ok(0) => {
                    parser.finish()?;
                    return Ok(());
                }
                Ok(n) => n,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            // An oversized frame loses framing; the connection cannot continue.
            for frame in parser.push(&buf[..n])? {
                let reply = handle_frame(self.screen, &frame, &self.limits);
                self.stream.write_all(&reply)?;
            }
        }
        Ok(())
    }

    fn forward_events(&mut self) -> io::Result<()> {
        while let Ok(event) = self.events.try_recv() {
            self.stream.write_all(&encode_event(&event.to_wire()))?;
        }
        Ok(())
    }
}

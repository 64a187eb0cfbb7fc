//! Signal handling for graceful shutdown.
//!
//! First SIGINT (Ctrl-C) or SIGTERM: stop the monitor and let it kill the
//! probe and exit cleanly. A second signal while shutting down exits at once.
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Which signal triggered shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Shutdown::Interrupt => f.write_str("SIGINT"),
            Shutdown::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Listens for SIGINT and SIGTERM.
pub struct SignalHandler {
    interrupt: Signal,
    terminate: Signal,
}

impl SignalHandler {
    /// Register the handlers. Must be called from within a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next shutdown signal.
    pub async fn recv(&mut self) -> Shutdown {
        tokio::select! {
            _ = self.interrupt.recv() => Shutdown::Interrupt,
            _ = self.terminate.recv() => Shutdown::Terminate,
        }
    }
}

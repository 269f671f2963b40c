use tracing::info;

/// Listeners for the signals that ask the agent to terminate.
///
/// Installing happens up front so a failure can be reported before any
/// unit runs.
#[cfg(unix)]
pub struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    /// Register SIGINT and SIGTERM listeners.
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Resolves once SIGINT or SIGTERM arrives.
    pub async fn recv(mut self) {
        let received = tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        };
        info!(signal = received, "termination requested");
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    pub async fn recv(mut self) {
        self.ctrl_c.recv().await;
        info!(signal = "ctrl-c", "termination requested");
    }
}

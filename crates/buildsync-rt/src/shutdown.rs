//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Process-wide set-once shutdown signal."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

/// Set-once broadcast condition observed by every control loop.
///
/// Once triggered it never reverts. Cloning shares the same condition.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request shutdown. Returns `true` only for the call that set the flag.
    pub fn trigger(&self) -> bool {
        self.sender.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Subscribe a new observer.
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }
}

/// One observer of a [`ShutdownSignal`]. Each loop owns its own listener.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown has been requested. Resolves immediately if it
    /// already was, or if every signal handle has been dropped.
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|fired| *fired).await;
    }

    /// Consuming variant of [`ShutdownListener::wait`], handy as a graceful
    /// shutdown future.
    pub async fn cancelled(mut self) {
        self.wait().await
    }
}

/// Register SIGINT and SIGTERM once and fan the first arrival out through `signal`.
///
/// Registration happens before this returns so that a failure is a startup error.
/// The listener task also exits when shutdown is triggered by other means.
pub fn spawn_signal_listener(signal: ShutdownSignal) -> std::io::Result<JoinHandle<()>> {
    let mut termination = TerminationSignals::register()?;
    let mut listener = signal.listener();
    Ok(tokio::spawn(async move {
        tokio::select! {
            name = termination.recv() => {
                info!(signal = name, "termination signal received; operator is shutting down");
                signal.trigger();
            }
            _ = listener.wait() => {
                debug!("shutdown triggered internally; signal listener exiting");
            }
        }
    }
    .in_current_span()))
}

#[cfg(unix)]
struct TerminationSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}

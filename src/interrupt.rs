//! Interrupt notifications shared between the Ctrl-C listener and running
//! tunnel sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 8;

/// Broadcast handle for user interrupts.
///
/// Clones share the same channel, so a notification reaches every subscriber
/// no matter which clone raised it.
#[derive(Clone, Debug)]
pub struct Interrupts {
    sender: broadcast::Sender<()>,
    listening: Arc<AtomicBool>,
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupts {
    /// Creates a channel with no subscribers and no signal listener.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            listening: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribes to future notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Delivers an interrupt to every current subscriber and returns how many
    /// received it.
    pub fn notify(&self) -> usize {
        self.sender.send(()).unwrap_or(0)
    }

    /// Starts forwarding process interrupts (`SIGINT`, `SIGTERM` on Unix;
    /// Ctrl-C elsewhere) into this channel. Only the first call spawns the
    /// listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn forward_process_signals(&self) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let interrupts = self.clone();
        tokio::spawn(async move { interrupts.listen().await });
    }

    #[cfg(unix)]
    async fn listen(self) {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut interrupt, mut terminate) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
                (Err(err), _) | (_, Err(err)) => {
                    warn!(error = %err, "cannot listen for interrupts");
                    return;
                }
            };
        loop {
            tokio::select! {
                received = interrupt.recv() => if received.is_none() { break },
                received = terminate.recv() => if received.is_none() { break },
            }
            let delivered = self.notify();
            debug!(subscribers = delivered, "forwarded interrupt");
        }
    }

    #[cfg(not(unix))]
    async fn listen(self) {
        loop {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for interrupts");
                return;
            }
            let delivered = self.notify();
            debug!(subscribers = delivered, "forwarded interrupt");
        }
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::Result;

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    notify: Notify,
}

/// Cooperative shutdown flag shared by the stream consumer, the scheduler
/// and the signal handler. Once requested it stays requested.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        if !self.inner.requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Sets `signal` on Ctrl+C or SIGTERM. Handlers are registered before this
/// returns, so a registration failure is reported to the caller.
pub fn install_signal_handlers(signal: ShutdownSignal) -> Result<JoinHandle<()>> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            terminate.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C"),
                    Err(e) => {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                }
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
            _ = signal.wait() => return,
        }

        signal.request();
    }))
}

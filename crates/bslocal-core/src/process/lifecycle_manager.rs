//! Shutdown hooks for the controlling process
//!
//! Hooks are async callbacks registered while work is in progress (for
//! instance "stop the tunnel started for this command"). They run exactly
//! once, in reverse registration order, either when the owner calls
//! [`ShutdownHooks::run`] or when SIGINT/SIGTERM arrives after
//! [`ShutdownHooks::install_signal_handlers`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Hook = Box<dyn FnOnce() -> HookFuture + Send>;

#[derive(Default)]
struct Pending {
    /// Set once `run` has taken the hooks; later registrations run immediately
    closed: bool,
    hooks: Vec<(String, Hook)>,
}

#[derive(Default)]
struct Inner {
    pending: Mutex<Pending>,
    done: OnceCell<()>,
}

/// Run-once set of cleanup callbacks
#[derive(Clone, Default)]
pub struct ShutdownHooks {
    inner: Arc<Inner>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup callback.
    ///
    /// If the hooks have already run, the callback is executed right away.
    pub async fn register<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let boxed: Hook = Box::new(move || Box::pin(hook()) as HookFuture);

        let late = {
            let mut pending = lock(&self.inner.pending);
            if pending.closed {
                Some(boxed)
            } else {
                debug!(hook = %name, "Registered shutdown hook");
                pending.hooks.push((name.clone(), boxed));
                None
            }
        };

        if let Some(hook) = late {
            warn!(hook = %name, "Shutdown already happened, running hook immediately");
            hook().await;
        }
    }

    /// Run every registered hook once, newest first.
    ///
    /// Concurrent and repeated callers wait for the single execution.
    pub async fn run(&self) {
        self.inner
            .done
            .get_or_init(|| async {
                let hooks = {
                    let mut pending = lock(&self.inner.pending);
                    pending.closed = true;
                    std::mem::take(&mut pending.hooks)
                };

                info!(count = hooks.len(), "Running shutdown hooks");
                for (name, hook) in hooks.into_iter().rev() {
                    debug!(hook = %name, "Running shutdown hook");
                    hook().await;
                }
            })
            .await;
    }

    pub fn has_run(&self) -> bool {
        self.inner.done.initialized()
    }

    /// Run the hooks and exit when SIGINT or SIGTERM is received.
    ///
    /// The exit status is `128 + signal number`.
    pub fn install_signal_handlers(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            for (kind, label, number) in [
                (SignalKind::interrupt(), "SIGINT", 2),
                (SignalKind::terminate(), "SIGTERM", 15),
            ] {
                let mut stream = signal(kind)?;
                let hooks = self.clone();
                tokio::spawn(async move {
                    if stream.recv().await.is_none() {
                        error!(signal = label, "Signal stream was closed");
                        return;
                    }
                    warn!(signal = label, "Received signal, running shutdown hooks");
                    hooks.run().await;
                    std::process::exit(128 + number);
                });
            }

            info!("Signal handlers for SIGTERM and SIGINT installed");
        }

        #[cfg(not(unix))]
        {
            let hooks = self.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
                warn!("Received Ctrl+C, running shutdown hooks");
                hooks.run().await;
                std::process::exit(130);
            });

            info!("Ctrl+C handler installed");
        }

        Ok(())
    }
}

fn lock(mutex: &Mutex<Pending>) -> std::sync::MutexGuard<'_, Pending> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

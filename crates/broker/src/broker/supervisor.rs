//! Restart-on-panic supervision for the broker's long-running loops.
//!
//! Each supervised loop runs in its own task. When that task panics the
//! supervisor logs the payload, hands a [`PanicReport`] to the configured
//! [`PanicReporter`], waits `restart_delay`, and starts a fresh instance.
//! A loop that returns normally is not restarted.

use std::{
    any::Any,
    backtrace::Backtrace,
    future::Future,
    sync::{Arc, Mutex, Once},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

use crate::metrics;

tokio::task_local! {
    static PANIC_CAPTURE: Arc<Mutex<Option<CapturedPanic>>>;
}

#[derive(Debug, Clone)]
struct CapturedPanic {
    location: Option<String>,
    backtrace: String,
}

/// Everything known about one supervised-loop panic.
#[derive(Debug, Clone)]
pub struct PanicReport {
    pub loop_name: &'static str,
    pub message: String,
    pub location: Option<String>,
    pub backtrace: Option<String>,
    /// Restarts of this loop so far, including the one about to happen.
    pub restart_count: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Sink for panic reports, e.g. an external error tracker.
pub trait PanicReporter: Send + Sync + 'static {
    fn report(&self, report: &PanicReport);
}

/// Default reporter: one `error!` event per panic.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPanicReporter;

impl PanicReporter for TracingPanicReporter {
    fn report(&self, report: &PanicReport) {
        error!(
            loop_name = report.loop_name,
            restart_count = report.restart_count,
            location = report.location.as_deref().unwrap_or("unknown"),
            backtrace = report.backtrace.as_deref().unwrap_or(""),
            panic = %report.message,
            "supervised loop panicked; restarting with fresh state"
        );
    }
}

pub(crate) struct Supervisor {
    loop_name: &'static str,
    reporter: Arc<dyn PanicReporter>,
    restart_delay: Duration,
}

impl Supervisor {
    pub(crate) fn new(
        loop_name: &'static str,
        reporter: Arc<dyn PanicReporter>,
        restart_delay: Duration,
    ) -> Self {
        Self { loop_name, reporter, restart_delay }
    }

    /// Spawns `make_loop()` and respawns it after every panic.
    ///
    /// Aborting the returned handle also aborts the running instance.
    pub(crate) fn spawn<F, Fut>(self, mut make_loop: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        install_capture_hook();
        let Self { loop_name, reporter, restart_delay } = self;

        tokio::spawn(async move {
            let mut restart_count = 0_u64;
            loop {
                let capture = Arc::new(Mutex::new(None));
                let instance = tokio::spawn(PANIC_CAPTURE.scope(Arc::clone(&capture), make_loop()));
                let guard = AbortOnDrop(instance.abort_handle());

                let result = instance.await;
                drop(guard);

                match result {
                    Ok(()) => {
                        info!(loop_name, "supervised loop exited");
                        return;
                    }
                    Err(join_error) if join_error.is_panic() => {
                        restart_count += 1;
                        let message = panic_message(join_error.into_panic().as_ref());
                        let captured = capture.lock().ok().and_then(|mut slot| slot.take());
                        let report = PanicReport {
                            loop_name,
                            message,
                            location: captured.as_ref().and_then(|c| c.location.clone()),
                            backtrace: captured.map(|c| c.backtrace),
                            restart_count,
                            occurred_at: Utc::now(),
                        };
                        metrics::increment_loop_restarts(loop_name);
                        reporter.report(&report);

                        if !restart_delay.is_zero() {
                            tokio::time::sleep(restart_delay).await;
                        }
                    }
                    Err(_) => {
                        warn!(loop_name, "supervised loop was cancelled");
                        return;
                    }
                }
            }
        })
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Best-effort string form of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// Records location and backtrace for panics raised inside a supervised
// instance. Panics elsewhere fall straight through to the previous hook.
fn install_capture_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = PANIC_CAPTURE.try_with(|slot| {
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(CapturedPanic {
                        location: info.location().map(ToString::to_string),
                        backtrace: Backtrace::force_capture().to_string(),
                    });
                }
            });
            previous(info);
        }));
    });
}

//! Shutdown signalling.
//!
//! [`ShutdownSignal`] is a shared tri-state flag read by the connection
//! manager once per poll iteration. It is set programmatically or by the
//! listener thread started with [`install_signal_handlers`]:
//! SIGINT and SIGQUIT request an immediate shutdown, SIGHUP a drain.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use memstore_config::log_server_info;
use tokio::signal::unix::{signal, Signal, SignalKind};

const RUNNING: u8 = 0;
const IMMEDIATE: u8 = 1;
const DRAIN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Running,
    /// Stop accepting, finish in-flight requests, close everything
    Immediate,
    /// Keep serving until no connection is left
    Drain,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    state: Arc<AtomicU8>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> ShutdownMode {
        match self.state.load(Ordering::SeqCst) {
            IMMEDIATE => ShutdownMode::Immediate,
            DRAIN => ShutdownMode::Drain,
            _ => ShutdownMode::Running,
        }
    }

    /// Overrides a pending drain
    pub fn request_immediate(&self) {
        self.state.store(IMMEDIATE, Ordering::SeqCst);
    }

    /// Has no effect once an immediate shutdown was requested
    pub fn request_drain(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, DRAIN, Ordering::SeqCst, Ordering::SeqCst);
    }
}

struct SignalSet {
    interrupt: Signal,
    quit: Signal,
    hangup: Signal,
}

impl SignalSet {
    fn register() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn listen(mut self, shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                Some(()) = self.interrupt.recv() => {
                    log_server_info!("SIGINT received, shutting down");
                    shutdown.request_immediate();
                }
                Some(()) = self.quit.recv() => {
                    log_server_info!("SIGQUIT received, shutting down");
                    shutdown.request_immediate();
                }
                Some(()) = self.hangup.recv() => {
                    log_server_info!("SIGHUP received, draining connections");
                    shutdown.request_drain();
                }
                else => break,
            }
        }
    }
}

/// Route termination signals to `shutdown`.
///
/// Handlers are registered before this returns; a dedicated thread with a
/// single-threaded tokio runtime then waits for deliveries.
pub fn install_signal_handlers(shutdown: ShutdownSignal) -> anyhow::Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;

    let signals = {
        let _guard = runtime.enter();
        SignalSet::register().context("Failed to register signal handlers")?
    };

    let handle = thread::Builder::new()
        .name("memstore-signals".into())
        .spawn(move || runtime.block_on(signals.listen(shutdown)))
        .context("Failed to spawn signal thread")?;
    Ok(handle)
}

//! # memstore-server
//!
//! In-memory file store served over a Unix domain socket.
//!
//! One connection manager thread owns every client socket and polls them for
//! readiness. A readable connection travels through the request channel to a
//! worker, which serves one request against the shared [`store::FileStore`]
//! and sends the connection back through the resolved channel.
//!
//! ```text
//!            accept/poll               recv                  store op
//! clients ──► ConnectionManager ──► request channel ──► Worker ──► FileStore
//!                   ▲                                     │
//!                   └──────────── resolved channel ◄──────┘
//! ```

pub mod manager;
pub mod oplog;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod worker;

use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use memstore_config::{log_conn_warn, log_server_error, log_server_info, log_server_warn, Config};

use crate::manager::{ConnectionManager, ManagerSettings, Wakeup};
use crate::oplog::OpLog;
use crate::queue::{request_channel, resolved_channel};
use crate::shutdown::ShutdownSignal;
use crate::store::{FileStore, StoreLimits};
use crate::worker::{ReadPolicy, WorkerPool, WorkerShared};

pub use shutdown::{install_signal_handlers, ShutdownMode};

/// Statistics reported when the server stops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSummary {
    pub max_stored_bytes: usize,
    pub max_stored_files: usize,
    pub replaced_files: u64,
    /// Requests served, indexed by worker
    pub served_per_worker: Vec<u64>,
    pub max_concurrent_connections: usize,
}

/// A bound, not yet running server
pub struct Server {
    config: Config,
    listener: UnixListener,
    store: Arc<FileStore>,
    oplog: Arc<OpLog>,
    shutdown: ShutdownSignal,
}

impl Server {
    /// Validate `config`, bind the socket and open the operation log.
    ///
    /// A stale socket file left at the configured path is removed first.
    pub fn bind(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let socket_path = config.server.socket_path.clone();
        if socket_path.exists() {
            log_server_warn!(
                "Removing stale socket",
                path = tracing::field::display(socket_path.display())
            );
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Failed to remove {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;

        let oplog = Arc::new(
            OpLog::open(&config.log.file)
                .with_context(|| format!("Failed to open {}", config.log.file.display()))?,
        );
        let capacity_bytes = usize::try_from(config.storage.capacity_bytes)
            .context("capacity_bytes does not fit in memory")?;
        let store = Arc::new(FileStore::with_oplog(
            StoreLimits {
                capacity_bytes,
                max_files: config.storage.max_files,
            },
            oplog.clone(),
        ));

        log_server_info!(
            "Listening",
            socket = tracing::field::display(socket_path.display()),
            capacity_bytes = capacity_bytes,
            max_files = config.storage.max_files
        );

        Ok(Self {
            config,
            listener,
            store,
            oplog,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Handle used to stop [`run`](Self::run) from another thread
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn store(&self) -> Arc<FileStore> {
        self.store.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.server.socket_path
    }

    /// Serve until a shutdown is requested, then stop the workers, remove the
    /// socket file and append the summary to the operation log.
    pub fn run(self) -> Result<ServerSummary> {
        let Server {
            config,
            listener,
            store,
            oplog,
            shutdown,
        } = self;

        let (request_tx, request_rx) = request_channel();
        let (resolved_tx, resolved_rx) = resolved_channel();
        let wakeup = Arc::new(Wakeup::new().context("Failed to create wakeup channel")?);
        let client_timeout = config.server.client_timeout();
        // Workers re-check shutdown every time a blocked read times out
        let read_slice = config.server.poll_timeout().max(Duration::from_millis(1));

        let pool = WorkerPool::spawn(
            config.server.workers,
            WorkerShared {
                store: store.clone(),
                requests: request_rx,
                resolved: resolved_tx,
                wakeup: wakeup.clone(),
                reads: ReadPolicy {
                    shutdown: shutdown.clone(),
                    client_timeout,
                },
            },
        )
        .context("Failed to start workers")?;
        log_server_info!("Workers started", workers = config.server.workers);

        let leftovers = resolved_rx.clone();
        let manager = ConnectionManager::new(
            listener,
            store.clone(),
            request_tx,
            resolved_rx,
            wakeup,
            shutdown.clone(),
            ManagerSettings {
                max_connections: config.server.max_connections,
                poll_timeout_ms: config.server.poll_timeout_ms,
                read_slice,
                client_timeout,
            },
        );
        // The manager drops the request sender on return, which stops the workers
        let managed = manager.run();
        if let Err(e) = &managed {
            log_server_error!("Connection manager failed", error = tracing::field::display(e));
            shutdown.request_immediate();
        }

        let served_per_worker = pool.join();
        // Connections still out when the manager failed
        for leftover in leftovers.try_iter() {
            let id = leftover.conn.id;
            if let Err(e) = store.connection_closed(id) {
                log_conn_warn!(
                    "Store cleanup failed",
                    client = id.0,
                    error = tracing::field::display(&e)
                );
            }
        }

        if let Err(e) = std::fs::remove_file(&config.server.socket_path) {
            log_server_warn!("Failed to remove socket", error = tracing::field::display(&e));
        }

        let peak = managed?;
        let stats = store.stats().context("Store state is poisoned")?;
        let summary = ServerSummary {
            max_stored_bytes: stats.max_stored_bytes,
            max_stored_files: stats.max_stored_files,
            replaced_files: stats.replaced_files,
            served_per_worker,
            max_concurrent_connections: peak,
        };
        oplog.write_summary(&summary);
        log_server_info!(
            "Server stopped",
            max_stored_bytes = summary.max_stored_bytes,
            max_stored_files = summary.max_stored_files,
            replaced_files = summary.replaced_files,
            max_connections = summary.max_concurrent_connections
        );
        Ok(summary)
    }
}

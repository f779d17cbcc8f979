//! Worker pool.
//!
//! Each worker receives a ready connection, serves exactly one framed request
//! against the store, writes the framed response and hands the connection
//! back through the resolved channel. Workers keep no per-connection state.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::SendError;
use memstore_config::{log_worker_debug, log_worker_error, log_worker_warn};
use memstore_ipc::{read_frame_until, write_frame, Request, Response, Status};

use crate::manager::Wakeup;
use crate::queue::{Connection, Disposition, RequestReceiver, Resolved, ResolvedSender};
use crate::shutdown::{ShutdownMode, ShutdownSignal};
use crate::store::{ClientId, FileStore, StoreError, StoredFile};

// ============================================================================
// Dispatch
// ============================================================================

/// Response status for a failed store operation
pub fn status_for(err: &StoreError) -> Status {
    match err {
        StoreError::NameTooLong(_) => Status::NameTooLong,
        StoreError::NotFound(_) => Status::NotFound,
        StoreError::AlreadyExists(_) => Status::AlreadyExists,
        StoreError::AlreadyOpen(_) => Status::AlreadyOpen,
        StoreError::NotOpened(_) => Status::NotOpened,
        StoreError::Locked(_) | StoreError::LockNotHeld(_) => Status::Locked,
        StoreError::OutOfMemory => Status::OutOfMemory,
        StoreError::InvalidName | StoreError::Poisoned => Status::Unknown,
    }
}

fn files_response(files: Vec<StoredFile>) -> Response {
    Response::with_files(files.into_iter().map(|f| (f.name, f.content)))
}

/// Run one decoded request against the store on behalf of `client`
pub fn dispatch(store: &FileStore, client: ClientId, request: Request) -> (Response, Disposition) {
    let result = match request {
        Request::CloseConnection => return (Response::ok(), Disposition::Close),
        Request::Open { path, flags } => store.open(client, &path, flags).map(files_response),
        Request::Close { path } => store.close(client, &path).map(|()| Response::ok()),
        Request::Write { path, content } => {
            store.write(client, &path, content).map(files_response)
        }
        Request::WriteNoContent { path } => {
            store.write(client, &path, Vec::new()).map(files_response)
        }
        Request::Append { path, content } => {
            store.append(client, &path, content).map(files_response)
        }
        Request::Read { path } => store.read(client, &path).map(Response::with_content),
        Request::ReadN { count } => store.read_n(client, count).map(files_response),
        Request::Lock { path } => store.lock(client, &path).map(|()| Response::ok()),
        Request::Unlock { path } => store.unlock(client, &path).map(|()| Response::ok()),
        Request::Remove { path } => store.remove(client, &path).map(|()| Response::ok()),
    };

    let response = result.unwrap_or_else(|err| {
        log_worker_debug!(
            "Request refused",
            client = client.0,
            reason = tracing::field::display(&err)
        );
        Response::error(status_for(&err))
    });
    (response, Disposition::KeepOpen)
}

/// When a worker stops waiting for the rest of a request.
///
/// Streams carry a short read timeout; each time it elapses the worker checks
/// for an immediate shutdown and for the client timeout.
#[derive(Debug, Clone)]
pub struct ReadPolicy {
    pub shutdown: ShutdownSignal,
    /// Zero waits for the client indefinitely
    pub client_timeout: Duration,
}

impl ReadPolicy {
    fn should_abandon(&self, started: Instant) -> bool {
        self.shutdown.mode() == ShutdownMode::Immediate
            || (!self.client_timeout.is_zero() && started.elapsed() >= self.client_timeout)
    }
}

/// Read, execute and answer one request on `conn`.
///
/// Any I/O failure on the connection (peer gone, timeout, oversized frame)
/// closes it without a response, as does an immediate shutdown arriving
/// before the request is complete. Once read, a request always runs to
/// completion.
pub fn serve_one(
    store: &FileStore,
    conn: &mut Connection,
    served: &AtomicU64,
    policy: &ReadPolicy,
) -> Disposition {
    let started = Instant::now();
    let payload = match read_frame_until(&mut conn.stream, || policy.should_abandon(started)) {
        Ok(payload) => payload,
        Err(e) => {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                log_worker_debug!(
                    "Read failed",
                    client = conn.id.0,
                    error = tracing::field::display(&e)
                );
            }
            return Disposition::Close;
        }
    };

    let (response, disposition) = match Request::decode(&payload) {
        Ok(request) => dispatch(store, conn.id, request),
        Err(e) => {
            log_worker_warn!(
                "Malformed request",
                client = conn.id.0,
                error = tracing::field::display(&e)
            );
            (Response::error(e.status()), Disposition::KeepOpen)
        }
    };
    served.fetch_add(1, Ordering::Relaxed);

    if let Err(e) = write_frame(&mut conn.stream, &response.encode()) {
        log_worker_debug!(
            "Write failed",
            client = conn.id.0,
            error = tracing::field::display(&e)
        );
        return Disposition::Close;
    }
    disposition
}

// ============================================================================
// Worker Pool
// ============================================================================

#[derive(Clone)]
pub(crate) struct WorkerShared {
    pub store: Arc<FileStore>,
    pub requests: RequestReceiver,
    pub resolved: ResolvedSender,
    pub wakeup: Arc<Wakeup>,
    pub reads: ReadPolicy,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    served: Arc<Vec<AtomicU64>>,
}

impl WorkerPool {
    /// Start `count` workers. They run until every request sender is dropped.
    /// If a thread fails to start, the ones already running exit the same way.
    pub(crate) fn spawn(count: usize, shared: WorkerShared) -> io::Result<Self> {
        let served: Arc<Vec<AtomicU64>> = Arc::new((0..count).map(|_| AtomicU64::new(0)).collect());
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let worker_shared = shared.clone();
            let worker_served = served.clone();
            let spawned = thread::Builder::new()
                .name(format!("memstore-worker-{}", index))
                .spawn(move || worker_loop(index, worker_shared, &worker_served[index]));
            handles.push(spawned?);
        }

        Ok(Self { handles, served })
    }

    /// Wait for every worker to exit. The request sender must already be dropped.
    pub fn join(self) -> Vec<u64> {
        for (index, handle) in self.handles.into_iter().enumerate() {
            if handle.join().is_err() {
                log_worker_error!("Worker panicked", worker = index);
            }
        }
        self.served.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }
}

fn worker_loop(index: usize, shared: WorkerShared, served: &AtomicU64) {
    log_worker_debug!("Worker started", worker = index);

    while let Ok(mut conn) = shared.requests.recv() {
        let disposition = serve_one(&shared.store, &mut conn, served, &shared.reads);
        if let Err(SendError(rejected)) = shared.resolved.send(Resolved { conn, disposition }) {
            // Manager is gone; nobody else will clean up after this client.
            let id = rejected.conn.id;
            if let Err(e) = shared.store.connection_closed(id) {
                log_worker_error!(
                    "Cleanup failed",
                    client = id.0,
                    error = tracing::field::display(&e)
                );
            }
            continue;
        }
        shared.wakeup.notify();
    }

    log_worker_debug!("Worker exiting", worker = index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreLimits;
    use crate::queue::{request_channel, resolved_channel};
    use memstore_ipc::{read_frame, OpenFlags, FIELD_SEPARATOR};
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn patient() -> ReadPolicy {
        ReadPolicy {
            shutdown: ShutdownSignal::new(),
            client_timeout: Duration::ZERO,
        }
    }

    fn store() -> FileStore {
        FileStore::new(StoreLimits {
            capacity_bytes: 10,
            max_files: 8,
        })
    }

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    fn open(path: &str, flags: OpenFlags) -> Request {
        Request::Open {
            path: path.into(),
            flags,
        }
    }

    #[test]
    fn test_dispatch_scenario_open_write_read_close() {
        let store = store();
        let (resp, disp) = dispatch(&store, A, open("/a", OpenFlags::CREATE | OpenFlags::LOCK));
        assert_eq!(resp, Response::ok());
        assert_eq!(disp, Disposition::KeepOpen);

        let (resp, _) = dispatch(
            &store,
            A,
            Request::Write {
                path: "/a".into(),
                content: b"hello".to_vec(),
            },
        );
        assert!(resp.is_success());
        assert!(resp.files().is_empty());

        let (resp, _) = dispatch(&store, A, Request::Read { path: "/a".into() });
        assert_eq!(resp.content(), b"hello");

        let (resp, _) = dispatch(&store, A, Request::Close { path: "/a".into() });
        assert!(resp.is_success());
    }

    #[test]
    fn test_dispatch_maps_errors_to_statuses() {
        let store = store();
        let (resp, disp) = dispatch(&store, A, Request::Read { path: "/x".into() });
        assert_eq!(resp.status, Status::NotFound);
        assert_eq!(disp, Disposition::KeepOpen);

        dispatch(&store, A, open("/x", OpenFlags::CREATE));
        let (resp, _) = dispatch(&store, A, open("/x", OpenFlags::NONE));
        assert_eq!(resp.status, Status::AlreadyOpen);
        let (resp, _) = dispatch(&store, B, open("/x", OpenFlags::CREATE));
        assert_eq!(resp.status, Status::AlreadyExists);
        let (resp, _) = dispatch(&store, B, Request::WriteNoContent { path: "/x".into() });
        assert_eq!(resp.status, Status::NotOpened);

        dispatch(&store, A, Request::Lock { path: "/x".into() });
        let (resp, _) = dispatch(&store, B, Request::Lock { path: "/x".into() });
        assert_eq!(resp.status, Status::Locked);
        let (resp, _) = dispatch(&store, B, Request::Remove { path: "/x".into() });
        assert_eq!(resp.status, Status::Locked);

        let (resp, _) = dispatch(
            &store,
            A,
            Request::Write {
                path: "/x".into(),
                content: vec![0; 11],
            },
        );
        assert_eq!(resp.status, Status::OutOfMemory);
    }

    #[test]
    fn test_dispatch_returns_ejected_files() {
        let store = store();
        for (name, content) in [("x", b"xxxxxx"), ("y", b"yyyyyy")] {
            dispatch(&store, A, open(name, OpenFlags::CREATE));
            let (resp, _) = dispatch(
                &store,
                A,
                Request::Write {
                    path: name.into(),
                    content: content.to_vec(),
                },
            );
            if name == "y" {
                assert_eq!(resp.files(), vec![("x".to_string(), b"xxxxxx".to_vec())]);
            }
        }
    }

    #[test]
    fn test_dispatch_close_connection() {
        let store = store();
        let (resp, disp) = dispatch(&store, A, Request::CloseConnection);
        assert!(resp.is_success());
        assert_eq!(disp, Disposition::Close);
    }

    #[test]
    fn test_status_mapping_is_total() {
        assert_eq!(status_for(&StoreError::LockNotHeld("/a".into())), Status::Locked);
        assert_eq!(status_for(&StoreError::InvalidName), Status::Unknown);
        assert_eq!(status_for(&StoreError::Poisoned), Status::Unknown);
        assert_eq!(status_for(&StoreError::NameTooLong(200)), Status::NameTooLong);
    }

    #[test]
    fn test_serve_one_over_socket_pair() {
        let store = store();
        let served = AtomicU64::new(0);
        let policy = patient();
        let (server_side, mut client_side) = UnixStream::pair().unwrap();
        let mut conn = Connection {
            id: A,
            stream: server_side,
        };

        write_frame(&mut client_side, &open("/s", OpenFlags::CREATE).encode()).unwrap();
        assert_eq!(serve_one(&store, &mut conn, &served, &policy), Disposition::KeepOpen);
        let reply = Response::decode(&read_frame(&mut client_side).unwrap()).unwrap();
        assert!(reply.is_success());

        // Malformed payloads are answered and keep the connection open
        let mut bad = b"4".to_vec();
        bad.push(FIELD_SEPARATOR);
        bad.extend(std::iter::repeat(b'n').take(200));
        write_frame(&mut client_side, &bad).unwrap();
        assert_eq!(serve_one(&store, &mut conn, &served, &policy), Disposition::KeepOpen);
        let reply = Response::decode(&read_frame(&mut client_side).unwrap()).unwrap();
        assert_eq!(reply.status, Status::NameTooLong);

        write_frame(&mut client_side, b"99").unwrap();
        serve_one(&store, &mut conn, &served, &policy);
        let reply = Response::decode(&read_frame(&mut client_side).unwrap()).unwrap();
        assert_eq!(reply.status, Status::Unknown);

        assert_eq!(served.load(Ordering::Relaxed), 3);

        // Peer hang-up closes without a response
        drop(client_side);
        assert_eq!(serve_one(&store, &mut conn, &served, &policy), Disposition::Close);
        assert_eq!(served.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_partial_request_is_dropped_on_immediate_shutdown() {
        let store = store();
        let served = AtomicU64::new(0);
        let policy = patient();
        let (server_side, mut client_side) = UnixStream::pair().unwrap();
        server_side
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let mut conn = Connection {
            id: A,
            stream: server_side,
        };

        client_side.write_all(&[5, 0]).unwrap();
        policy.shutdown.request_immediate();

        let start = Instant::now();
        assert_eq!(serve_one(&store, &mut conn, &served, &policy), Disposition::Close);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(served.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_partial_request_times_out() {
        let store = store();
        let served = AtomicU64::new(0);
        let policy = ReadPolicy {
            shutdown: ShutdownSignal::new(),
            client_timeout: Duration::from_millis(50),
        };
        let (server_side, mut client_side) = UnixStream::pair().unwrap();
        server_side
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let mut conn = Connection {
            id: A,
            stream: server_side,
        };

        client_side.write_all(&[5, 0, 0]).unwrap();
        assert_eq!(serve_one(&store, &mut conn, &served, &policy), Disposition::Close);
    }

    #[test]
    fn test_pool_serves_and_exits_when_sender_dropped() {
        let store = Arc::new(store());
        let (request_tx, request_rx) = request_channel();
        let (resolved_tx, resolved_rx) = resolved_channel();
        let pool = WorkerPool::spawn(
            2,
            WorkerShared {
                store: store.clone(),
                requests: request_rx,
                resolved: resolved_tx,
                wakeup: Arc::new(Wakeup::new().unwrap()),
                reads: patient(),
            },
        )
        .unwrap();

        let (server_side, mut client_side) = UnixStream::pair().unwrap();
        write_frame(&mut client_side, &open("/p", OpenFlags::CREATE).encode()).unwrap();
        request_tx
            .send(Connection {
                id: A,
                stream: server_side,
            })
            .unwrap();

        let resolved = resolved_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(resolved.conn.id, A);
        assert_eq!(resolved.disposition, Disposition::KeepOpen);
        assert!(Response::decode(&read_frame(&mut client_side).unwrap())
            .unwrap()
            .is_success());

        drop(request_tx);
        let served = pool.join();
        assert_eq!(served.len(), 2);
        assert_eq!(served.iter().sum::<u64>(), 1);
    }
}

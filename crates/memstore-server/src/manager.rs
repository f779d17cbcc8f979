//! Connection manager: the single control loop that owns every client socket.
//!
//! Each iteration accepts at most one connection, polls the idle ones and
//! hands readable connections to the workers, takes finished connections back
//! from the resolved channel, and closes connections idle for too long. Workers
//! nudge the loop through a [`Wakeup`] socket pair so a returned connection is
//! polled again without waiting out the poll timeout.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{RecvTimeoutError, SendError};
use memstore_config::{log_conn_debug, log_conn_warn, log_server_info, log_server_warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::queue::{Connection, Disposition, RequestSender, Resolved, ResolvedReceiver};
use crate::shutdown::{ShutdownMode, ShutdownSignal};
use crate::store::{ClientId, FileStore};

/// Self-pipe used by workers to interrupt the manager's poll
pub(crate) struct Wakeup {
    reader: UnixStream,
    writer: UnixStream,
}

impl Wakeup {
    pub(crate) fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    pub(crate) fn notify(&self) {
        // A full buffer already guarantees a pending wakeup
        let _ = (&self.writer).write(&[1]);
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.reader).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

pub(crate) struct ManagerSettings {
    pub max_connections: usize,
    pub poll_timeout_ms: u16,
    /// Socket read timeout; workers check for shutdown each time it elapses
    pub read_slice: Duration,
    /// Zero disables the idle timeout
    pub client_timeout: Duration,
}

struct Slot {
    /// `None` while a worker holds the connection
    stream: Option<UnixStream>,
    last_active: Instant,
}

pub(crate) struct ConnectionManager {
    listener: Option<UnixListener>,
    store: Arc<FileStore>,
    /// Dropped to stop the workers
    requests: Option<RequestSender>,
    resolved: ResolvedReceiver,
    wakeup: Arc<Wakeup>,
    shutdown: ShutdownSignal,
    settings: ManagerSettings,
    slots: HashMap<ClientId, Slot>,
    next_id: u64,
    in_flight: usize,
    peak_connections: usize,
}

impl ConnectionManager {
    pub(crate) fn new(
        listener: UnixListener,
        store: Arc<FileStore>,
        requests: RequestSender,
        resolved: ResolvedReceiver,
        wakeup: Arc<Wakeup>,
        shutdown: ShutdownSignal,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            listener: Some(listener),
            store,
            requests: Some(requests),
            resolved,
            wakeup,
            shutdown,
            settings,
            slots: HashMap::new(),
            next_id: 0,
            in_flight: 0,
            peak_connections: 0,
        }
    }

    /// Run until shutdown. Returns the peak number of simultaneous connections.
    pub(crate) fn run(mut self) -> anyhow::Result<usize> {
        log_server_info!(
            "Connection manager running",
            max_connections = self.settings.max_connections,
            poll_timeout_ms = self.settings.poll_timeout_ms
        );
        let result = self.serve();
        self.close_all();
        result.map(|()| self.peak_connections)
    }

    fn serve(&mut self) -> anyhow::Result<()> {
        loop {
            match self.shutdown.mode() {
                ShutdownMode::Immediate => {
                    self.stop_accepting();
                    self.requests = None;
                    if self.in_flight == 0 {
                        return Ok(());
                    }
                    let wait = Duration::from_millis(u64::from(self.settings.poll_timeout_ms));
                    match self.resolved.recv_timeout(wait) {
                        Ok(resolved) => self.reintegrate(resolved, true),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            log_server_warn!(
                                "Workers gone with requests in flight",
                                in_flight = self.in_flight
                            );
                            return Ok(());
                        }
                    }
                    continue;
                }
                ShutdownMode::Drain if self.slots.is_empty() => {
                    self.stop_accepting();
                    return Ok(());
                }
                _ => {}
            }

            self.accept_one();
            self.dispatch_ready()?;
            while let Ok(resolved) = self.resolved.try_recv() {
                self.reintegrate(resolved, false);
            }
            self.close_idle();
        }
    }

    fn stop_accepting(&mut self) {
        if self.listener.take().is_some() {
            log_server_info!("Stopped accepting connections", active = self.slots.len());
        }
    }

    fn can_accept(&self) -> bool {
        self.listener.is_some() && self.slots.len() < self.settings.max_connections
    }

    fn accept_one(&mut self) {
        if !self.can_accept() {
            return;
        }
        let Some(listener) = &self.listener else {
            return;
        };
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log_conn_warn!("Accept failed", error = tracing::field::display(&e));
                return;
            }
        };
        if let Err(e) = prepare_stream(&stream, &self.settings) {
            log_conn_warn!(
                "Failed to configure connection",
                error = tracing::field::display(&e)
            );
            return;
        }

        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.slots.insert(
            id,
            Slot {
                stream: Some(stream),
                last_active: Instant::now(),
            },
        );
        self.peak_connections = self.peak_connections.max(self.slots.len());
        log_conn_debug!("Connection accepted", client = id.0, active = self.slots.len());
    }

    fn dispatch_ready(&mut self) -> anyhow::Result<()> {
        let mut ids = Vec::with_capacity(self.slots.len());
        let (readable, hung_up) = {
            let mut fds = Vec::with_capacity(self.slots.len() + 2);
            fds.push(PollFd::new(self.wakeup.reader.as_fd(), PollFlags::POLLIN));
            if self.can_accept() {
                if let Some(listener) = &self.listener {
                    fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
                }
            }
            let offset = fds.len();
            for (id, slot) in &self.slots {
                if let Some(stream) = &slot.stream {
                    fds.push(PollFd::new(stream.as_fd(), PollFlags::POLLIN));
                    ids.push(*id);
                }
            }

            match poll(&mut fds, PollTimeout::from(self.settings.poll_timeout_ms)) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(e).context("poll failed"),
            }

            if fds[0]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN))
            {
                self.wakeup.drain();
            }

            let mut readable = Vec::new();
            let mut hung_up = Vec::new();
            for (fd, id) in fds[offset..].iter().zip(&ids) {
                let Some(revents) = fd.revents() else {
                    continue;
                };
                if revents.contains(PollFlags::POLLIN) {
                    readable.push(*id);
                } else if revents
                    .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
                {
                    hung_up.push(*id);
                }
            }
            (readable, hung_up)
        };

        for id in readable {
            self.hand_off(id);
        }
        for id in hung_up {
            log_conn_debug!("Peer hung up", client = id.0);
            self.close_connection(id);
        }
        Ok(())
    }

    /// Move a readable connection into the request channel
    fn hand_off(&mut self, id: ClientId) {
        let Some(stream) = self.slots.get_mut(&id).and_then(|slot| slot.stream.take()) else {
            return;
        };
        let Some(requests) = &self.requests else {
            self.close_connection(id);
            return;
        };
        match requests.send(Connection { id, stream }) {
            Ok(()) => self.in_flight += 1,
            Err(SendError(conn)) => {
                drop(conn);
                self.close_connection(id);
            }
        }
    }

    fn reintegrate(&mut self, resolved: Resolved, closing: bool) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Resolved { conn, disposition } = resolved;

        if closing || disposition == Disposition::Close {
            drop(conn.stream);
            self.close_connection(conn.id);
            return;
        }
        let slot = self.slots.entry(conn.id).or_insert(Slot {
            stream: None,
            last_active: Instant::now(),
        });
        slot.stream = Some(conn.stream);
        slot.last_active = Instant::now();
    }

    fn close_idle(&mut self) {
        let timeout = self.settings.client_timeout;
        if timeout.is_zero() {
            return;
        }
        let now = Instant::now();
        let idle: Vec<ClientId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.stream.is_some() && now.duration_since(slot.last_active) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            log_conn_debug!("Closing idle connection", client = id.0);
            self.close_connection(id);
        }
    }

    /// Drop the socket and release everything the client held in the store
    fn close_connection(&mut self, id: ClientId) {
        self.slots.remove(&id);
        if let Err(e) = self.store.connection_closed(id) {
            log_conn_warn!(
                "Store cleanup failed",
                client = id.0,
                error = tracing::field::display(&e)
            );
        }
        log_conn_debug!("Connection closed", client = id.0, active = self.slots.len());
    }

    fn close_all(&mut self) {
        let ids: Vec<ClientId> = self.slots.keys().copied().collect();
        for id in ids {
            self.close_connection(id);
        }
    }
}

fn prepare_stream(stream: &UnixStream, settings: &ManagerSettings) -> io::Result<()> {
    // Some platforms hand out sockets inheriting the listener's O_NONBLOCK
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(settings.read_slice))?;
    let write_timeout = settings.client_timeout;
    stream.set_write_timeout((!write_timeout.is_zero()).then_some(write_timeout))?;
    Ok(())
}

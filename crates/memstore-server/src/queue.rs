//! Request and resolved channels.
//!
//! Connections travel manager → worker through the request channel and back
//! through the resolved channel. The stream moves with the message, so a
//! connection is owned by exactly one side at any time. Dropping the
//! manager's request sender is what tells the workers to exit.

use std::os::unix::net::UnixStream;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::store::ClientId;

/// A client connection handed to a worker for one request
#[derive(Debug)]
pub struct Connection {
    pub id: ClientId,
    pub stream: UnixStream,
}

/// What the manager should do with a connection after its request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepOpen,
    Close,
}

#[derive(Debug)]
pub struct Resolved {
    pub conn: Connection,
    pub disposition: Disposition,
}

pub type RequestSender = Sender<Connection>;
pub type RequestReceiver = Receiver<Connection>;
pub type ResolvedSender = Sender<Resolved>;
pub type ResolvedReceiver = Receiver<Resolved>;

pub fn request_channel() -> (RequestSender, RequestReceiver) {
    unbounded()
}

pub fn resolved_channel() -> (ResolvedSender, ResolvedReceiver) {
    unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{RecvTimeoutError, TryRecvError};
    use std::thread;
    use std::time::{Duration, Instant};

    fn connection(id: u64) -> (Connection, UnixStream) {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        (
            Connection {
                id: ClientId(id),
                stream: server_side,
            },
            client_side,
        )
    }

    #[test]
    fn test_requests_are_fifo() {
        let (tx, rx) = request_channel();
        let mut peers = Vec::new();
        for id in 0..5 {
            let (conn, peer) = connection(id);
            tx.send(conn).unwrap();
            peers.push(peer);
        }
        assert_eq!(rx.len(), 5);
        let order: Vec<u64> = rx.try_iter().map(|c| c.id.0).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_dropping_sender_drains_then_disconnects() {
        let (tx, rx) = request_channel();
        let (conn, _peer) = connection(9);
        tx.send(conn).unwrap();
        drop(tx);

        assert_eq!(rx.recv().unwrap().id, ClientId(9));
        assert!(rx.recv().is_err());
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }

    #[test]
    fn test_failed_send_hands_the_item_back() {
        let (tx, rx) = resolved_channel();
        drop(rx);
        let (conn, _peer) = connection(3);
        let rejected = tx
            .send(Resolved {
                conn,
                disposition: Disposition::KeepOpen,
            })
            .unwrap_err();
        assert_eq!(rejected.0.conn.id, ClientId(3));
    }

    #[test]
    fn test_recv_timeout_waits_for_a_worker() {
        let (tx, rx) = resolved_channel();
        let start = Instant::now();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(30)).unwrap_err(),
            RecvTimeoutError::Timeout
        );
        assert!(start.elapsed() >= Duration::from_millis(30));

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let (conn, peer) = connection(1);
            tx.send(Resolved {
                conn,
                disposition: Disposition::Close,
            })
            .unwrap();
            peer
        });
        let resolved = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(resolved.disposition, Disposition::Close);
        worker.join().unwrap();
    }

    #[test]
    fn test_many_workers_lose_nothing() {
        let (tx, rx) = request_channel();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let rx = rx.clone();
                thread::spawn(move || rx.iter().map(|c| c.id.0).collect::<Vec<_>>())
            })
            .collect();
        drop(rx);

        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    let mut peers = Vec::new();
                    for i in 0..25 {
                        let (conn, peer) = connection(p * 1000 + i);
                        tx.send(conn).unwrap();
                        peers.push(peer);
                    }
                    peers
                })
            })
            .collect();
        let peers: Vec<UnixStream> = producers
            .into_iter()
            .flat_map(|p| p.join().unwrap())
            .collect();
        drop(tx);

        let mut all: Vec<u64> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<u64> = (0..4u64)
            .flat_map(|p| (0..25).map(move |i| p * 1000 + i))
            .collect();
        assert_eq!(all, expected);
        assert_eq!(peers.len(), 100);
    }
}

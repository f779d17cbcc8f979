//! Client tests against a scripted in-process peer.
//!
//! The peer speaks the frame protocol directly, so these tests pin down what
//! the client puts on the wire and how it interprets replies.

use memstore_ipc::client::{ClientError, StoreClient};
use memstore_ipc::frame::{read_frame_async, write_frame_async};
use memstore_ipc::{OpenFlags, Request, Response, Status};
use tempfile::tempdir;
use tokio::net::UnixListener;

/// Accept one connection, answer each expected request with the paired reply
async fn scripted_peer(listener: UnixListener, script: Vec<(Request, Response)>) {
    let (mut stream, _) = listener.accept().await.unwrap();
    for (expected, reply) in script {
        let payload = read_frame_async(&mut stream).await.unwrap();
        assert_eq!(Request::decode(&payload).unwrap(), expected);
        write_frame_async(&mut stream, &reply.encode()).await.unwrap();
    }
}

#[tokio::test]
async fn test_open_write_read_round_trip() {
    let temp = tempdir().unwrap();
    let socket = temp.path().join("peer.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let peer = tokio::spawn(scripted_peer(
        listener,
        vec![
            (
                Request::Open {
                    path: "/a".into(),
                    flags: OpenFlags::CREATE | OpenFlags::LOCK,
                },
                Response::ok(),
            ),
            (
                Request::Write {
                    path: "/a".into(),
                    content: b"hello".to_vec(),
                },
                Response::with_files(vec![("/old".to_string(), b"evicted".to_vec())]),
            ),
            (
                Request::Read { path: "/a".into() },
                Response::with_content(b"hello".to_vec()),
            ),
            (Request::CloseConnection, Response::ok()),
        ],
    ));

    let mut client = StoreClient::connect_to(&socket).await.unwrap();
    let ejected = client
        .open_file("/a", OpenFlags::CREATE | OpenFlags::LOCK)
        .await
        .unwrap();
    assert!(ejected.is_empty());

    let ejected = client.write_file("/a", b"hello").await.unwrap();
    assert_eq!(ejected, vec![("/old".to_string(), b"evicted".to_vec())]);

    assert_eq!(client.read_file("/a").await.unwrap(), b"hello");
    client.close_connection().await.unwrap();

    peer.await.unwrap();
}

#[tokio::test]
async fn test_error_status_surfaces_as_client_error() {
    let temp = tempdir().unwrap();
    let socket = temp.path().join("peer.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let peer = tokio::spawn(scripted_peer(
        listener,
        vec![
            (
                Request::Lock { path: "/b".into() },
                Response::error(Status::Locked),
            ),
            (
                Request::ReadN { count: 0 },
                Response::with_files(vec![
                    ("/x".to_string(), b"1".to_vec()),
                    ("/y".to_string(), b"2".to_vec()),
                ]),
            ),
        ],
    ));

    let mut client = StoreClient::connect_to(&socket).await.unwrap();
    let err = client.lock_file("/b").await.unwrap_err();
    assert!(matches!(err, ClientError::Status(Status::Locked)));
    assert_eq!(err.status(), Some(Status::Locked));

    let files = client.read_n_files(0).await.unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[1], ("/y".to_string(), b"2".to_vec()));

    peer.await.unwrap();
}

#[tokio::test]
async fn test_connect_to_missing_socket_fails() {
    let temp = tempdir().unwrap();
    let result = StoreClient::connect_to(temp.path().join("absent.sock")).await;
    assert!(matches!(result, Err(ClientError::Io(_))));
}

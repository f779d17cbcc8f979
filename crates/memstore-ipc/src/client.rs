//! Async client for the memstore server

use std::io;
use std::path::Path;

use thiserror::Error;
use tokio::net::UnixStream;

use crate::frame::{read_frame_async, write_frame_async};
use crate::protocol::{OpenFlags, ProtocolError, Request, Response, Status};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server replied: {0}")]
    Status(Status),
}

impl ClientError {
    /// Status code of a server-side refusal, if that is what this is
    pub fn status(&self) -> Option<Status> {
        match self {
            ClientError::Status(status) => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A file returned by the server, either read back or ejected from the store
pub type ReturnedFile = (String, Vec<u8>);

pub struct StoreClient {
    stream: UnixStream,
}

impl StoreClient {
    /// Connect to a server listening at `socket_path`
    pub async fn connect_to(socket_path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        Ok(Self { stream })
    }

    /// Send a request and receive the raw response, whatever its status
    pub async fn send(&mut self, request: &Request) -> Result<Response> {
        write_frame_async(&mut self.stream, &request.encode()).await?;
        let payload = read_frame_async(&mut self.stream).await?;
        Ok(Response::decode(&payload)?)
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        let response = self.send(&request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(ClientError::Status(response.status))
        }
    }

    /// Open (optionally creating and locking) a file.
    /// Returns any file the server had to eject to make room.
    pub async fn open_file(&mut self, path: &str, flags: OpenFlags) -> Result<Vec<ReturnedFile>> {
        let response = self
            .call(Request::Open {
                path: path.to_owned(),
                flags,
            })
            .await?;
        Ok(response.files())
    }

    pub async fn close_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::Close {
            path: path.to_owned(),
        })
        .await
        .map(drop)
    }

    /// Replace the file's content. Returns the files ejected to make room.
    pub async fn write_file(&mut self, path: &str, content: &[u8]) -> Result<Vec<ReturnedFile>> {
        let response = self
            .call(Request::Write {
                path: path.to_owned(),
                content: content.to_vec(),
            })
            .await?;
        Ok(response.files())
    }

    pub async fn write_no_content(&mut self, path: &str) -> Result<Vec<ReturnedFile>> {
        let response = self
            .call(Request::WriteNoContent {
                path: path.to_owned(),
            })
            .await?;
        Ok(response.files())
    }

    pub async fn append_to_file(
        &mut self,
        path: &str,
        content: &[u8],
    ) -> Result<Vec<ReturnedFile>> {
        let response = self
            .call(Request::Append {
                path: path.to_owned(),
                content: content.to_vec(),
            })
            .await?;
        Ok(response.files())
    }

    pub async fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let response = self
            .call(Request::Read {
                path: path.to_owned(),
            })
            .await?;
        Ok(response.content())
    }

    /// Read up to `count` files (0 reads every readable file)
    pub async fn read_n_files(&mut self, count: usize) -> Result<Vec<ReturnedFile>> {
        let response = self.call(Request::ReadN { count }).await?;
        Ok(response.files())
    }

    pub async fn lock_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::Lock {
            path: path.to_owned(),
        })
        .await
        .map(drop)
    }

    pub async fn unlock_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::Unlock {
            path: path.to_owned(),
        })
        .await
        .map(drop)
    }

    pub async fn remove_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::Remove {
            path: path.to_owned(),
        })
        .await
        .map(drop)
    }

    /// Ask the server to close this connection
    pub async fn close_connection(mut self) -> Result<()> {
        self.call(Request::CloseConnection).await.map(drop)
    }
}

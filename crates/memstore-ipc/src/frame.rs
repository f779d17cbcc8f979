//! Length-prefixed framing: `[u32 little-endian length][payload]`.

use std::io::{self, Read, Write};

/// Largest payload accepted on either side of the socket (16 MB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn oversized(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {} bytes exceeds limit of {} bytes", len, MAX_FRAME_LEN),
    )
}

fn header(len: usize) -> io::Result<[u8; 4]> {
    if len > MAX_FRAME_LEN {
        return Err(oversized(len));
    }
    Ok((len as u32).to_le_bytes())
}

/// Write one frame. Header and payload go out in a single `write_all`.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&header(payload.len())?);
    buf.extend_from_slice(payload);
    writer.write_all(&buf)?;
    writer.flush()
}

/// Read one frame, rejecting lengths over [`MAX_FRAME_LEN`] before allocating
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(oversized(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Read one frame from a reader that has a read timeout set.
///
/// Each time the timeout elapses, `abandon` decides whether to keep waiting.
/// Giving up returns a `TimedOut` error and discards the partial frame.
pub fn read_frame_until<R, F>(reader: &mut R, mut abandon: F) -> io::Result<Vec<u8>>
where
    R: Read,
    F: FnMut() -> bool,
{
    let mut len_buf = [0u8; 4];
    fill(reader, &mut len_buf, &mut abandon)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(oversized(len));
    }
    let mut payload = vec![0u8; len];
    fill(reader, &mut payload, &mut abandon)?;
    Ok(payload)
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8], abandon: &mut impl FnMut() -> bool) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if abandon() {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "frame read abandoned",
                    ));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(feature = "tokio")]
pub async fn write_frame_async<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&header(payload.len())?);
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

#[cfg(feature = "tokio")]
pub async fn read_frame_async<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(oversized(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

use bytes::{BufMut, Bytes, BytesMut};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{FrameError, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};

/// Reads exactly one frame from `io`.
///
/// Returns `Ok(None)` if the stream ends before the first byte of the prefix.
/// Nothing past the end of the frame is consumed.
pub async fn read_frame<R>(io: &mut R, max_len: usize) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while let Some(unfilled) = prefix.get_mut(filled..).filter(|rest| !rest.is_empty()) {
        let n = io.read(unfilled).await?;
        if n == 0 {
            return match filled {
                0 => Ok(None),
                buffered => Err(FrameError::Truncated { buffered }),
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    let max = max_len.min(MAX_FRAME_SIZE);
    if len > max {
        return Err(FrameError::Oversized { size: len, max });
    }

    let mut payload = BytesMut::zeroed(len);
    io.read_exact(&mut payload).await.map_err(|error| {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated {
                buffered: LENGTH_PREFIX_SIZE,
            }
        } else {
            error.into()
        }
    })?;

    Ok(Some(payload.freeze()))
}

/// Writes `payload` as a single frame and flushes `io`.
pub async fn write_frame<W>(io: &mut W, payload: &[u8], max_len: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let max = max_len.min(MAX_FRAME_SIZE);
    if payload.len() > max {
        return Err(FrameError::Oversized {
            size: payload.len(),
            max,
        });
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(payload);

    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn test_write_then_read_single_frame() {
        let mut wire = Cursor::new(Vec::new());
        write_frame(&mut wire, b"handshake", 64).await.unwrap();

        let mut wire = Cursor::new(wire.into_inner());
        let frame = read_frame(&mut wire, 64).await.unwrap().unwrap();
        assert_eq!(frame, &b"handshake"[..]);
        assert!(read_frame(&mut wire, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_does_not_consume_next_frame() {
        let mut wire = Cursor::new(Vec::new());
        write_frame(&mut wire, b"first", 64).await.unwrap();
        write_frame(&mut wire, b"second", 64).await.unwrap();

        let mut wire = Cursor::new(wire.into_inner());
        read_frame(&mut wire, 64).await.unwrap().unwrap();
        assert_eq!(wire.position(), (LENGTH_PREFIX_SIZE + 5) as u64);
    }

    #[tokio::test]
    async fn test_empty_stream_is_none() {
        let mut wire = Cursor::new(Vec::new());
        assert!(read_frame(&mut wire, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_prefix_is_truncated() {
        let mut wire = Cursor::new(vec![0u8, 0]);
        let err = read_frame(&mut wire, 64).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated { buffered: 2 }));
    }

    #[tokio::test]
    async fn test_partial_payload_is_truncated() {
        let mut wire = Cursor::new(vec![0u8, 0, 0, 8, 1, 2, 3]);
        let err = read_frame(&mut wire, 64).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }

    #[tokio::test]
    async fn test_oversized_prefix_leaves_payload_unread() {
        let mut bytes = vec![0u8, 0, 0, 65];
        bytes.extend(std::iter::repeat_n(0u8, 65));
        let mut wire = Cursor::new(bytes);

        let err = read_frame(&mut wire, 64).await.unwrap_err();
        assert!(matches!(err, FrameError::Oversized { size: 65, max: 64 }));
        assert_eq!(wire.position(), LENGTH_PREFIX_SIZE as u64);
    }

    #[tokio::test]
    async fn test_oversized_write_rejected_without_io() {
        let mut wire = Cursor::new(Vec::new());
        let err = write_frame(&mut wire, &[0u8; 9], 8).await.unwrap_err();
        assert!(matches!(err, FrameError::Oversized { size: 9, max: 8 }));
        assert!(wire.into_inner().is_empty());
    }
}

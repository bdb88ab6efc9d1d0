use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{FrameError, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, peek_len};

/// Codec for length-prefixed frames with an upper bound on the payload size.
#[derive(Debug, Clone)]
pub struct LengthPrefixedCodec {
    max_len: usize,
}

impl LengthPrefixedCodec {
    /// Creates a codec accepting payloads of at most `max_len` bytes.
    ///
    /// Limits above [`MAX_FRAME_SIZE`] are clamped since the prefix cannot encode them.
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.min(MAX_FRAME_SIZE),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl asynchronous_codec::Encoder for LengthPrefixedCodec {
    type Item<'a> = Bytes;
    type Error = FrameError;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_len {
            return Err(FrameError::Oversized {
                size: item.len(),
                max: self.max_len,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl asynchronous_codec::Decoder for LengthPrefixedCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(len) = peek_len(src) else {
            return Ok(None);
        };

        if len > self.max_len {
            return Err(FrameError::Oversized {
                size: len,
                max: self.max_len,
            });
        }

        let frame_len = LENGTH_PREFIX_SIZE + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

//! Buffered chunk reader turning a byte stream into message frames.
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::error::ProtocolError;
use crate::{Error, Result};

/// Default minimum number of bytes requested from the socket per read.
pub(crate) const DEFAULT_MIN_READ: usize = 8192;

/// Frames larger than this cannot be real; the length field is corrupt.
const MAX_MESSAGE_LEN: i32 = 1 << 30;

/// Accumulates socket reads and yields one `(msgtype, body)` frame at a
/// time.
///
/// `receive` is cancel-safe: a read interrupted by the token never consumes
/// partial bytes, so the buffer stays valid for the next call as long as
/// the socket itself is usable.
pub(crate) struct MessageReader<R> {
    io: R,
    buf: BytesMut,
    min_read: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(io: R, min_read: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(min_read),
            min_read,
        }
    }

    /// Block until a full backend frame is available.
    pub async fn receive(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<(u8, bytes::Bytes)> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }

            self.buf.reserve(self.min_read);
            let read = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    read = self.io.read_buf(&mut self.buf) => read,
                },
                None => self.io.read_buf(&mut self.buf).await,
            };

            match read {
                Ok(0) => return Err(Error::Closed),
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!("socket read failed: {err}");
                    return Err(Error::Closed);
                }
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<(u8, bytes::Bytes)>> {
        let Some(header) = self.buf.get(..5) else {
            return Ok(None);
        };

        let msgtype = header[0];
        let len = i32::from_be_bytes(header[1..5].try_into().unwrap());
        if !(4..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(ProtocolError::InvalidLength { msgtype, len }.into());
        }

        let body_len = len as usize - 4;
        if self.buf.len() - 5 < body_len {
            return Ok(None);
        }

        self.buf.advance(5);
        Ok(Some((msgtype, self.buf.split_to(body_len).freeze())))
    }
}

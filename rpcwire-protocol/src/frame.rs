//! Length-prefixed framing for logical messages.
//!
//! A logical message is carried as a sequence of frames, each preceded by a
//! 4-byte big-endian length. A zero length marks the end of the message and
//! never carries data:
//!
//! ```text
//! +-----------+-----------+-----------+-----------+-----------+
//! | len (u32) | data      | len (u32) | data      | 00000000  |
//! +-----------+-----------+-----------+-----------+-----------+
//! ```

use crate::error::FrameError;
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default size of the writer's frame buffer.
pub const FRAME_BUF_SIZE: usize = 4096;

/// The zero-length frame that terminates a logical message.
pub const END_OF_MESSAGE: [u8; FRAME_HEADER_SIZE] = [0x00, 0x00, 0x00, 0x00];

/// Reads the data of framed messages from an underlying reader.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    /// Bytes left in the current frame.
    remaining: usize,
    /// A terminator was consumed after data was returned; report it next.
    end_pending: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            end_pending: false,
        }
    }

    /// Reads message data into `buf`.
    ///
    /// Returns `Ok(0)` exactly once at the end of each logical message. When
    /// the terminator is reached after some data was copied, the data is
    /// returned first and the end is reported on the following call. The call
    /// after the end starts reading the next message.
    ///
    /// An empty `buf` is rejected with `InvalidInput`, since `Ok(0)` is
    /// reserved for the end of a message.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FrameError> {
        if buf.is_empty() {
            return Err(FrameError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty read buffer",
            )));
        }
        if self.end_pending {
            self.end_pending = false;
            return Ok(0);
        }

        let mut read = 0;
        while read < buf.len() {
            if self.remaining == 0 {
                let size = self.read_header().await?;
                if size == 0 {
                    if read > 0 {
                        self.end_pending = true;
                    }
                    return Ok(read);
                }
                self.remaining = size;
            }

            let end = buf.len().min(read + self.remaining);
            match self.inner.read(&mut buf[read..end]).await {
                Ok(0) => {
                    return Err(FrameError::Truncated {
                        copied: read,
                        source: io::ErrorKind::UnexpectedEof.into(),
                    })
                }
                Ok(n) => {
                    read += n;
                    self.remaining -= n;
                }
                Err(source) => {
                    return Err(FrameError::Truncated {
                        copied: read,
                        source,
                    })
                }
            }
        }

        Ok(read)
    }

    /// Reads one whole logical message.
    ///
    /// Returns `Ok(None)` if the stream ended cleanly before the message
    /// started.
    pub async fn read_message(&mut self, max: usize) -> Result<Option<BytesMut>, FrameError> {
        let mut message = BytesMut::new();
        let mut chunk = [0u8; FRAME_BUF_SIZE];
        loop {
            match self.read(&mut chunk).await {
                Ok(0) => return Ok(Some(message)),
                Ok(n) => {
                    if message.len() + n > max {
                        return Err(FrameError::MessageTooLarge {
                            size: message.len() + n,
                            max,
                        });
                    }
                    message.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.is_closed() && message.is_empty() => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_header(&mut self) -> Result<usize, FrameError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut got = 0;
        while got < FRAME_HEADER_SIZE {
            let n = self.inner.read(&mut header[got..]).await?;
            if n == 0 {
                if got == 0 {
                    return Err(FrameError::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                return Err(FrameError::InvalidHeader { got });
            }
            got += n;
        }
        Ok(u32::from_be_bytes(header) as usize)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    /// Waits until bytes of the next message are available without
    /// consuming them. Returns `false` if the stream ended instead.
    pub async fn wait_readable(&mut self) -> io::Result<bool> {
        let buf = self.inner.fill_buf().await?;
        Ok(!buf.is_empty())
    }
}

/// Writes data as frames to an underlying writer.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    buf: Vec<u8>,
    capacity: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_capacity(inner, FRAME_BUF_SIZE)
    }

    /// Creates a writer whose frames are buffered up to `capacity` bytes.
    pub fn with_capacity(inner: W, capacity: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Writes `data` into the current frame.
    ///
    /// Data that does not fit in the remaining buffer flushes the buffered
    /// frame first. Data larger than the whole buffer is written directly as
    /// its own frame.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.len() > self.capacity - self.buf.len() {
            self.flush().await?;
        }

        if data.len() > self.capacity {
            self.inner.write_all(&frame_header(data.len())?).await?;
            self.inner.write_all(data).await?;
            return Ok(data.len());
        }

        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    /// Ends the current frame. Does not end the message.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let header = frame_header(self.buf.len())?;
        self.inner.write_all(&header).await?;
        self.inner.write_all(&self.buf).await?;
        self.buf.clear();
        Ok(())
    }

    /// Ends the current frame and the logical message, then flushes the
    /// underlying writer.
    pub async fn end_message(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.inner.write_all(&END_OF_MESSAGE).await?;
        self.inner.flush().await
    }

    /// Returns the number of bytes buffered in the current frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn frame_header(len: usize) -> io::Result<[u8; FRAME_HEADER_SIZE]> {
    let len = u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds u32 length", len),
        )
    })?;
    Ok(len.to_be_bytes())
}

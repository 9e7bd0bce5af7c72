//! The writing half of the length prefixed framing.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LenType, MAX_FRAME_LEN, Serialize};

/// Writes frames into an async writer.
///
/// Every frame is a big endian length followed by the serialized head and, when
/// the message lends one, a borrowed tail that is written without copying.
pub struct FrameSender<W: AsyncWrite + Unpin> {
    tx: W,
    head: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            head: Vec::new(),
        }
    }

    /// Sends `msg` as a single frame and flushes the writer.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// An `InvalidInput` error if the frame would exceed `MAX_FRAME_LEN`,
    /// nothing is written in that case.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.head.clear();
        let tail = msg.serialize(&mut self.head)?.unwrap_or_default();

        let len = self.head.len() + tail.len();
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Refusing to send a frame of {len} bytes, the limit is {MAX_FRAME_LEN}"),
            ));
        }

        self.tx.write_all(&(len as LenType).to_be_bytes()).await?;
        self.tx.write_all(&self.head).await?;
        if !tail.is_empty() {
            self.tx.write_all(tail).await?;
        }

        self.tx.flush().await
    }

    /// Shuts down the write half of the underlying writer.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}

//! The sending end of the framing protocol.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize};

/// The sending end handle of the communication.
pub struct FrameSender<W: AsyncWrite + Unpin> {
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    /// Creates a new `FrameSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Sends `msg` as a single frame.
    ///
    /// The length prefix and the fixed part of the body share one write, a
    /// borrowed tail follows in a second one.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// `io::ErrorKind::InvalidInput` without writing anything if the body
    /// exceeds `MAX_FRAME_LEN`, the writer's error otherwise.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.buf.clear();
        self.buf.resize(LEN_TYPE_SIZE, 0);

        let tail = msg.serialize(&mut self.buf);
        let len = self.buf.len() - LEN_TYPE_SIZE + tail.map_or(0, <[u8]>::len);

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }

        self.buf[..LEN_TYPE_SIZE].copy_from_slice(&(len as LenType).to_be_bytes());
        self.tx.write_all(&self.buf).await?;

        if let Some(tail) = tail {
            self.tx.write_all(tail).await?;
        }

        self.tx.flush().await
    }
}

//! In-band pipes: ordered, closable chunk streams multiplexed over a connection.

use std::collections::HashMap;

use log::debug;
use tokio::sync::mpsc;

use crate::upload::ChunkSource;

/// Hands out pipe ports and routes incoming chunks to their reader.
#[derive(Debug)]
pub struct PipeRegistry {
    depth: usize,
    next_port: u16,
    open: HashMap<u16, mpsc::Sender<Vec<u8>>>,
}

/// The reading end of a pipe, closed once the registry drops its sender.
#[derive(Debug)]
pub struct PipeReader {
    port: u16,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl PipeReader {
    /// Returns the port the peer must send chunks to.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl ChunkSource for PipeReader {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl PipeRegistry {
    /// Creates a new `PipeRegistry`.
    ///
    /// # Arguments
    /// * `depth` - Chunks buffered per pipe before delivery waits for the reader.
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            next_port: 1,
            open: HashMap::new(),
        }
    }

    /// Opens a new pipe.
    ///
    /// # Returns
    /// The reading end, its port identifies the pipe on the wire.
    pub fn open(&mut self) -> PipeReader {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(1);

        let (tx, rx) = mpsc::channel(self.depth);
        self.open.insert(port, tx);

        debug!(port = port; "pipe opened");
        PipeReader { port, rx }
    }

    /// Delivers a chunk to the reader of `port`, waiting while its buffer is full.
    ///
    /// # Returns
    /// Whether the chunk was accepted, data for unknown or abandoned pipes is dropped.
    pub async fn deliver(&mut self, port: u16, chunk: Vec<u8>) -> bool {
        let Some(tx) = self.open.get(&port) else {
            debug!(port = port; "dropping data for unknown pipe");
            return false;
        };

        if tx.send(chunk).await.is_err() {
            debug!(port = port; "pipe reader is gone");
            self.open.remove(&port);
            return false;
        }

        true
    }

    /// Closes `port`, its reader sees the end of the stream once buffered chunks are drained.
    pub fn close(&mut self, port: u16) -> bool {
        let closed = self.open.remove(&port).is_some();
        if closed {
            debug!(port = port; "pipe closed");
        }
        closed
    }

    /// Closes every open pipe.
    pub fn close_all(&mut self) {
        self.open.clear();
    }

    /// Returns the amount of open pipes.
    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

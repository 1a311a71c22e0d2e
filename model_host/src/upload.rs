//! Chunked model transfer into the append store.

use log::{debug, info, warn};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    error::UploadError,
    lifecycle::{MODEL_HEADER_LEN, SharedController},
    pipe::PipeRegistry,
    storage::ALIGNMENT,
};

/// A stream of chunks ending with an explicit close.
#[trait_variant::make(ChunkSource: Send)]
pub trait LocalChunkSource {
    /// Waits for the next chunk.
    ///
    /// # Returns
    /// `None` once the sender closed the stream.
    async fn next_chunk(&mut self) -> Option<Vec<u8>>;
}

/// A single transfer of a declared amount of bytes into a freshly allocated region.
///
/// The first `MODEL_HEADER_LEN` bytes are staged and only written after
/// everything else landed, so offset 0 keeps the invalid sentinel for the
/// whole transfer.
pub struct Upload {
    controller: SharedController,
    declared: usize,
    offset: usize,
    header: Option<[u8; MODEL_HEADER_LEN]>,
}

impl Upload {
    /// Validates `declared` and prepares the controller for the transfer.
    ///
    /// # Arguments
    /// * `controller` - The lifecycle controller receiving the model.
    /// * `declared` - The total amount of bytes that will be streamed.
    ///
    /// # Returns
    /// The transfer, `InvalidSize` if the model can't fit, leaving the
    /// current model untouched.
    pub fn start(controller: SharedController, declared: usize) -> Result<Self, UploadError> {
        {
            let mut ctl = controller.lock();
            Self::validate(declared, ctl.available())?;
            ctl.begin_upload(declared)?;
        }

        Ok(Self {
            controller,
            declared,
            offset: 0,
            header: None,
        })
    }

    /// Checks a declared size against the space of the store.
    pub fn validate(declared: usize, available: usize) -> Result<(), UploadError> {
        if declared < MODEL_HEADER_LEN || declared > available {
            return Err(UploadError::InvalidSize {
                declared,
                available,
            });
        }

        Ok(())
    }

    /// Returns the bytes received so far.
    pub fn received(&self) -> usize {
        self.offset
    }

    /// Consumes `source` until the declared size is reached, then commits and loads the model.
    ///
    /// # Returns
    /// `Ok(())` once the model is `Ready`. A premature end of the stream leaves
    /// the controller in `Loading`, any other failure moves it to `Error`.
    pub async fn run<C: ChunkSource>(mut self, mut source: C) -> Result<(), UploadError> {
        while self.offset < self.declared {
            let Some(chunk) = source.next_chunk().await else {
                return Err(UploadError::Aborted {
                    received: self.offset,
                    declared: self.declared,
                });
            };

            if let Err(e) = self.apply(&chunk) {
                self.controller.lock().fail(e.to_string());
                return Err(e);
            }
        }

        drop(source);
        self.finish()
    }

    /// Writes one chunk at the running offset.
    ///
    /// # Returns
    /// `CorruptStream` if the running offset ends up unaligned short of the
    /// declared size, or the store error that rejected the write.
    pub fn apply(&mut self, chunk: &[u8]) -> Result<(), UploadError> {
        if chunk.is_empty() {
            return Ok(());
        }

        let mut ctl = self.controller.lock();

        if self.offset == 0 {
            let Some((header, rest)) = chunk.split_first_chunk::<MODEL_HEADER_LEN>() else {
                return Err(UploadError::CorruptStream {
                    offset: chunk.len(),
                });
            };

            self.header = Some(*header);
            if !rest.is_empty() {
                ctl.write_chunk(MODEL_HEADER_LEN, rest)?;
            }
        } else {
            ctl.write_chunk(self.offset, chunk)?;
        }

        self.offset += chunk.len();
        debug!(offset = self.offset, declared = self.declared; "chunk stored");

        if self.offset < self.declared && self.offset % ALIGNMENT != 0 {
            return Err(UploadError::CorruptStream {
                offset: self.offset,
            });
        }

        Ok(())
    }

    fn finish(self) -> Result<(), UploadError> {
        let Some(header) = self.header else {
            return Err(UploadError::CorruptStream {
                offset: self.offset,
            });
        };

        let mut ctl = self.controller.lock();
        if let Err(e) = ctl.commit_header(&header) {
            ctl.fail(e.to_string());
            return Err(e.into());
        }

        info!(size = self.declared; "model upload complete");
        ctl.load()?;
        Ok(())
    }
}

/// Starts transfers on `SetModel` and tracks the one in progress.
pub struct UploadHandler {
    controller: SharedController,
    pipes: PipeRegistry,
    finished: mpsc::UnboundedSender<u16>,
    current: Option<JoinHandle<()>>,
}

impl UploadHandler {
    /// Creates a new `UploadHandler`.
    ///
    /// # Arguments
    /// * `controller` - The lifecycle controller receiving models.
    /// * `pipes` - The registry the upload pipes are opened in.
    /// * `finished` - Receives the port of every transfer that ran to its end,
    ///   whatever the outcome, so the pipe can be closed towards the peer.
    pub fn new(
        controller: SharedController,
        pipes: PipeRegistry,
        finished: mpsc::UnboundedSender<u16>,
    ) -> Self {
        Self {
            controller,
            pipes,
            finished,
            current: None,
        }
    }

    /// Handles `SetModel(size)`: validates, erases, allocates and spawns the
    /// transfer in the background.
    ///
    /// # Returns
    /// The port of the pipe the model must be streamed into, `None` if the
    /// command was dropped.
    pub fn set_model(&mut self, size: u32) -> Option<u16> {
        let declared = size as usize;
        let available = self.controller.lock().available();

        if let Err(e) = Upload::validate(declared, available) {
            debug!("dropping SetModel: {e}");
            return None;
        }

        self.cancel();

        let upload = match Upload::start(self.controller.clone(), declared) {
            Ok(upload) => upload,
            Err(e) => {
                warn!("cannot start model upload: {e}");
                return None;
            }
        };

        let reader = self.pipes.open();
        let port = reader.port();
        let finished = self.finished.clone();

        self.current = Some(tokio::spawn(async move {
            match upload.run(reader).await {
                Ok(()) => {}
                Err(e @ UploadError::Aborted { .. }) => warn!("{e}"),
                Err(e) => warn!("model upload failed: {e}"),
            }

            let _ = finished.send(port);
        }));

        Some(port)
    }

    /// Handles an explicit erase, abandoning any transfer in progress.
    pub fn erase(&mut self) {
        self.cancel();
        if let Err(e) = self.controller.lock().erase() {
            warn!("cannot erase model: {e}");
        }
    }

    /// Routes a pipe chunk to its reader.
    pub async fn deliver(&mut self, port: u16, chunk: Vec<u8>) -> bool {
        self.pipes.deliver(port, chunk).await
    }

    /// Closes a pipe, on request of the peer or once its transfer ended.
    ///
    /// # Returns
    /// Whether the pipe was still open.
    pub fn close(&mut self, port: u16) -> bool {
        self.pipes.close(port)
    }

    /// Closes every pipe, the transfer in progress sees the end of its stream.
    pub fn close_pipes(&mut self) {
        self.pipes.close_all();
    }

    /// Returns whether a transfer task is still running.
    pub fn in_progress(&self) -> bool {
        self.current.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn cancel(&mut self) {
        if let Some(task) = self.current.take() {
            task.abort();
        }
        self.pipes.close_all();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{
        arena::ArenaSizeCache,
        executor::{DenseActivation, DenseExecutor},
        lifecycle::{ModelController, ModelState},
        settings::MemSettings,
        storage::{AppendStore, MemFlash, StorageError},
    };

    struct Chunks(VecDeque<Vec<u8>>);

    impl ChunkSource for Chunks {
        async fn next_chunk(&mut self) -> Option<Vec<u8>> {
            self.0.pop_front()
        }
    }

    fn chunks(blob: &[u8], size: usize) -> Chunks {
        Chunks(blob.chunks(size).map(<[u8]>::to_vec).collect())
    }

    fn create_test_handler(
        ctl: &SharedController,
    ) -> (UploadHandler, mpsc::UnboundedReceiver<u16>) {
        let (finished, rx) = mpsc::unbounded_channel();
        (UploadHandler::new(ctl.clone(), PipeRegistry::new(2), finished), rx)
    }

    fn create_test_controller() -> SharedController {
        let store = AppendStore::new(Box::new(MemFlash::new(8192, 512)));
        let arena = ArenaSizeCache::new(Box::new(MemSettings::new()));
        ModelController::new(store, Box::new(DenseExecutor::new(4096)), arena).into_shared()
    }

    fn blob_4096() -> Vec<u8> {
        // 16 + 4 * (m * n + m) = 4096 with n = 16, m = 60
        let (n, m) = (16, 60);
        let weights: Vec<f32> = (0..n * m).map(|i| i as f32 * 0.01).collect();
        let bias = vec![0.5; m];
        let blob = DenseExecutor::encode(n as u16, &weights, &bias, DenseActivation::Identity);
        assert_eq!(blob.len(), 4096);
        blob
    }

    #[test]
    fn test_validate() {
        assert!(Upload::validate(8, 8).is_ok());
        assert!(Upload::validate(7, 100).is_err());
        assert!(Upload::validate(101, 100).is_err());
    }

    #[tokio::test]
    async fn test_chunked_upload_reaches_ready() {
        let ctl = create_test_controller();
        let blob = blob_4096();

        let upload = Upload::start(ctl.clone(), blob.len()).unwrap();
        upload.run(chunks(&blob, 512)).await.unwrap();

        let ctl = ctl.lock();
        assert_eq!(ctl.state(), &ModelState::Ready);
        assert_eq!(ctl.model_size(), 4096);
        assert_eq!(ctl.input_shape(), vec![1, 16]);
    }

    #[tokio::test]
    async fn test_header_is_written_last() {
        let ctl = create_test_controller();
        let blob = blob_4096();

        let mut upload = Upload::start(ctl.clone(), blob.len()).unwrap();
        for chunk in blob.chunks(512).take(7) {
            upload.apply(chunk).unwrap();
            assert_eq!(ctl.lock().model_size(), 0);
        }

        assert_eq!(upload.received(), 3584);
        upload.apply(&blob[3584..]).unwrap();
        assert_eq!(ctl.lock().model_size(), 0);

        upload.finish().unwrap();
        assert_eq!(ctl.lock().model_size(), 4096);
    }

    #[tokio::test]
    async fn test_premature_close_stays_loading() {
        let ctl = create_test_controller();
        let blob = blob_4096();

        let mut source = chunks(&blob, 512);
        source.0.truncate(3);

        let upload = Upload::start(ctl.clone(), blob.len()).unwrap();
        let err = upload.run(source).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Aborted {
                received: 1536,
                declared: 4096
            }
        ));

        {
            let ctl = ctl.lock();
            assert_eq!(ctl.state(), &ModelState::Loading);
            assert_eq!(ctl.model_size(), 0);
        }

        let upload = Upload::start(ctl.clone(), blob.len()).unwrap();
        upload.run(chunks(&blob, 1024)).await.unwrap();
        assert_eq!(ctl.lock().state(), &ModelState::Ready);
    }

    #[tokio::test]
    async fn test_misaligned_chunk_is_corrupt_stream() {
        let ctl = create_test_controller();
        let blob = blob_4096();

        let source = Chunks(VecDeque::from([
            blob[..100].to_vec(),
            blob[100..].to_vec(),
        ]));

        let upload = Upload::start(ctl.clone(), blob.len()).unwrap();
        let err = upload.run(source).await.unwrap_err();
        assert!(matches!(err, UploadError::CorruptStream { offset: 100 }));

        {
            let ctl = ctl.lock();
            assert!(matches!(ctl.state(), ModelState::Error(_)));
            assert_eq!(ctl.model_size(), 0);
        }

        let upload = Upload::start(ctl.clone(), blob.len()).unwrap();
        upload.run(chunks(&blob, 256)).await.unwrap();
        assert_eq!(ctl.lock().state(), &ModelState::Ready);
    }

    #[tokio::test]
    async fn test_short_first_chunk_is_corrupt_stream() {
        let ctl = create_test_controller();
        let mut upload = Upload::start(ctl, 64).unwrap();

        assert!(matches!(
            upload.apply(&[0; 4]),
            Err(UploadError::CorruptStream { offset: 4 })
        ));
    }

    #[tokio::test]
    async fn test_overflowing_chunk_is_out_of_range() {
        let ctl = create_test_controller();
        let blob = blob_4096();
        let mut source = chunks(&blob, 512);
        source.0.push_back(vec![0; 8]);
        source.0.swap(7, 8);

        let upload = Upload::start(ctl.clone(), 4096).unwrap();
        let err = upload.run(source).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Storage(StorageError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_final_chunk_may_end_unaligned() {
        let ctl = create_test_controller();
        let blob = DenseExecutor::encode(1, &[2.0], &[1.0], DenseActivation::Identity);
        assert_eq!(blob.len() % ALIGNMENT, 0);

        let mut padded = blob.clone();
        padded.extend_from_slice(&[0; 3]);

        let upload = Upload::start(ctl.clone(), padded.len()).unwrap();
        upload.run(chunks(&padded, 8)).await.unwrap();
        assert_eq!(ctl.lock().model_size(), padded.len() as u32);
    }

    #[tokio::test]
    async fn test_handler_drops_oversize_set_model() {
        let ctl = create_test_controller();
        let (mut handler, _finished) = create_test_handler(&ctl);

        assert_eq!(handler.set_model(1 << 20), None);
        assert_eq!(handler.set_model(4), None);
        assert_eq!(ctl.lock().state(), &ModelState::Empty);
    }

    #[tokio::test]
    async fn test_handler_streams_through_pipe() {
        let ctl = create_test_controller();
        let (mut handler, mut finished) = create_test_handler(&ctl);
        let blob = blob_4096();

        let port = handler.set_model(4096).unwrap();
        for chunk in blob.chunks(512) {
            assert!(handler.deliver(port, chunk.to_vec()).await);
        }

        assert_eq!(finished.recv().await, Some(port));
        assert_eq!(ctl.lock().state(), &ModelState::Ready);

        assert!(handler.close(port));
        assert!(!handler.close(port));
        assert!(!handler.deliver(port, vec![0; 8]).await);
    }

    #[tokio::test]
    async fn test_failed_transfer_reports_its_port() {
        let ctl = create_test_controller();
        let (mut handler, mut finished) = create_test_handler(&ctl);

        let port = handler.set_model(4096).unwrap();
        assert!(handler.deliver(port, vec![0; 12]).await);

        assert_eq!(finished.recv().await, Some(port));
        assert!(matches!(ctl.lock().state(), ModelState::Error(_)));
        assert!(handler.close(port));
    }

    #[tokio::test]
    async fn test_new_set_model_abandons_previous_transfer() {
        let ctl = create_test_controller();
        let (mut handler, _finished) = create_test_handler(&ctl);
        let blob = blob_4096();

        let first = handler.set_model(4096).unwrap();
        assert!(handler.deliver(first, blob[..512].to_vec()).await);

        let second = handler.set_model(4096).unwrap();
        assert_ne!(first, second);
        assert!(!handler.deliver(first, blob[512..1024].to_vec()).await);

        for chunk in blob.chunks(1024) {
            assert!(handler.deliver(second, chunk.to_vec()).await);
        }

        while handler.in_progress() {
            tokio::task::yield_now().await;
        }

        assert_eq!(ctl.lock().state(), &ModelState::Ready);
        assert_eq!(ctl.lock().model_size(), 4096);
    }

    #[tokio::test]
    async fn test_erase_stops_transfer() {
        let ctl = create_test_controller();
        let (mut handler, _finished) = create_test_handler(&ctl);

        let port = handler.set_model(4096).unwrap();
        handler.erase();

        assert!(!handler.deliver(port, vec![0; 512]).await);
        assert_eq!(ctl.lock().state(), &ModelState::Empty);
    }
}

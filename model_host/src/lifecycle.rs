//! The model lifecycle: `Empty -> Loading -> Ready | Error`, back to `Empty` on erase.
//!
//! The first 8 bytes of a stored blob double as its validity sentinel. They
//! stay erased, reading `0xFFFF_FFFF` (-1), until an upload commits them as
//! its very last write, so an interrupted transfer is never loadable.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    arena::ArenaSizeCache,
    error::{InvokeError, LoadError},
    executor::ModelExecutor,
    storage::{AppendStore, Region, StorageError},
};

/// Bytes of the blob header whose write is deferred until the end of an upload.
pub const MODEL_HEADER_LEN: usize = 8;

/// The value of the first header word while no usable model is stored.
pub const INVALID_SENTINEL: u32 = u32::MAX;

/// Slack added to the measured arena usage before caching it.
pub const ARENA_MARGIN: usize = 32;

/// The controller shared between the dispatcher, the upload task and the scheduler.
pub type SharedController = Arc<Mutex<ModelController>>;

/// The lifecycle state of the stored model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    Empty,
    Loading,
    Ready,
    Error(String),
}

/// Owns the stored blob, its region and the executor it is loaded into.
pub struct ModelController {
    store: AppendStore,
    executor: Box<dyn ModelExecutor>,
    arena: ArenaSizeCache,
    state: ModelState,
    region: Option<Region>,
}

impl ModelController {
    /// Creates a new `ModelController` in the `Empty` state.
    ///
    /// # Arguments
    /// * `store` - The append store holding the blob.
    /// * `executor` - The inference engine.
    /// * `arena` - The arena size hint cache.
    pub fn new(store: AppendStore, executor: Box<dyn ModelExecutor>, arena: ArenaSizeCache) -> Self {
        Self {
            store,
            executor,
            arena,
            state: ModelState::Empty,
            region: None,
        }
    }

    /// Wraps the controller for sharing between tasks.
    pub fn into_shared(self) -> SharedController {
        Arc::new(Mutex::new(self))
    }

    /// Picks up a model committed before the last restart.
    ///
    /// A region whose header is still the invalid sentinel is kept around
    /// until the next erase, the state stays `Empty`.
    pub fn restore(&mut self) {
        let region = match self.store.region() {
            Ok(region) => region,
            Err(e) => {
                self.fail(e.to_string());
                return;
            }
        };

        self.region = region;
        match region {
            Some(region) if self.is_committed(&region) => {
                info!(size = region.size(); "restoring stored model");
                self.state = ModelState::Loading;
                let _ = self.load();
            }
            Some(region) => {
                info!(size = region.size(); "stored model is incomplete, ignoring it");
            }
            None => debug!("no stored model"),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> &ModelState {
        &self.state
    }

    /// Returns whether a model is loaded and runnable.
    pub fn is_ready(&self) -> bool {
        self.state == ModelState::Ready
    }

    /// Returns the retained failure description, if the controller is in `Error`.
    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            ModelState::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Returns the largest model the store can hold.
    pub fn available(&self) -> usize {
        self.store.available()
    }

    /// Moves to `Error`, keeping `msg` as the failure description.
    pub fn fail(&mut self, msg: String) {
        warn!("model error: {msg}");
        self.state = ModelState::Error(msg);
    }

    /// Erases any stored model and allocates a fresh region of `size` bytes.
    ///
    /// # Returns
    /// The new region, or the `StorageError` that prevented it.
    pub fn begin_upload(&mut self, size: usize) -> Result<Region, StorageError> {
        self.erase()?;

        let region = self.store.allocate(size).inspect_err(|e| self.fail(e.to_string()))?;
        self.region = Some(region);
        self.state = ModelState::Loading;

        info!(size = size; "model upload started");
        Ok(region)
    }

    /// Writes `bytes` at `offset` of the region being uploaded.
    pub fn write_chunk(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StorageError> {
        let region = self.region.ok_or(StorageError::NotFormatted)?;
        self.store.write_at(&region, offset, bytes)
    }

    /// Writes the deferred header, the blob becomes loadable once this returns.
    pub fn commit_header(&mut self, header: &[u8; MODEL_HEADER_LEN]) -> Result<(), StorageError> {
        self.write_chunk(0, header)
    }

    /// Loads the stored blob into the executor.
    ///
    /// Reuses the cached arena size when there is one, otherwise caches the
    /// measured usage plus `ARENA_MARGIN`. Any failure moves to `Error`.
    pub fn load(&mut self) -> Result<(), LoadError> {
        match self.try_load() {
            Ok(()) => {
                self.state = ModelState::Ready;
                info!(
                    size = self.model_size(),
                    arena = self.executor.arena_size();
                    "model ready"
                );
                Ok(())
            }
            Err(e) => {
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    fn try_load(&mut self) -> Result<(), LoadError> {
        let region = self.region.ok_or(LoadError::NoModel)?;
        if !self.is_committed(&region) {
            return Err(LoadError::NoModel);
        }

        let blob = self.store.read_all(&region)?;
        let hint = self.arena.get();
        self.executor.load(&blob, hint)?;

        if hint.is_none() {
            let size = self.executor.arena_bytes() + ARENA_MARGIN;
            match self.arena.set(size) {
                Ok(()) => debug!(size = size; "arena size cached"),
                Err(e) => warn!("cannot cache arena size: {e}"),
            }
        }

        Ok(())
    }

    /// Drops the model: frees the executor, erases the store and forgets
    /// the arena hint. Moves to `Empty`, or to `Error` if the medium fails.
    pub fn erase(&mut self) -> Result<(), StorageError> {
        self.executor.free();
        self.region = None;

        if let Err(e) = self.arena.clear() {
            warn!("cannot clear arena size: {e}");
        }

        if let Err(e) = self.store.erase() {
            self.fail(e.to_string());
            return Err(e);
        }

        if self.state != ModelState::Empty {
            info!("model erased");
        }

        self.state = ModelState::Empty;
        Ok(())
    }

    /// Runs the loaded model once.
    ///
    /// # Returns
    /// One flat buffer per output tensor. A failing run moves to `Error`,
    /// calling this while not `Ready` fails with `NotReady` and changes nothing.
    pub fn invoke(&mut self, inputs: &[&[f32]]) -> Result<Vec<Vec<f32>>, InvokeError> {
        if !self.is_ready() {
            return Err(InvokeError::NotReady);
        }

        let res = self.check_inputs(inputs).and_then(|_| self.executor.invoke(inputs));
        if let Err(e) = &res {
            self.fail(e.to_string());
        }

        res
    }

    fn check_inputs(&self, inputs: &[&[f32]]) -> Result<(), InvokeError> {
        let expected = self.executor.inputs();
        if inputs.len() != expected {
            return Err(InvokeError::InputCount {
                got: inputs.len(),
                expected,
            });
        }

        for (index, input) in inputs.iter().enumerate() {
            let expected = self.executor.input_elements(index);
            if input.len() != expected {
                return Err(InvokeError::InputMismatch {
                    index,
                    got: input.len(),
                    expected,
                });
            }
        }

        Ok(())
    }

    /// Returns the size of the stored blob, 0 unless its header is committed.
    pub fn model_size(&self) -> u32 {
        match self.region {
            Some(region) if self.is_committed(&region) => {
                u32::try_from(region.size()).unwrap_or(u32::MAX)
            }
            _ => 0,
        }
    }

    fn is_committed(&self, region: &Region) -> bool {
        let mut word = [0; 4];
        match self.store.read_at(region, 0, &mut word) {
            Ok(()) => u32::from_le_bytes(word) != INVALID_SENTINEL,
            Err(_) => false,
        }
    }

    /// Dimensions of the first input tensor, empty without a model.
    pub fn input_shape(&self) -> Vec<u16> {
        self.executor.input_shape(0).unwrap_or_default()
    }

    /// Dimensions of the first output tensor, empty without a model.
    pub fn output_shape(&self) -> Vec<u16> {
        self.executor.output_shape(0).unwrap_or_default()
    }

    /// Bytes reserved for the inference workspace.
    pub fn allocated_arena_size(&self) -> u32 {
        u32::try_from(self.executor.arena_size()).unwrap_or(u32::MAX)
    }

    /// Model format magic of the executor.
    pub fn format(&self) -> u32 {
        self.executor.format()
    }

    /// Schema version of the executor.
    pub fn format_version(&self) -> u32 {
        self.executor.format_version()
    }

    /// Returns the cached arena size hint.
    pub fn arena_hint(&self) -> Option<usize> {
        self.arena.get()
    }
}

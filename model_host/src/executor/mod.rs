//! The seam to the numeric inference engine.

mod dense;

pub use dense::{DENSE_FORMAT, DENSE_HEADER_LEN, DENSE_VERSION, DenseActivation, DenseExecutor};

use crate::error::{InvokeError, LoadError};

/// Loads model blobs into a bounded workspace and runs them.
///
/// Every method is a single non-preemptible call from the point of view of
/// the async runtime.
pub trait ModelExecutor: Send {
    /// Magic identifying the model format this executor understands.
    fn format(&self) -> u32;

    /// Schema version this executor understands.
    fn format_version(&self) -> u32;

    /// Loads `blob`, dropping any previously loaded model first.
    ///
    /// # Arguments
    /// * `blob` - The serialized model.
    /// * `arena_size` - The workspace to reserve, `None` to let the executor
    ///                  reserve its maximum and measure the actual need.
    fn load(&mut self, blob: &[u8], arena_size: Option<usize>) -> Result<(), LoadError>;

    /// Releases the loaded model and its workspace.
    fn free(&mut self);

    /// Bytes of the workspace the loaded model actually uses.
    fn arena_bytes(&self) -> usize;

    /// Bytes reserved for the workspace.
    fn arena_size(&self) -> usize;

    /// Dimensions of the `idx`-th input tensor, `None` without a model.
    fn input_shape(&self, idx: usize) -> Option<Vec<u16>>;

    /// Dimensions of the `idx`-th output tensor, `None` without a model.
    fn output_shape(&self, idx: usize) -> Option<Vec<u16>>;

    /// Amount of input tensors the loaded model takes.
    fn inputs(&self) -> usize;

    /// Amount of elements in the `idx`-th input tensor, 0 if there is none.
    fn input_elements(&self, idx: usize) -> usize;

    /// Runs one forward pass.
    ///
    /// # Returns
    /// One flat buffer per output tensor.
    fn invoke(&mut self, inputs: &[&[f32]]) -> Result<Vec<Vec<f32>>, InvokeError>;
}

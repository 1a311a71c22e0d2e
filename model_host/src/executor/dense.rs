//! A single fully connected layer, small enough to run on a sensor node.
//!
//! Blob layout, all little-endian:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | magic `"DNS1"` |
//! | 4 | 4 | schema version |
//! | 8 | 2 | inputs `n` |
//! | 10 | 2 | outputs `m` |
//! | 12 | 4 | activation (0 identity, 1 sigmoid, 2 relu) |
//! | 16 | 4·m·n | weights, row-major `m × n` |
//! | .. | 4·m | bias |

use log::debug;
use ndarray::{Array1, Array2, ArrayView1};

use super::ModelExecutor;
use crate::error::{InvokeError, LoadError};

/// Format magic of dense blobs.
pub const DENSE_FORMAT: u32 = u32::from_le_bytes(*b"DNS1");

/// Schema version of dense blobs.
pub const DENSE_VERSION: u32 = 1;

/// Length of the fixed blob header.
pub const DENSE_HEADER_LEN: usize = 16;

const ERR_BAD_MAGIC: i32 = -3;
const ERR_TRUNCATED: i32 = -4;
const ERR_BAD_ACTIVATION: i32 = -5;
const ERR_EMPTY_LAYER: i32 = -6;

/// The activation applied to the layer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenseActivation {
    Identity,
    Sigmoid,
    Relu,
}

impl DenseActivation {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Identity),
            1 => Some(Self::Sigmoid),
            2 => Some(Self::Relu),
            _ => None,
        }
    }

    /// Returns the code stored in the blob header.
    pub fn code(&self) -> u32 {
        match self {
            Self::Identity => 0,
            Self::Sigmoid => 1,
            Self::Relu => 2,
        }
    }

    fn apply(&self, z: &mut Array1<f32>) {
        match self {
            Self::Identity => {}
            Self::Sigmoid => z.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
            Self::Relu => z.mapv_inplace(|v| v.max(0.0)),
        }
    }
}

struct DenseModel {
    weights: Array2<f32>,
    bias: Array1<f32>,
    activation: DenseActivation,
}

/// Executes dense blobs inside a bounded arena.
pub struct DenseExecutor {
    max_arena: usize,
    arena: usize,
    model: Option<DenseModel>,
}

impl DenseExecutor {
    /// Creates a new `DenseExecutor`.
    ///
    /// # Arguments
    /// * `max_arena` - The largest workspace this executor may reserve.
    pub fn new(max_arena: usize) -> Self {
        Self {
            max_arena,
            arena: 0,
            model: None,
        }
    }

    /// Serializes a layer into the dense blob format.
    ///
    /// # Arguments
    /// * `inputs` - The input length `n`.
    /// * `weights` - `m × n` row-major weights.
    /// * `bias` - The `m` biases.
    /// * `activation` - The output activation.
    pub fn encode(
        inputs: u16,
        weights: &[f32],
        bias: &[f32],
        activation: DenseActivation,
    ) -> Vec<u8> {
        let outputs = bias.len() as u16;
        let mut blob = Vec::with_capacity(DENSE_HEADER_LEN + 4 * (weights.len() + bias.len()));

        blob.extend_from_slice(&DENSE_FORMAT.to_le_bytes());
        blob.extend_from_slice(&DENSE_VERSION.to_le_bytes());
        blob.extend_from_slice(&inputs.to_le_bytes());
        blob.extend_from_slice(&outputs.to_le_bytes());
        blob.extend_from_slice(&activation.code().to_le_bytes());

        for v in weights.iter().chain(bias) {
            blob.extend_from_slice(&v.to_le_bytes());
        }

        blob
    }

    /// Workspace needed to hold the input and output tensors of a layer.
    fn required_arena(inputs: usize, outputs: usize) -> usize {
        (inputs + outputs) * size_of::<f32>()
    }

    fn read_u16(blob: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([blob[at], blob[at + 1]])
    }

    fn read_u32(blob: &[u8], at: usize) -> u32 {
        u32::from_le(bytemuck::pod_read_unaligned(&blob[at..at + 4]))
    }

    fn read_floats(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_bits(u32::from_le(bytemuck::pod_read_unaligned(c))))
            .collect()
    }

    fn parse(blob: &[u8]) -> Result<DenseModel, LoadError> {
        if blob.len() < DENSE_HEADER_LEN {
            return Err(LoadError::LoadFailure(ERR_TRUNCATED));
        }

        if Self::read_u32(blob, 0) != DENSE_FORMAT {
            return Err(LoadError::LoadFailure(ERR_BAD_MAGIC));
        }

        let version = Self::read_u32(blob, 4);
        if version != DENSE_VERSION {
            return Err(LoadError::WrongVersion {
                found: version,
                expected: DENSE_VERSION,
            });
        }

        let n = Self::read_u16(blob, 8) as usize;
        let m = Self::read_u16(blob, 10) as usize;
        if n == 0 || m == 0 {
            return Err(LoadError::LoadFailure(ERR_EMPTY_LAYER));
        }

        let activation = DenseActivation::from_code(Self::read_u32(blob, 12))
            .ok_or(LoadError::LoadFailure(ERR_BAD_ACTIVATION))?;

        let weights_end = DENSE_HEADER_LEN + 4 * m * n;
        let bias_end = weights_end + 4 * m;
        if blob.len() < bias_end {
            return Err(LoadError::LoadFailure(ERR_TRUNCATED));
        }

        let weights = Array2::from_shape_vec(
            (m, n),
            Self::read_floats(&blob[DENSE_HEADER_LEN..weights_end]),
        )
        .map_err(|_| LoadError::LoadFailure(ERR_TRUNCATED))?;
        let bias = Array1::from_vec(Self::read_floats(&blob[weights_end..bias_end]));

        Ok(DenseModel {
            weights,
            bias,
            activation,
        })
    }
}

impl ModelExecutor for DenseExecutor {
    fn format(&self) -> u32 {
        DENSE_FORMAT
    }

    fn format_version(&self) -> u32 {
        DENSE_VERSION
    }

    fn load(&mut self, blob: &[u8], arena_size: Option<usize>) -> Result<(), LoadError> {
        self.free();

        let model = Self::parse(blob)?;
        let (m, n) = model.weights.dim();
        let required = Self::required_arena(n, m);
        let reserve = arena_size.unwrap_or(self.max_arena);

        if reserve > self.max_arena || required > reserve {
            return Err(LoadError::ArenaAllocFailure {
                required,
                available: reserve.min(self.max_arena),
            });
        }

        debug!(inputs = n, outputs = m, arena = reserve; "dense model loaded");
        self.arena = reserve;
        self.model = Some(model);
        Ok(())
    }

    fn free(&mut self) {
        self.model = None;
        self.arena = 0;
    }

    fn arena_bytes(&self) -> usize {
        self.model
            .as_ref()
            .map(|model| {
                let (m, n) = model.weights.dim();
                Self::required_arena(n, m)
            })
            .unwrap_or_default()
    }

    fn arena_size(&self) -> usize {
        self.arena
    }

    fn input_shape(&self, idx: usize) -> Option<Vec<u16>> {
        let model = self.model.as_ref().filter(|_| idx == 0)?;
        Some(vec![1, model.weights.ncols() as u16])
    }

    fn output_shape(&self, idx: usize) -> Option<Vec<u16>> {
        let model = self.model.as_ref().filter(|_| idx == 0)?;
        Some(vec![1, model.weights.nrows() as u16])
    }

    fn inputs(&self) -> usize {
        usize::from(self.model.is_some())
    }

    fn input_elements(&self, idx: usize) -> usize {
        match &self.model {
            Some(model) if idx == 0 => model.weights.ncols(),
            _ => 0,
        }
    }

    fn invoke(&mut self, inputs: &[&[f32]]) -> Result<Vec<Vec<f32>>, InvokeError> {
        let model = self.model.as_ref().ok_or(InvokeError::NotReady)?;

        let [input] = inputs else {
            return Err(InvokeError::InputCount {
                got: inputs.len(),
                expected: 1,
            });
        };

        let expected = model.weights.ncols();
        if input.len() != expected {
            return Err(InvokeError::InputMismatch {
                index: 0,
                got: input.len(),
                expected,
            });
        }

        let x = ArrayView1::from(*input);
        let mut z = model.weights.dot(&x) + &model.bias;
        model.activation.apply(&mut z);

        Ok(vec![z.to_vec()])
    }
}

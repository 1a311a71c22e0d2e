pub mod arena;
pub mod builder;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod pipe;
pub mod registers;
pub mod sampler;
pub mod scheduler;
pub mod settings;
pub mod storage;
pub mod upload;

mod host;

pub use host::ModelHost;

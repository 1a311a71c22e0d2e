mod error;
mod flash;
mod store;

pub use error::{Result, StorageError};
pub use flash::{ERASED, FileFlash, Flash, MemFlash};
pub use store::{ALIGNMENT, AppendStore, REGION_HEADER_SIZE, Region};

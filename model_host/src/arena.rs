use std::io;

use crate::settings::Settings;

const ARENA_SIZE_KEY: &str = "#model-host-arena-size";

/// Caches the inference workspace size measured for the stored model.
///
/// The cache never validates the value, whoever replaces the model must
/// `clear` it.
pub struct ArenaSizeCache {
    settings: Box<dyn Settings>,
}

impl ArenaSizeCache {
    /// Creates a new `ArenaSizeCache`.
    ///
    /// # Arguments
    /// * `settings` - The persistent store holding the hint.
    pub fn new(settings: Box<dyn Settings>) -> Self {
        Self { settings }
    }

    /// Returns the cached size, `None` when it is unknown.
    pub fn get(&self) -> Option<usize> {
        self.settings
            .read_number(ARENA_SIZE_KEY)
            .and_then(|size| usize::try_from(size).ok())
    }

    /// Stores a freshly measured size.
    pub fn set(&mut self, size: usize) -> io::Result<()> {
        let size = i64::try_from(size).map_err(io::Error::other)?;
        self.settings.write_number(ARENA_SIZE_KEY, size)
    }

    /// Forgets the cached size.
    pub fn clear(&mut self) -> io::Result<()> {
        self.settings.remove(ARENA_SIZE_KEY)
    }
}

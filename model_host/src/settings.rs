//! Persistent key-value settings, used to keep small derived numbers across restarts.

use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
};

/// A numeric key-value store.
pub trait Settings: Send {
    /// Returns the value stored under `key`, if any.
    fn read_number(&self, key: &str) -> Option<i64>;

    /// Stores `value` under `key`, replacing any previous value.
    fn write_number(&mut self, key: &str, value: i64) -> io::Result<()>;

    /// Removes `key`, removing a missing key is not an error.
    fn remove(&mut self, key: &str) -> io::Result<()>;
}

/// Settings kept in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemSettings {
    values: HashMap<String, i64>,
}

impl MemSettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Settings for MemSettings {
    fn read_number(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    fn write_number(&mut self, key: &str, value: i64) -> io::Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> io::Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// Settings persisted as a JSON object, rewritten on every change.
#[derive(Debug)]
pub struct JsonSettings {
    path: PathBuf,
    values: BTreeMap<String, i64>,
}

impl JsonSettings {
    /// Opens the settings file at `path`, a missing file starts out empty.
    ///
    /// # Errors
    /// An `io::Error` if the file exists but can't be read or parsed.
    pub fn open(path: &Path) -> io::Result<Self> {
        let values = match fs::read(path) {
            Ok(content) => serde_json::from_slice(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };

        Ok(Self {
            path: path.to_path_buf(),
            values,
        })
    }

    fn persist(&self) -> io::Result<()> {
        let content = serde_json::to_vec_pretty(&self.values)?;
        fs::write(&self.path, content)
    }
}

impl Settings for JsonSettings {
    fn read_number(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    fn write_number(&mut self, key: &str, value: i64) -> io::Result<()> {
        self.values.insert(key.to_string(), value);
        self.persist()
    }

    fn remove(&mut self, key: &str) -> io::Result<()> {
        if self.values.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_settings() {
        let mut settings = MemSettings::new();
        assert_eq!(settings.read_number("a"), None);

        settings.write_number("a", 7).unwrap();
        assert_eq!(settings.read_number("a"), Some(7));

        settings.remove("a").unwrap();
        settings.remove("a").unwrap();
        assert_eq!(settings.read_number("a"), None);
    }

    #[test]
    fn test_json_settings_survive_reopen() {
        let path =
            std::env::temp_dir().join(format!("model_host_settings_{}.json", std::process::id()));
        let _ = fs::remove_file(&path);

        {
            let mut settings = JsonSettings::open(&path).unwrap();
            settings.write_number("arena-size", 1234).unwrap();
            settings.write_number("other", -1).unwrap();
            settings.remove("other").unwrap();
        }

        let settings = JsonSettings::open(&path).unwrap();
        assert_eq!(settings.read_number("arena-size"), Some(1234));
        assert_eq!(settings.read_number("other"), None);

        fs::remove_file(&path).unwrap();
    }
}

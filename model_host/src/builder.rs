use std::{io, sync::Arc, time::Duration};

use log::info;

use crate::{
    ModelHost,
    config::HostConfig,
    executor::DenseExecutor,
    sampler::{self, SampleWindow},
    settings::{JsonSettings, MemSettings, Settings},
    storage::{FileFlash, Flash, MemFlash},
};

/// Builds a `ModelHost` out of a `HostConfig`.
pub struct HostBuilder {
    config: HostConfig,
}

impl HostBuilder {
    /// Creates a new `HostBuilder`.
    ///
    /// # Arguments
    /// * `config` - A validated node configuration.
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    /// Opens the configured media and assembles the host.
    ///
    /// # Returns
    /// The host, or the `io::Error` raised opening the flash or settings files.
    pub fn build(self) -> io::Result<ModelHost> {
        let config = self.config;

        let flash: Box<dyn Flash> = match &config.flash_path {
            Some(path) => {
                info!("using file backed store at {}", path.display());
                Box::new(FileFlash::open(path, config.flash_size, config.page_size)?)
            }
            None => Box::new(MemFlash::new(config.flash_size, config.page_size)),
        };

        let settings: Box<dyn Settings> = match &config.settings_path {
            Some(path) => Box::new(JsonSettings::open(path)?),
            None => Box::new(MemSettings::new()),
        };

        let window = Arc::new(SampleWindow::new(config.sample_channels, config.sample_window));
        let executor = Box::new(DenseExecutor::new(config.max_arena_size));

        let mut host = ModelHost::new(
            flash,
            executor,
            settings,
            window.clone(),
            config.auto_invoke_every,
        );

        if config.sample_interval_ms > 0 {
            let interval = Duration::from_millis(config.sample_interval_ms);
            host.spawn(sampler::simulate(window, interval));
        }

        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ModelState;

    #[tokio::test]
    async fn test_build_in_memory_host() {
        let config = HostConfig {
            sample_interval_ms: 0,
            auto_invoke_every: 7,
            ..HostConfig::default()
        };

        let host = HostBuilder::new(config).build().unwrap();
        assert_eq!(host.controller().lock().state(), &ModelState::Empty);
        assert_eq!(host.invoker().every(), 7);
    }
}

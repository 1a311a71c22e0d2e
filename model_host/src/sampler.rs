//! Sensor sample aggregation.

use std::{collections::VecDeque, time::Duration};

use log::{debug, trace};
use parking_lot::Mutex;
use rand::Rng;
use tokio::{sync::watch, time};

/// A source of sensor samples feeding the model inputs.
pub trait SampleSource: Send + Sync {
    /// Returns the amount of samples seen since start, never decreases.
    fn num_samples(&self) -> u64;

    /// Returns the flattened window of recent samples, oldest first.
    fn samples_buffer(&self) -> Vec<f32>;

    /// Subscribes to changes of the sample counter.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Keeps the last `window` readings of `channels` values each.
pub struct SampleWindow {
    channels: usize,
    window: usize,
    readings: Mutex<VecDeque<Vec<f32>>>,
    counter: watch::Sender<u64>,
}

impl SampleWindow {
    /// Creates a new `SampleWindow`.
    ///
    /// # Arguments
    /// * `channels` - The amount of values in a single reading.
    /// * `window` - The amount of readings kept.
    pub fn new(channels: usize, window: usize) -> Self {
        let (counter, _) = watch::channel(0);

        Self {
            channels,
            window,
            readings: Mutex::new(VecDeque::with_capacity(window)),
            counter,
        }
    }

    /// Returns the amount of values in a single reading.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Returns the length of the flattened buffer.
    pub fn len(&self) -> usize {
        self.channels * self.window
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a reading, evicting the oldest one once the window is full.
    ///
    /// # Returns
    /// `false` if the reading doesn't have `channels` values and was dropped.
    pub fn push(&self, reading: &[f32]) -> bool {
        if reading.len() != self.channels {
            debug!(got = reading.len(), expected = self.channels; "dropping reading");
            return false;
        }

        {
            let mut readings = self.readings.lock();
            if readings.len() == self.window {
                readings.pop_front();
            }
            readings.push_back(reading.to_vec());
        }

        self.counter.send_modify(|count| *count += 1);
        true
    }
}

impl SampleSource for SampleWindow {
    fn num_samples(&self) -> u64 {
        *self.counter.borrow()
    }

    fn samples_buffer(&self) -> Vec<f32> {
        let readings = self.readings.lock();
        let missing = self.window - readings.len();

        let mut buf = vec![0.0; missing * self.channels];
        buf.reserve(readings.len() * self.channels);
        for reading in readings.iter() {
            buf.extend_from_slice(reading);
        }

        buf
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.counter.subscribe()
    }
}

/// Feeds `window` with uniform random readings in `[-1, 1)` every `interval`.
pub async fn simulate(window: std::sync::Arc<SampleWindow>, interval: Duration) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let reading: Vec<f32> = {
            let mut rng = rand::rng();
            (0..window.channels())
                .map(|_| rng.random_range(-1.0..1.0))
                .collect()
        };

        window.push(&reading);
        trace!(count = window.num_samples(); "simulated reading");
    }
}

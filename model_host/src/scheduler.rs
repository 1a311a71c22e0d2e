//! Background inference triggered by the sample counter.
//!
//! Eligibility is `every > 0 && count - watermark >= every` with no run in
//! flight. The in-flight flag is taken with a compare-exchange, so no matter
//! how notifications interleave at most one run is queued or executing.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
    },
    time::Instant,
};

use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::{
    error::InvokeError,
    lifecycle::SharedController,
    registers::{self, Register, Report},
    sampler::SampleSource,
};

/// The result of the last inference run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationRecord {
    /// Duration of the executor call in microseconds.
    pub last_run_time_us: u32,
    /// The first output tensor, packed little-endian.
    pub outputs: Vec<u8>,
}

/// Decides when the model runs on its own and runs it.
pub struct AutoInvoker {
    controller: SharedController,
    samples: Arc<dyn SampleSource>,
    every: AtomicU16,
    in_flight: AtomicBool,
    watermark: AtomicU64,
    record: Mutex<InvocationRecord>,
    reports: broadcast::Sender<Report>,
    queue: mpsc::Sender<()>,
}

impl AutoInvoker {
    /// Creates a new `AutoInvoker`.
    ///
    /// # Arguments
    /// * `controller` - The lifecycle controller owning the model.
    /// * `samples` - The source of model inputs and of the sample counter.
    /// * `every` - Samples between automatic runs, 0 disables them.
    /// * `reports` - Where updated outputs are published.
    ///
    /// # Returns
    /// The invoker and the receiving end of its run queue, to be handed to `run`.
    pub fn new(
        controller: SharedController,
        samples: Arc<dyn SampleSource>,
        every: u16,
        reports: broadcast::Sender<Report>,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (queue, rx) = mpsc::channel(1);

        let invoker = Self {
            controller,
            samples,
            every: AtomicU16::new(every),
            in_flight: AtomicBool::new(false),
            watermark: AtomicU64::new(0),
            record: Mutex::new(InvocationRecord::default()),
            reports,
            queue,
        };

        (Arc::new(invoker), rx)
    }

    /// Returns the cadence.
    pub fn every(&self) -> u16 {
        self.every.load(Ordering::Relaxed)
    }

    /// Sets the cadence, 0 disables automatic runs.
    pub fn set_every(&self, every: u16) {
        debug!(every = every; "auto invoke cadence set");
        self.every.store(every, Ordering::Relaxed);
    }

    /// Returns the sample count of the last completed run.
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    /// Returns whether a run is queued or executing.
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Returns a copy of the last run's record.
    pub fn record(&self) -> InvocationRecord {
        self.record.lock().clone()
    }

    /// Reacts to a new sample count.
    ///
    /// # Returns
    /// Whether a run was queued.
    pub fn notify(&self, count: u64) -> bool {
        let every = self.every() as u64;
        if every == 0 || count.saturating_sub(self.watermark()) < every {
            return false;
        }

        if !self.try_begin() {
            trace!(count = count; "run already in flight");
            return false;
        }

        if self.queue.try_send(()).is_err() {
            self.in_flight.store(false, Ordering::Release);
            return false;
        }

        trace!(count = count; "run queued");
        true
    }

    /// Runs the model right away on behalf of the peer.
    ///
    /// # Returns
    /// `false` if a run was already in flight and nothing happened.
    pub fn predict(&self) -> bool {
        if !self.try_begin() {
            debug!("dropping Predict, run already in flight");
            return false;
        }

        self.invoke_once();
        true
    }

    fn try_begin(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Executes one run, the caller must hold the in-flight flag.
    fn invoke_once(&self) {
        let snapshot = self.samples.num_samples();
        let input = self.samples.samples_buffer();

        let start = Instant::now();
        let res = self.controller.lock().invoke(&[&input]);
        let elapsed = start.elapsed();

        match res {
            Ok(outputs) => {
                let outputs = outputs
                    .first()
                    .map(|out| registers::encode_f32s(out))
                    .unwrap_or_default();

                *self.record.lock() = InvocationRecord {
                    last_run_time_us: u32::try_from(elapsed.as_micros()).unwrap_or(u32::MAX),
                    outputs: outputs.clone(),
                };
                self.watermark.store(snapshot, Ordering::Release);

                debug!(count = snapshot, us = elapsed.as_micros() as u64; "model invoked");
                self.publish(outputs);
            }
            Err(InvokeError::NotReady) => {
                trace!(count = snapshot; "no model ready, skipping run");
            }
            Err(e) => {
                self.watermark.store(snapshot, Ordering::Release);
                warn!("model invocation failed: {e}");
            }
        }

        self.in_flight.store(false, Ordering::Release);
    }

    fn publish(&self, outputs: Vec<u8>) {
        let report = Report {
            register: Register::Outputs,
            value: outputs,
        };

        if self.reports.send(report).is_err() {
            trace!("no peer listening for reports");
        }
    }

    /// Executes queued runs until the queue closes.
    pub async fn run(self: Arc<Self>, mut queue: mpsc::Receiver<()>) {
        while queue.recv().await.is_some() {
            self.invoke_once();
        }
    }

    /// Notifies the scheduler of every change of the sample counter.
    pub async fn watch_samples(self: Arc<Self>) {
        let mut counter = self.samples.subscribe();

        loop {
            let count = *counter.borrow_and_update();
            self.notify(count);

            if counter.changed().await.is_err() {
                debug!("sample source is gone");
                break;
            }
        }
    }
}

use std::{borrow::Cow, sync::Arc};

use comms::msg::{Command, Msg};
use log::{debug, warn};

use crate::{
    lifecycle::SharedController,
    registers::{self, Register},
    scheduler::AutoInvoker,
    upload::UploadHandler,
};

/// Routes inbound messages to the node components.
///
/// Registers are computed on demand from the controller and the scheduler,
/// the dispatcher keeps no copy of them.
pub struct Dispatcher {
    controller: SharedController,
    invoker: Arc<AutoInvoker>,
    uploads: UploadHandler,
}

impl Dispatcher {
    /// Creates a new `Dispatcher`.
    ///
    /// # Arguments
    /// * `controller` - The lifecycle controller.
    /// * `invoker` - The auto-invoke scheduler.
    /// * `uploads` - The handler of model transfers.
    pub fn new(controller: SharedController, invoker: Arc<AutoInvoker>, uploads: UploadHandler) -> Self {
        Self {
            controller,
            invoker,
            uploads,
        }
    }

    /// Handles a single inbound message.
    ///
    /// # Returns
    /// The reply to send back, if any.
    pub async fn handle(&mut self, msg: Msg<'_>) -> Option<Msg<'static>> {
        debug!(kind = msg.kind(); "handling message");

        match msg {
            Msg::Get(code) => {
                let Some(reg) = Register::from_code(code) else {
                    debug!(code = code; "ignoring read of unknown register");
                    return None;
                };

                Some(Msg::Report(code, Cow::Owned(self.read(reg))))
            }
            Msg::Set(code, value) => {
                let applied = Register::from_code(code).is_some_and(|reg| self.write(reg, &value));
                if !applied {
                    debug!(code = code; "ignoring write");
                }
                None
            }
            Msg::Command(Command::SetModel { size }) => {
                self.uploads.set_model(size).map(Msg::PipeOpened)
            }
            Msg::Command(Command::Predict) => {
                self.invoker.predict();
                None
            }
            Msg::Command(Command::EraseModel) => {
                self.uploads.erase();
                None
            }
            Msg::PipeData(port, data) => {
                self.uploads.deliver(port, data.into_owned()).await;
                None
            }
            Msg::PipeClose(port) => {
                self.uploads.close(port);
                None
            }
            Msg::Err(e) => {
                warn!("peer reported: {e}");
                None
            }
            other @ (Msg::Report(..) | Msg::PipeOpened(_) | Msg::Unknown(_)) => {
                debug!(kind = other.kind(); "ignoring message");
                None
            }
        }
    }

    /// Serves a register read.
    pub fn read(&self, reg: Register) -> Vec<u8> {
        match reg {
            Register::AutoInvokeEvery => registers::encode_u16(self.invoker.every()),
            Register::Outputs => self.invoker.record().outputs,
            Register::LastRunTime => registers::encode_u32(self.invoker.record().last_run_time_us),
            reg => {
                let ctl = self.controller.lock();
                match reg {
                    Register::InputShape => registers::encode_u16s(&ctl.input_shape()),
                    Register::OutputShape => registers::encode_u16s(&ctl.output_shape()),
                    Register::AllocatedArenaSize => {
                        registers::encode_u32(ctl.allocated_arena_size())
                    }
                    Register::ModelSize => registers::encode_u32(ctl.model_size()),
                    Register::LastError => ctl.last_error().unwrap_or_default().as_bytes().to_vec(),
                    Register::Format => registers::encode_u32(ctl.format()),
                    Register::FormatVersion => registers::encode_u32(ctl.format_version()),
                    _ => Vec::new(),
                }
            }
        }
    }

    /// Serves a register write.
    ///
    /// # Returns
    /// Whether the value was applied, read-only registers and malformed values are ignored.
    pub fn write(&mut self, reg: Register, value: &[u8]) -> bool {
        if !reg.is_writable() {
            return false;
        }

        match registers::decode_u16(value) {
            Some(every) => {
                self.invoker.set_every(every);
                true
            }
            None => false,
        }
    }

    /// Closes the pipe of a transfer that ran to its end.
    ///
    /// # Returns
    /// The close to send to the peer, `None` if the pipe was already closed.
    pub fn pipe_finished(&mut self, port: u16) -> Option<Msg<'static>> {
        self.uploads.close(port).then_some(Msg::PipeClose(port))
    }

    /// Abandons the transfers of a peer that went away.
    pub fn disconnect(&mut self) {
        self.uploads.close_pipes();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{broadcast, mpsc};

    use super::*;
    use crate::{
        arena::ArenaSizeCache,
        executor::{DenseActivation, DenseExecutor},
        lifecycle::ModelController,
        pipe::PipeRegistry,
        sampler::SampleWindow,
        settings::MemSettings,
        storage::{AppendStore, MemFlash},
    };

    fn create_test_dispatcher() -> (Dispatcher, SharedController) {
        let store = AppendStore::new(Box::new(MemFlash::new(1024, 128)));
        let arena = ArenaSizeCache::new(Box::new(MemSettings::new()));
        let ctl =
            ModelController::new(store, Box::new(DenseExecutor::new(256)), arena).into_shared();

        let (reports, _) = broadcast::channel(4);
        let samples = Arc::new(SampleWindow::new(1, 2));
        let (invoker, _) = AutoInvoker::new(ctl.clone(), samples, 0, reports);
        let (finished, _) = mpsc::unbounded_channel();
        let uploads = UploadHandler::new(ctl.clone(), PipeRegistry::new(2), finished);

        (Dispatcher::new(ctl.clone(), invoker, uploads), ctl)
    }

    async fn upload(dispatcher: &mut Dispatcher, blob: &[u8]) {
        let reply = dispatcher
            .handle(Msg::Command(Command::SetModel {
                size: blob.len() as u32,
            }))
            .await;
        let Some(Msg::PipeOpened(port)) = reply else {
            panic!("expected PipeOpened, got {reply:?}");
        };

        for chunk in blob.chunks(16) {
            let reply = dispatcher
                .handle(Msg::PipeData(port, Cow::Borrowed(chunk)))
                .await;
            assert_eq!(reply, None);
        }

        while dispatcher.uploads.in_progress() {
            tokio::task::yield_now().await;
        }
    }

    async fn get(dispatcher: &mut Dispatcher, reg: Register) -> Vec<u8> {
        match dispatcher.handle(Msg::Get(reg.code())).await {
            Some(Msg::Report(code, value)) if code == reg.code() => value.into_owned(),
            other => panic!("expected a report of {reg:?}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_registers_of_an_empty_node() {
        let (mut dispatcher, _) = create_test_dispatcher();

        assert_eq!(get(&mut dispatcher, Register::ModelSize).await, vec![0; 4]);
        assert_eq!(get(&mut dispatcher, Register::LastError).await, Vec::<u8>::new());
        assert_eq!(get(&mut dispatcher, Register::InputShape).await, Vec::<u8>::new());
        assert_eq!(get(&mut dispatcher, Register::Outputs).await, Vec::<u8>::new());
        assert_eq!(
            get(&mut dispatcher, Register::Format).await,
            b"DNS1".to_vec()
        );
        assert_eq!(dispatcher.handle(Msg::Get(0x42)).await, None);
    }

    #[tokio::test]
    async fn test_only_cadence_is_writable() {
        let (mut dispatcher, _) = create_test_dispatcher();

        let reply = dispatcher
            .handle(Msg::Set(0x80, Cow::Borrowed(&50u16.to_le_bytes()[..])))
            .await;
        assert_eq!(reply, None);
        assert_eq!(get(&mut dispatcher, Register::AutoInvokeEvery).await, vec![50, 0]);

        assert!(!dispatcher.write(Register::ModelSize, &[1, 0, 0, 0]));
        assert!(!dispatcher.write(Register::AutoInvokeEvery, &[1]));
        assert_eq!(get(&mut dispatcher, Register::ModelSize).await, vec![0; 4]);
    }

    #[tokio::test]
    async fn test_upload_predict_and_erase() {
        let (mut dispatcher, ctl) = create_test_dispatcher();
        let blob = DenseExecutor::encode(2, &[2.0, 1.0], &[0.25], DenseActivation::Identity);

        upload(&mut dispatcher, &blob).await;
        assert!(ctl.lock().is_ready());
        assert_eq!(
            get(&mut dispatcher, Register::ModelSize).await,
            (blob.len() as u32).to_le_bytes()
        );
        assert_eq!(get(&mut dispatcher, Register::InputShape).await, vec![1, 0, 2, 0]);
        assert_eq!(get(&mut dispatcher, Register::OutputShape).await, vec![1, 0, 1, 0]);

        assert_eq!(dispatcher.handle(Msg::Command(Command::Predict)).await, None);
        assert_eq!(
            get(&mut dispatcher, Register::Outputs).await,
            0.25f32.to_le_bytes()
        );

        assert_eq!(dispatcher.handle(Msg::Command(Command::EraseModel)).await, None);
        assert_eq!(get(&mut dispatcher, Register::ModelSize).await, vec![0; 4]);
        assert_eq!(get(&mut dispatcher, Register::AllocatedArenaSize).await, vec![0; 4]);
    }

    #[tokio::test]
    async fn test_load_failure_is_served_as_last_error() {
        let (mut dispatcher, _) = create_test_dispatcher();
        let mut blob = DenseExecutor::encode(1, &[1.0], &[0.0], DenseActivation::Identity);
        blob[4..8].copy_from_slice(&2u32.to_le_bytes());

        upload(&mut dispatcher, &blob).await;

        let err = get(&mut dispatcher, Register::LastError).await;
        assert_eq!(
            String::from_utf8(err).unwrap(),
            "Model provided is schema version 2 not equal to supported version 1."
        );
    }

    #[tokio::test]
    async fn test_oversize_set_model_is_dropped() {
        let (mut dispatcher, _) = create_test_dispatcher();
        let reply = dispatcher
            .handle(Msg::Command(Command::SetModel { size: 1 << 16 }))
            .await;
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_unknown_messages_are_ignored() {
        let (mut dispatcher, _) = create_test_dispatcher();

        assert_eq!(dispatcher.handle(Msg::Unknown(1)).await, None);
        assert_eq!(dispatcher.handle(Msg::Unknown(42)).await, None);
        assert_eq!(get(&mut dispatcher, Register::ModelSize).await, vec![0; 4]);
    }

    #[tokio::test]
    async fn test_finished_pipe_is_closed_once() {
        let (mut dispatcher, _) = create_test_dispatcher();
        let blob = DenseExecutor::encode(1, &[1.0], &[0.0], DenseActivation::Identity);

        upload(&mut dispatcher, &blob).await;

        let port = 1;
        assert_eq!(dispatcher.pipe_finished(port), Some(Msg::PipeClose(port)));
        assert_eq!(dispatcher.pipe_finished(port), None);
    }
}

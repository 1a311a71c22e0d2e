//! Service assembly: one owned instance wiring the node components together.

use std::{borrow::Cow, future::Future, io, sync::Arc};

use comms::msg::Msg;
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc},
    task::JoinSet,
};

use crate::{
    arena::ArenaSizeCache,
    dispatch::Dispatcher,
    executor::ModelExecutor,
    lifecycle::{ModelController, SharedController},
    pipe::PipeRegistry,
    registers::Report,
    sampler::SampleSource,
    scheduler::AutoInvoker,
    settings::Settings,
    storage::{AppendStore, Flash},
    upload::UploadHandler,
};

const INBOUND_DEPTH: usize = 16;
const REPORTS_DEPTH: usize = 16;
const PIPE_DEPTH: usize = 4;

/// The model host node.
pub struct ModelHost {
    controller: SharedController,
    invoker: Arc<AutoInvoker>,
    dispatcher: Dispatcher,
    reports: broadcast::Sender<Report>,
    finished: mpsc::UnboundedReceiver<u16>,
    tasks: JoinSet<()>,
}

impl ModelHost {
    /// Creates a new `ModelHost`, restoring any model committed before a restart.
    ///
    /// Spawns the scheduler tasks, so it must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `flash` - The medium the model is stored in.
    /// * `executor` - The inference engine.
    /// * `settings` - The persistent settings holding the arena hint.
    /// * `samples` - The sensor sample source.
    /// * `every` - The initial auto-invoke cadence.
    pub fn new(
        flash: Box<dyn Flash>,
        executor: Box<dyn ModelExecutor>,
        settings: Box<dyn Settings>,
        samples: Arc<dyn SampleSource>,
        every: u16,
    ) -> Self {
        let store = AppendStore::new(flash);
        let arena = ArenaSizeCache::new(settings);

        let mut controller = ModelController::new(store, executor, arena);
        controller.restore();
        let controller = controller.into_shared();

        let (reports, _) = broadcast::channel(REPORTS_DEPTH);
        let (invoker, queue) =
            AutoInvoker::new(controller.clone(), samples, every, reports.clone());

        let mut tasks = JoinSet::new();
        tasks.spawn(invoker.clone().run(queue));
        tasks.spawn(invoker.clone().watch_samples());

        let (finished_tx, finished) = mpsc::unbounded_channel();
        let uploads = UploadHandler::new(
            controller.clone(),
            PipeRegistry::new(PIPE_DEPTH),
            finished_tx,
        );
        let dispatcher = Dispatcher::new(controller.clone(), invoker.clone(), uploads);

        Self {
            controller,
            invoker,
            dispatcher,
            reports,
            finished,
            tasks,
        }
    }

    /// Runs `task` for as long as the host lives.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    pub fn controller(&self) -> &SharedController {
        &self.controller
    }

    pub fn invoker(&self) -> &Arc<AutoInvoker> {
        &self.invoker
    }

    /// Serves a single peer until it hangs up.
    ///
    /// Requests are handled strictly in arrival order, reports published by
    /// the scheduler and the closing of finished upload pipes are interleaved
    /// between them.
    ///
    /// # Arguments
    /// * `rx` - The reading half of the connection.
    /// * `tx` - The writing half of the connection.
    ///
    /// # Returns
    /// `Ok(())` once the peer hung up, the `io::Error` that broke the connection otherwise.
    pub async fn serve<R, W>(&mut self, rx: R, tx: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let (rx, mut tx) = comms::channel(rx, tx);
        let (inbound_tx, mut inbound) = mpsc::channel(INBOUND_DEPTH);
        let mut reports = self.reports.subscribe();

        let reader = tokio::spawn(read_frames(rx, inbound_tx));

        let res = loop {
            tokio::select! {
                msg = inbound.recv() => {
                    let Some(msg) = msg else {
                        break Ok(());
                    };

                    if let Some(reply) = self.dispatcher.handle(msg).await {
                        if let Err(e) = tx.send(&reply).await {
                            break Err(e);
                        }
                    }
                }
                Some(port) = self.finished.recv() => {
                    if let Some(close) = self.dispatcher.pipe_finished(port) {
                        if let Err(e) = tx.send(&close).await {
                            break Err(e);
                        }
                    }
                }
                report = reports.recv() => match report {
                    Ok(Report { register, value }) => {
                        let msg = Msg::Report(register.code(), Cow::Owned(value));
                        if let Err(e) = tx.send(&msg).await {
                            break Err(e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("peer too slow, {n} reports dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                },
            }
        };

        self.dispatcher.disconnect();
        reader.abort();

        match reader.await {
            Ok(Err(e)) if e.kind() != io::ErrorKind::UnexpectedEof => {
                res?;
                Err(e)
            }
            _ => {
                info!("peer disconnected");
                res
            }
        }
    }
}

async fn read_frames<R>(
    mut rx: comms::FrameReceiver<R>,
    inbound: mpsc::Sender<Msg<'static>>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();

    loop {
        let msg: Msg = rx.recv_into(&mut buf).await?;
        if let Msg::Unknown(kind) = msg {
            debug!(kind = kind; "skipping unknown message");
            continue;
        }

        debug!(kind = msg.kind(); "frame received");

        if inbound.send(msg.into_owned()).await.is_err() {
            return Ok(());
        }
    }
}

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engines::{ImageEmbedding, VisionModel};
use crate::error::ServerError;

/// How long the terminal error line may wait for room in the channel
const TERMINAL_GRACE: Duration = Duration::from_secs(1);

type ChunkSender = mpsc::Sender<Result<String, ServerError>>;

/// Everything a streaming worker needs, moved onto its thread
pub(crate) struct StreamJob {
    pub model: Arc<dyn VisionModel>,
    pub embedding: ImageEmbedding,
    pub prompt: String,
    pub tx: ChunkSender,
    pub cancel: CancellationToken,
    pub timeout: Duration,
    pub request_id: String,
    /// Runtime that drives the channel and the deadline timer
    pub runtime: Handle,
}

enum Stop {
    Finished,
    Cancelled,
    Disconnected,
    TimedOut,
}

/// Spawn a dedicated thread that drives one streaming generation.
///
/// The thread is never reused. It exits when generation completes, the
/// consumer goes away, the token is cancelled or the deadline passes, even
/// while it is waiting for a consumer that stopped reading.
pub(crate) fn spawn_stream_worker(job: StreamJob) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("generate-{}", job.request_id))
        .spawn(move || run_stream_job(job))
        .map(|_| ())
}

/// Wait for room in the channel, giving up on cancellation or the deadline.
fn send_chunk(
    runtime: &Handle,
    tx: &ChunkSender,
    text: &str,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<(), Stop> {
    runtime.block_on(async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Stop::Cancelled),
            _ = tokio::time::sleep_until(deadline.into()) => Err(Stop::TimedOut),
            sent = tx.send(Ok(text.to_string())) => sent.map_err(|_| Stop::Disconnected),
        }
    })
}

fn run_stream_job(job: StreamJob) {
    let StreamJob {
        model,
        embedding,
        prompt,
        tx,
        cancel,
        timeout,
        request_id,
        runtime,
    } = job;

    let deadline = Instant::now() + timeout;
    let mut stop = Stop::Finished;
    let mut chunks = 0usize;

    let result = model.generate(embedding, &prompt, &mut |text| {
        if cancel.is_cancelled() {
            stop = Stop::Cancelled;
            return ControlFlow::Break(());
        }
        if Instant::now() >= deadline {
            stop = Stop::TimedOut;
            return ControlFlow::Break(());
        }
        match send_chunk(&runtime, &tx, text, &cancel, deadline) {
            Ok(()) => {
                chunks += 1;
                ControlFlow::Continue(())
            }
            Err(reason) => {
                stop = reason;
                ControlFlow::Break(())
            }
        }
    });

    let terminal = match (result, stop) {
        (Err(e), _) => {
            tracing::error!("[{}] Generation failed: {:#}", request_id, e);
            Some(ServerError::inference(format!("{:#}", e)))
        }
        (Ok(()), Stop::Finished) => {
            tracing::info!("[{}] Stream finished after {} chunks", request_id, chunks);
            None
        }
        (Ok(()), Stop::Disconnected) => {
            tracing::info!("[{}] Client went away after {} chunks", request_id, chunks);
            None
        }
        (Ok(()), Stop::Cancelled) => {
            tracing::info!("[{}] Stream cancelled after {} chunks", request_id, chunks);
            // Still attached means the service is shutting down.
            (!tx.is_closed()).then_some(ServerError::Unavailable)
        }
        (Ok(()), Stop::TimedOut) => {
            tracing::warn!("[{}] Stream timed out after {:?}", request_id, timeout);
            Some(ServerError::Timeout(timeout))
        }
    };

    if let Some(err) = terminal {
        let delivered = runtime.block_on(async {
            tokio::time::timeout(TERMINAL_GRACE, tx.send(Err(err))).await
        });
        if !matches!(delivered, Ok(Ok(()))) {
            tracing::debug!("[{}] Terminal error line not delivered", request_id);
        }
    }
}

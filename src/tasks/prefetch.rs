use std::sync::Arc;

use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::{Completion, DecodeQueues, DecodeTask, RollingBuffer};
use crate::bus::Publisher;
use crate::decode::{DecodedFrame, FrameDecoder};
use crate::error::DecodeError;
use crate::events::{SignalKind, Tier};

type Finished = Option<(usize, u64, Result<DecodedFrame, DecodeError>)>;

/// Drains the forward and backward prefetch queues with at most `max_in_flight`
/// decodes running on the blocking pool, applying results to `buffer`.
///
/// Publishes `frame_ready` for every applied tier and `decode_failed` once per failure.
pub async fn run(
    buffer: Arc<RollingBuffer>,
    mut queues: DecodeQueues,
    decoder: Arc<dyn FrameDecoder>,
    publisher: Publisher,
    cancel: CancellationToken,
    max_in_flight: usize,
) {
    let max_in_flight = max_in_flight.max(1);
    let mut tasks: JoinSet<Finished> = JoinSet::new();

    loop {
        select! {
            _ = cancel.cancelled() => break,

            Some(task) = queues.forward.recv(), if tasks.len() < max_in_flight => {
                spawn_decode(&mut tasks, &decoder, &buffer, task);
            }

            Some(task) = queues.backward.recv(), if tasks.len() < max_in_flight => {
                spawn_decode(&mut tasks, &decoder, &buffer, task);
            }

            Some(joined) = tasks.join_next() => {
                let Ok(Some((index, ticket, result))) = joined else {
                    continue;
                };
                match buffer.complete(index, ticket, result) {
                    Completion::Applied(tier) => {
                        publisher.publish(SignalKind::FrameReady { index, tier }).await;
                    }
                    Completion::Failed(detail) => {
                        warn!(index, %detail, "decode failed");
                        publisher.publish(SignalKind::DecodeFailed { index, detail }).await;
                    }
                    Completion::Discarded => debug!(index, ticket, "decode result discarded"),
                }
            }

            else => break,
        }
    }

    buffer.shutdown();
    // Blocking decodes already running finish on their own; their results are dropped.
    tasks.abort_all();
    debug!("prefetch stopped");
}

fn spawn_decode(
    tasks: &mut JoinSet<Finished>,
    decoder: &Arc<dyn FrameDecoder>,
    buffer: &RollingBuffer,
    task: DecodeTask,
) {
    let DecodeTask {
        index,
        ticket,
        tier,
        job,
        cancel,
    } = task;
    if cancel.is_cancelled() {
        debug!(index, ?tier, "skipping decode for slot that left the window");
        return;
    }
    let decoder = Arc::clone(decoder);
    let source = Arc::clone(buffer.source());
    tasks.spawn(async move {
        let job = match job {
            Ok(job) => job,
            Err(err) => return Some((index, ticket, Err(err))),
        };
        let decoded = tokio::task::spawn_blocking(move || {
            if cancel.is_cancelled() {
                return None;
            }
            let result = decoder.decode(&job);
            // A thumbnail saved for this job is recorded in the index.
            if let (Ok(_), Tier::Thumbnail, Some(saved)) =
                (&result, job.tier, job.thumbnail_cache.as_deref())
            {
                if saved.is_file() {
                    source.remember_thumbnail(index, saved);
                }
            }
            Some(result)
        })
        .await;
        match decoded {
            Ok(Some(result)) => Some((index, ticket, result)),
            Ok(None) => None,
            Err(err) => {
                warn!(index, %err, "decode task aborted");
                Some((index, ticket, Err(DecodeError::Aborted { index })))
            }
        }
    });
}

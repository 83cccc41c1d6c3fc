//! Driver loops. Each owns its consumer and is the only place offsets are
//! committed from.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::kafka::consumer::{ConsumerError, MessageSource, OffsetCommitter};
use crate::runtime::{BufferedItem, BufferedRuntime, Cmd, Model, Msg};
use crate::strategy::{ProcessPoolStrategy, StrategyError};

/// How long to back off when the pool queue is full.
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(10);

/// Run `msg` through `update` until the runtime stops emitting commands.
async fn dispatch<T: BufferedItem + 'static>(
    runtime: &BufferedRuntime<T>,
    model: &mut Model<T>,
    committer: &dyn OffsetCommitter,
    msg: Msg<T>,
) -> Result<()> {
    let mut next = Some(msg);
    while let Some(msg) = next.take() {
        match runtime.update(model, msg).await? {
            None => {}
            Some(Cmd::Task(msg)) => next = Some(msg),
            Some(Cmd::Commit { msg, offsets }) => {
                committer
                    .commit(&offsets)
                    .await
                    .context("failed to commit offsets after flush")?;
                next = Some(msg);
            }
        }
    }
    Ok(())
}

/// Drive a buffered runtime until the source closes or `shutdown` fires.
///
/// A flush or commit failure ends the loop with an error; the process is
/// expected to restart and resume from the last committed offsets. On a clean
/// shutdown whatever is still buffered is flushed first.
pub async fn run_buffered<T: BufferedItem + 'static>(
    runtime: &BufferedRuntime<T>,
    source: &dyn MessageSource,
    committer: &dyn OffsetCommitter,
    subscription_interval: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let (mut model, init_cmd) = runtime.init();
    if let Some(Cmd::Task(msg)) = init_cmd {
        dispatch(runtime, &mut model, committer, msg).await?;
    }

    let mut ticker = tokio::time::interval(subscription_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, stopping buffered consumer");
                break;
            }
            _ = ticker.tick() => {
                if let Some(msg) = runtime.subscription(&model) {
                    dispatch(runtime, &mut model, committer, msg).await?;
                }
            }
            received = source.recv() => match received {
                Ok(message) => {
                    if let Some(msg) = runtime.process(&message) {
                        dispatch(runtime, &mut model, committer, msg).await?;
                    }
                }
                Err(ConsumerError::Closed) => {
                    info!("Message source closed");
                    break;
                }
                Err(e) => {
                    error!("Fatal consumer error: {e:#}");
                    return Err(e).context("consumer failed");
                }
            },
        }
    }

    if !model.is_empty() {
        info!(items = model.len(), "Flushing remaining buffer before exit");
        dispatch(runtime, &mut model, committer, Msg::Flush).await?;
    }
    Ok(())
}

/// Drive a process pool strategy until the source closes or `shutdown` fires,
/// then join with `join_timeout` and tear the pool down. Work abandoned by
/// the join is aborted rather than waited for.
pub async fn run_process_pool(
    strategy: &mut ProcessPoolStrategy,
    source: &dyn MessageSource,
    poll_interval: Duration,
    join_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome: Result<()> = async {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping process pool consumer");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    strategy.poll().await?;
                }
                received = source.recv() => match received {
                    Ok(message) => {
                        let mut message = message;
                        loop {
                            match strategy.submit(message) {
                                Ok(()) => break,
                                Err((StrategyError::MessageRejected(_), rejected)) => {
                                    message = rejected;
                                    strategy.poll().await?;
                                    tokio::time::sleep(BACKPRESSURE_PAUSE).await;
                                }
                                Err((e, _)) => return Err(e.into()),
                            }
                        }
                        strategy.poll().await?;
                    }
                    Err(ConsumerError::Closed) => {
                        info!("Message source closed");
                        return Ok(());
                    }
                    Err(e) => return Err(e).context("consumer failed"),
                },
            }
        }
    }
    .await;

    if let Err(e) = &outcome {
        warn!("Process pool loop ended with error, joining before exit: {e:#}");
    }
    let joined = strategy.join(join_timeout).await;
    if strategy.abandoned() > 0 {
        strategy.terminate().await;
    } else {
        strategy.close().await;
    }

    outcome?;
    joined.context("failed to commit offsets while joining")?;
    Ok(())
}

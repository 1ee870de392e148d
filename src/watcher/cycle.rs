//! The polling task: one long-lived loop that repeatedly drains new blocks from the
//! reader into the handler, then sleeps until the next poll.

use super::lifecycle::LoopControl;
use super::status::WatcherState;
use crate::handler::action_handler::ActionHandler;
use crate::handler::persistence::Persistence;
use crate::reader::block_reader::BlockReader;
use crate::reader::source::BlockSource;
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// State shared between [`super::Watcher`] and its polling task.
pub(crate) struct WatchShared<S, P: Persistence> {
    pub reader: Mutex<BlockReader<S>>,
    pub handler: Mutex<ActionHandler<P>>,
    pub state: Arc<WatcherState>,
    pub telemetry: Arc<Telemetry>,
    pub control: LoopControl,
    pub poll_interval: Duration,
    pub auto_resume: bool,
    pub span: Span,
}

pub(crate) async fn watch_loop<S, P>(
    shared: Arc<WatchShared<S, P>>,
    is_replay: bool,
    run_token: CancellationToken,
) where
    S: BlockSource + 'static,
    P: Persistence,
{
    let span = shared.span.clone();
    run_cycles(shared, is_replay, run_token).instrument(span).await
}

async fn run_cycles<S, P>(shared: Arc<WatchShared<S, P>>, mut is_replay: bool, run_token: CancellationToken)
where
    S: BlockSource + 'static,
    P: Persistence,
{
    let state = &shared.state;
    shared.reader.lock().await.set_cancellation(run_token.clone());
    loop {
        {
            let mut alive = shared.control.lock_alive();
            if state.settle_pause() {
                *alive = false;
                tracing::info!("indexing paused");
                break;
            }
            state.begin_cycle();
        }

        let started = Instant::now();
        match check_for_blocks(&shared, is_replay, &run_token).await {
            Ok(()) => {}
            Err(err) if run_token.is_cancelled() => {
                tracing::info!(error = %format!("{err:#}"), "cycle interrupted by shutdown");
            }
            Err(err) => {
                shared.telemetry.record_cycle_error();
                tracing::error!(error = %format!("{err:#}"), "indexing stopped due to an error");
                let mut alive = shared.control.lock_alive();
                state.record_failure(err);
                if !shared.auto_resume {
                    *alive = false;
                    break;
                }
                tracing::info!(
                    retry_in_ms = shared.poll_interval.as_millis() as u64,
                    "auto-resume enabled; will retry after the poll interval"
                );
            }
        }
        is_replay = false;

        if !state.pause_requested() {
            let wait = shared.poll_interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = run_token.cancelled() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = shared.control.woken() => {
                    is_replay = shared.control.take_replay();
                }
            }
        }

        if run_token.is_cancelled() {
            let mut alive = shared.control.lock_alive();
            *alive = false;
            state.mark_stopped();
            tracing::info!("polling task cancelled");
            break;
        }
    }
}

/// Processes blocks until the reader catches up with the head observed during this
/// cycle, a pause or shutdown is requested, or the reader has nothing new.
pub(crate) async fn check_for_blocks<S, P>(
    shared: &WatchShared<S, P>,
    is_replay: bool,
    run_token: &CancellationToken,
) -> Result<()>
where
    S: BlockSource,
    P: Persistence,
{
    let mut head_block_number: Option<u64> = None;

    loop {
        if let Some(head) = head_block_number {
            let current = shared.reader.lock().await.current_block_number();
            if current >= head {
                break;
            }
        }

        if run_token.is_cancelled() {
            tracing::info!("shutdown requested; leaving block loop");
            return Ok(());
        }

        if shared.state.pause_requested() {
            shared.state.clear_velocity();
            tracing::info!("pause requested; leaving block loop");
            return Ok(());
        }

        let read_started = Instant::now();
        let next_block = shared.reader.lock().await.get_next_block().await?;
        let read_finished = Instant::now();
        if !next_block.block_meta.is_new_block {
            break;
        }

        let next_needed = shared
            .handler
            .lock()
            .await
            .handle_block(&next_block, is_replay)
            .await?;
        let handle_finished = Instant::now();

        let block_number = next_block.block.number();
        if next_block.block_meta.is_rollback {
            shared.telemetry.record_rollback();
        }
        if next_needed.is_none() {
            shared.telemetry.record_processed_block();
        }
        shared.state.record_interval(read_started, handle_finished);
        tracing::info!(
            block_number,
            actions = next_block.block.actions.len(),
            elapsed_ms = (handle_finished - read_started).as_millis() as u64,
            "processed block"
        );
        tracing::debug!(
            block_number,
            read_ms = (read_finished - read_started).as_millis() as u64,
            handle_ms = (handle_finished - read_finished).as_millis() as u64,
            "block timings"
        );

        let mut reader = shared.reader.lock().await;
        if let Some(block_number) = next_needed {
            shared.telemetry.record_seek();
            reader.seek_to_block(block_number).await?;
        }
        head_block_number = Some(reader.head_block_number());
    }

    Ok(())
}

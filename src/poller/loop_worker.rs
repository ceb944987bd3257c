use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{RelayError, RelayResult},
    lifecycle::TickMerge,
    service::StreamContext,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub async fn poll_loop(ctx: Arc<StreamContext>, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_tick(&ctx).await {
                    Ok(TickMerge::Disconnected) => {
                        log_warn!("stream {} is disconnected, polling stopped", ctx.stream_id());
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => log_error!("poll tick failed for stream {}: {err}", ctx.stream_id()),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("poll loop for stream {} shutting down", ctx.stream_id());
                break;
            }
        }
    }
}

/// One poll tick. An unreachable or slow agent disconnects the stream and
/// yields `TickMerge::Disconnected` instead of an error.
pub async fn run_tick(ctx: &StreamContext) -> RelayResult<TickMerge> {
    if !ctx.tracker.is_connected().await {
        return Ok(TickMerge::Disconnected);
    }

    match fetch_and_merge(ctx).await {
        Err(RelayError::Transport(err)) if err.is_transport() => {
            log_warn!("stream {}: poll failed: {err}", ctx.stream_id());
            ctx.tracker.disconnect().await?;
            Ok(TickMerge::Disconnected)
        }
        other => other,
    }
}

async fn fetch_and_merge(ctx: &StreamContext) -> RelayResult<TickMerge> {
    let stream_id = ctx.stream_id();
    // The batch belongs to whatever session is open now, not at merge time.
    let target = ctx.tracker.open_session_id().await?;

    let now = ctx.bounded(ctx.agent.get_current_time(stream_id)).await?;
    ctx.clock.observe(now);

    let processes = ctx.bounded(ctx.agent.get_processes(stream_id)).await?;
    let data = ctx
        .bounded(ctx.agent.get_incremental_data(stream_id, ctx.cursor()))
        .await?;
    let received = data.batch.len();

    let merged = ctx
        .tracker
        .merge_tick(target, processes, data.batch, ctx.config.allocation_count_limit)
        .await?;

    match &merged {
        TickMerge::Merged { session_id, report } => {
            if report.changed() {
                ctx.cache.invalidate_session(*session_id);
            }
            log_debug!(
                "stream {stream_id}: {received} record(s) polled, {} inserted, {} closed, {} duplicate, {} pruned",
                report.inserted,
                report.closed,
                report.duplicates,
                report.pruned
            );
        }
        TickMerge::NoSession if received > 0 => {
            log_debug!("stream {stream_id}: no open session, dropped {received} record(s)");
        }
        _ => {}
    }

    if merged != TickMerge::Disconnected {
        ctx.advance_cursor(data.next_cursor);
    }
    Ok(merged)
}

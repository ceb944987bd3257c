use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::service::StreamContext;

use super::loop_worker::poll_loop;

/// Owns the periodic poll task of one stream.
pub struct PollController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl PollController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    /// True while the poll task runs. A loop that stopped itself after a
    /// disconnect counts as not running.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn start(&mut self, ctx: Arc<StreamContext>) -> Result<()> {
        if self.is_running() {
            bail!("polling already active for stream {}", ctx.stream_id());
        }

        info!("starting poll loop for stream {}", ctx.stream_id());
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(ctx, cancel_token.clone()));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Cancel future ticks and wait for the task. A tick already merging
    /// finishes first; what it merged stays.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("poll loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for PollController {
    fn default() -> Self {
        Self::new()
    }
}

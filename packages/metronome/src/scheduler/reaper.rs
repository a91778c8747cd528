//! Cleanup loop: reverts lapsed leases and drops expired results.
//!
//! This is the crash-recovery path. A node that dies holding claims does
//! nothing wrong from the store's point of view; its leases simply lapse and
//! the next cleanup makes the entities claimable again.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use super::SchedulerContext;

pub(crate) struct ReaperLoop {
    ctx: Arc<SchedulerContext>,
}

impl ReaperLoop {
    pub(crate) fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn run(self, shutdown: CancellationToken) {
        info!("reaper starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.config.cleanup_interval) => {}
            }
            match self.ctx.store.cleanup().await {
                Ok(()) => trace!("store cleanup complete"),
                Err(error) if error.is_transient() => {
                    error!(error = %error, "store cleanup failed");
                }
                Err(error) => {
                    self.ctx.record_fatal(&error);
                    break;
                }
            }
        }
        info!("reaper stopped");
    }
}

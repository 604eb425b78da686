use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One run of a shipping pipeline
#[async_trait]
pub trait Cycle: Send {
    async fn run_once(&mut self, cancel: &CancellationToken) -> Result<()>;
}

/// Shortest period the scheduler will tick at
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Fixed-interval driver: runs the cycle once right away, then on every tick
/// until `cancel` fires. Cycle errors are logged and never stop the loop.
pub struct Scheduler {
    poll_interval: Duration,
}

impl Scheduler {
    /// A zero `poll_interval` is raised to one millisecond
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    pub async fn run(&self, cycle: &mut dyn Cycle, cancel: &CancellationToken) -> Result<()> {
        // The first tick completes immediately, which gives the startup run
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            debug!("starting cycle");
            if let Err(e) = cycle.run_once(cancel).await {
                error!("cycle failed error={:#}", e);
            }
        }
    }
}

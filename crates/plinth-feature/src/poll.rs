//! Bounded fixed-interval readiness polling

use std::future::Future;
use std::time::Duration;

use plinth_common::{Error, Result};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default time between readiness checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default bound on a single readiness wait
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Interval and bound of a readiness poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Time between checks
    pub interval: Duration,
    /// Total time before giving up
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Run `check` every `config.interval` until it reports ready
///
/// The first check runs one interval after the call. Outcomes:
/// - `Ok(())` as soon as a check returns `Ok(true)`
/// - the check's own error, unchanged, as soon as a check fails
/// - `Error::Timeout` once `config.timeout` has elapsed, including while a
///   check is still in flight
/// - `Error::Cancelled` as soon as `cancel` fires
/// - `Error::Validation` without checking anything when the interval is zero
pub async fn poll_until_ready<F, Fut>(
    cancel: &CancellationToken,
    config: PollConfig,
    what: &str,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    if config.interval.is_zero() {
        return Err(Error::validation(format!(
            "poll interval for {what} must be greater than zero"
        )));
    }
    let deadline = Instant::now() + config.timeout;
    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(what)),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::timeout(what, config.timeout));
            }
            _ = ticker.tick() => {}
        }

        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(what)),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::timeout(what, config.timeout));
            }
            result = check() => result?,
        };

        if ready {
            return Ok(());
        }
        trace!(what, "still waiting");
    }
}

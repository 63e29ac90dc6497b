//! Join-until-connected retry loop.

use std::time::Duration;

use arena_types::{ArenaError, Result};

use crate::shutdown::ShutdownSignal;
use crate::uplink::ClusterUplink;

/// Default pause between join attempts.
pub const DEFAULT_JOIN_RETRY: Duration = Duration::from_secs(10);

/// Joins the cluster through `addrs`, retrying every `interval` until at
/// least one member was reached.
///
/// Join errors are logged and retried. Returns the joined count, `Ok(0)`
/// right away when there is nothing to join (a seed member), or
/// `Err(Cancelled)` if `shutdown` fires first.
pub async fn join_with_retry(
    uplink: &dyn ClusterUplink,
    addrs: &[String],
    interval: Duration,
    shutdown: &ShutdownSignal,
) -> Result<usize> {
    if addrs.is_empty() {
        tracing::info!(member = %uplink.local_name(), "no join addresses, acting as seed");
        return Ok(0);
    }

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match uplink.join(addrs).await {
            Ok(joined) if joined > 0 => {
                tracing::info!(member = %uplink.local_name(), joined, attempt, "joined cluster");
                return Ok(joined);
            }
            Ok(_) => {
                tracing::warn!(member = %uplink.local_name(), attempt, "no cluster members reached, retrying");
            }
            Err(e) => {
                tracing::warn!(member = %uplink.local_name(), attempt, %e, "cluster join failed, retrying");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.wait() => return Err(ArenaError::Cancelled),
        }
    }
}

//! Heartbeat liveness monitoring.

use std::sync::Arc;

use metrics::counter;
use tether_core::metrics::HEARTBEAT_TIMEOUTS_TOTAL;
use tether_core::{Envelope, ResourceError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::connection::{CloseReason, ConnectionLink};
use crate::config::HeartbeatPolicy;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The device stayed silent for `max_missed` intervals.
    TimedOut,
    /// The link closed for another reason.
    Cancelled,
}

/// Monitor liveness for one connection until it times out or closes.
///
/// At each interval tick the link's alive flag is read and cleared. A tick
/// with no liveness since the previous one counts as a miss and sends a
/// `ping` envelope; `max_missed` consecutive misses close the link with
/// `HEARTBEAT_TIMEOUT`. The first tick fires one interval after admission,
/// so a device silent from the start is closed after `max_missed × H`.
pub async fn run_heartbeat(link: Arc<ConnectionLink>, policy: HeartbeatPolicy) -> HeartbeatResult {
    let mut ticks = time::interval_at(Instant::now() + policy.interval, policy.interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_missed = policy.max_missed.max(1);
    let mut missed: u32 = 0;
    let ping = Arc::new(Envelope::ping().to_json());

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if link.check_alive() {
                    missed = 0;
                    continue;
                }
                missed += 1;
                if missed >= max_missed {
                    warn!(missed, "heartbeat timeout");
                    counter!(HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                    link.close(CloseReason::resource(ResourceError::HeartbeatTimeout));
                    return HeartbeatResult::TimedOut;
                }
                debug!(missed, "no liveness this interval, sending ping");
                if link.send(Arc::clone(&ping)).is_err() {
                    return HeartbeatResult::Cancelled;
                }
            }
            () = link.closed() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::errors::close_code;

    fn policy(interval_ms: u64, max_missed: u32) -> HeartbeatPolicy {
        HeartbeatPolicy {
            interval: Duration::from_millis(interval_ms),
            max_missed,
            required: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_times_out_after_two_intervals() {
        let (link, mut rx) = ConnectionLink::new(8);
        let started = Instant::now();
        let result = run_heartbeat(Arc::clone(&link), policy(100, 2)).await;

        assert_eq!(result, HeartbeatResult::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert_eq!(
            link.close_reason().unwrap().code,
            close_code::HEARTBEAT_TIMEOUT
        );
        // One ping after the first missed interval.
        let ping = rx.recv().await.unwrap();
        assert_eq!(ping.as_str(), r#"{"type":"ping"}"#);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_resets_missed_count() {
        let (link, _rx) = ConnectionLink::new(8);
        let handle = tokio::spawn(run_heartbeat(Arc::clone(&link), policy(100, 2)));

        for _ in 0..10 {
            time::sleep(Duration::from_millis(60)).await;
            link.mark_alive();
        }
        assert!(!link.is_closed());

        link.close(CloseReason::NORMAL);
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn one_missed_interval_is_tolerated() {
        let (link, mut rx) = ConnectionLink::new(8);
        let handle = tokio::spawn(run_heartbeat(Arc::clone(&link), policy(100, 2)));

        // Miss the first tick, answer the ping before the second.
        time::sleep(Duration::from_millis(150)).await;
        assert!(rx.recv().await.is_some());
        link.mark_alive();
        time::sleep(Duration::from_millis(100)).await;
        assert!(!link.is_closed());

        link.close(CloseReason::NORMAL);
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_when_link_closes() {
        let (link, _rx) = ConnectionLink::new(8);
        let handle = tokio::spawn(run_heartbeat(Arc::clone(&link), policy(60_000, 2)));
        link.close(CloseReason::GOING_AWAY);
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
        assert_eq!(link.close_reason(), Some(CloseReason::GOING_AWAY));
    }

    #[tokio::test(start_paused = true)]
    async fn max_missed_of_three() {
        let (link, _rx) = ConnectionLink::new(8);
        let started = Instant::now();
        let result = run_heartbeat(link, policy(100, 3)).await;
        assert_eq!(result, HeartbeatResult::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }
}

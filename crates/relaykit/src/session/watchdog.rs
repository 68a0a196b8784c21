//! Idle detection

use std::{
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::{self, Either};
use log::debug;
use tokio::time::{self, Instant};

/// Last activity timestamp of a session, shared between its I/O and its watchdog
#[derive(Debug)]
pub struct Activity {
    epoch: Instant,
    // nanoseconds since `epoch`
    last: AtomicU64,
}

impl Default for Activity {
    fn default() -> Self {
        Activity::new()
    }
}

impl Activity {
    pub fn new() -> Activity {
        Activity {
            epoch: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Marks the session active now
    #[inline]
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_nanos() as u64;
        self.last.fetch_max(now, Ordering::Relaxed);
    }

    pub fn last_active(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.last.load(Ordering::Relaxed))
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_active())
    }
}

/// Ends a session that stayed idle for `timeout`
#[derive(Debug, Clone)]
pub struct IdleWatchdog {
    activity: Arc<Activity>,
    timeout: Duration,
}

impl IdleWatchdog {
    pub fn new(activity: Arc<Activity>, timeout: Duration) -> IdleWatchdog {
        IdleWatchdog { activity, timeout }
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Completes once the session has been idle for the timeout
    ///
    /// One timer, re-armed to the current deadline after every check.
    pub async fn expired(&self) {
        loop {
            let idle = self.activity.idle_for();
            if idle >= self.timeout {
                return;
            }
            time::sleep(self.timeout - idle).await;
        }
    }

    /// Runs `fut` until it completes or the session goes idle, whichever happens first
    ///
    /// Returns `None` on idle expiry. `fut` is dropped at that point, which closes any socket it owns.
    pub async fn supervise<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        let fut = pin!(fut);
        let expired = pin!(self.expired());

        match future::select(fut, expired).await {
            Either::Left((output, _)) => Some(output),
            Either::Right(((), _)) => {
                debug!("session idle for {:?}, closing", self.activity.idle_for());
                None
            }
        }
    }
}

/// Polls every future until one completes, then drops the rest
///
/// Returns the index and output of the winner, `None` for an empty set.
pub async fn race<I>(futures: I) -> Option<(usize, <I::Item as Future>::Output)>
where
    I: IntoIterator,
    I::Item: Future,
{
    let futures: Vec<_> = futures.into_iter().map(Box::pin).collect();
    if futures.is_empty() {
        return None;
    }

    let (output, index, _losers) = future::select_all(futures).await;
    Some((index, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expires_without_activity() {
        time::pause();

        let watchdog = IdleWatchdog::new(Arc::new(Activity::new()), Duration::from_secs(30));
        let start = Instant::now();
        watchdog.expired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn activity_postpones_expiry() {
        time::pause();

        let activity = Arc::new(Activity::new());
        let watchdog = IdleWatchdog::new(activity.clone(), Duration::from_secs(10));
        let start = Instant::now();

        let toucher = tokio::spawn(async move {
            for _ in 0..5 {
                time::sleep(Duration::from_secs(4)).await;
                activity.touch();
            }
        });

        watchdog.expired().await;
        // last touch at 20s
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        toucher.await.unwrap();
    }

    #[tokio::test]
    async fn supervise_picks_the_winner() {
        time::pause();

        let watchdog = IdleWatchdog::new(Arc::new(Activity::new()), Duration::from_secs(5));

        let done = watchdog.supervise(async { 7 }).await;
        assert_eq!(done, Some(7));

        let idle = watchdog
            .supervise(async {
                time::sleep(Duration::from_secs(3600)).await;
                7
            })
            .await;
        assert_eq!(idle, None);
    }

    #[tokio::test]
    async fn race_drops_losers() {
        time::pause();

        let sleeps = [30u64, 10, 20].map(|s| async move {
            time::sleep(Duration::from_secs(s)).await;
            s
        });
        assert_eq!(race(sleeps).await, Some((1, 10)));

        let empty: Vec<future::Ready<()>> = Vec::new();
        assert!(race(empty).await.is_none());
    }
}

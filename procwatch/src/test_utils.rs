//! Polling assertions for async supervisor tests
//!
//! Jobs change state on their own schedule, so tests wait for a condition with
//! a deadline instead of sleeping for a guessed amount of time.

use crate::supervisor::monitor::Monitor;
use crate::supervisor::protocol::{JobData, JobState};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Retry `f` every `interval` until it returns `Ok`, panicking after `timeout`
///
/// The panic message carries `desc`, the elapsed time, the attempt count and
/// the last error returned by `f`.
///
/// ```rust,ignore
/// let data = assert_eventually(
///     "job to end",
///     Duration::from_secs(3),
///     Duration::from_millis(50),
///     || async {
///         match monitor.job("web") {
///             Some(job) if job.state == JobState::Ended => Ok(job),
///             Some(job) => Err(format!("still {}", job.state)),
///             None => Err("job not registered".to_string()),
///         }
///     },
/// )
/// .await;
/// ```
pub async fn assert_eventually<F, Fut, T, E>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let last_error = match f().await {
            Ok(value) => return value,
            Err(err) => err.to_string(),
        };

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            panic!(
                "Timeout waiting for {}\n\
                 Duration: {:?}\n\
                 Attempts: {}\n\
                 Last error: {}",
                desc, elapsed, attempts, last_error
            );
        }
        tokio::time::sleep(interval).await;
    }
}

/// `assert_eventually` for a plain boolean condition
pub async fn assert_eventually_bool<F, Fut>(desc: &str, timeout: Duration, interval: Duration, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    assert_eventually(desc, timeout, interval, || {
        let check = f();
        async move {
            if check.await {
                Ok(())
            } else {
                Err("condition never became true")
            }
        }
    })
    .await
}

/// Wait until the monitor reports `uid` in `state` and return its data
pub async fn wait_for_state(monitor: &Monitor, uid: &str, state: JobState, timeout: Duration) -> JobData {
    assert_eventually(
        &format!("'{}' to reach {}", uid, state),
        timeout,
        Duration::from_millis(20),
        move || async move {
            match monitor.job(uid) {
                Some(job) if job.state == state => Ok(job),
                Some(job) => Err(format!("state is {}", job.state)),
                None => Err("job not registered".to_string()),
            }
        },
    )
    .await
}

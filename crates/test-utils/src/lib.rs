//! Shared test helpers for causeway.
//!
//! - [`faults`] — scripted fault injection for executors and stores
//! - [`flows`] — small flows exercising the engine's seams

pub mod faults;
pub mod flows;

use std::future::Future;
use std::time::{Duration, Instant};

/// Install a test tracing subscriber (idempotent).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll `condition` until it holds or five seconds elapse.
///
/// The engine is event-driven; tests use this to wait for a flow to reach
/// a quiescent point instead of guessing at sleeps.
pub async fn eventually<F, Fut>(description: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for: {description}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! Cross-platform `spawn`/`sleep` used by the connection manager and the
//! orchestrator's background reader task.
//!
//! Native targets get the usual `tokio` multi-threaded runtime primitives;
//! WASM has neither a reactor nor OS timers, so it leans on `gloo-timers`'
//! JS `setTimeout` binding and `wasm_bindgen_futures::spawn_local` instead.
//! Everything above this module is written against these two functions only,
//! so the rest of the crate never needs its own `cfg(target_arch = "wasm32")`.

use std::future::Future;
use std::time::Duration;

/// Sleeps for `duration`, yielding to the runtime.
pub(crate) async fn sleep(duration: Duration) {
    #[cfg(not(target_arch = "wasm32"))]
    {
        tokio::time::sleep(duration).await;
    }
    #[cfg(target_arch = "wasm32")]
    {
        gloo_timers::future::sleep(duration).await;
    }
}

/// Spawns `future` to run in the background, detached.
pub(crate) fn spawn<F>(future: F)
where
    F: Future<Output = ()> + 'static,
    #[cfg(not(target_arch = "wasm32"))] F: Send,
{
    #[cfg(not(target_arch = "wasm32"))]
    {
        tokio::spawn(future);
    }
    #[cfg(target_arch = "wasm32")]
    {
        wasm_bindgen_futures::spawn_local(future);
    }
}

/// Races `future` against a `duration` sleep, without relying on
/// `tokio::select!` (unavailable on `wasm32`, which has no `macros`
/// feature). Returns `None` if the sleep wins.
pub(crate) async fn timeout<F: Future>(duration: Duration, future: F) -> Option<F::Output> {
    futures::pin_mut!(future);
    let sleep_fut = sleep(duration);
    futures::pin_mut!(sleep_fut);
    match futures::future::select(future, sleep_fut).await {
        futures::future::Either::Left((value, _)) => Some(value),
        futures::future::Either::Right(_) => None,
    }
}

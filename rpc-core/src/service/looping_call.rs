use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A periodic cooperative timer: given a callable and an interval, fires
/// the callable on the tokio runtime until stopped. Exceptions
/// (`Result::Err`, the Rust stand-in for the source's caught exceptions)
/// never terminate the loop — they are logged and the loop continues on
/// its next boundary.
pub struct LoopingCall {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LoopingCall {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Begins the loop. If `now` is true the first fire is immediate,
    /// otherwise the loop waits one `interval` before the first fire.
    /// Calling `start` a second time on the same `LoopingCall` replaces
    /// any previous loop (stopping it first).
    pub async fn start<F, Fut>(&self, label: impl Into<String>, mut f: F, interval: Duration, now: bool)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.stop().await;
        let token = self.token.clone();
        let label = label.into();

        let handle = tokio::spawn(async move {
            if !now {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            loop {
                if let Err(e) = f().await {
                    log::error!("rpc-core: looping_call[{}] iteration failed: {}", label, e);
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        *self.handle.lock().await = Some(handle);
    }

    /// Requests termination; the loop exits on its next boundary (or
    /// immediately if it is currently sleeping).
    pub async fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Blocks until the loop's task completes (only happens after
    /// `stop()`, since the loop otherwise runs forever).
    pub async fn wait(&self) -> Result<(), tokio::task::JoinError> {
        // `stop()` already joins; `wait()` is for callers that want to
        // block on an externally-cancelled loop without themselves
        // calling stop(). Re-borrow in case a handle is still present.
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }
}

impl Default for LoopingCall {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fires_immediately_when_now_is_true() {
        let count = Arc::new(AtomicUsize::new(0));
        let lc = LoopingCall::new();
        let c = count.clone();
        lc.start(
            "test",
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_millis(20),
            true,
        )
        .await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);
        lc.stop().await;
    }

    #[tokio::test]
    async fn stop_halts_further_firings() {
        let count = Arc::new(AtomicUsize::new(0));
        let lc = LoopingCall::new();
        let c = count.clone();
        lc.start(
            "test",
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_millis(5),
            true,
        )
        .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        lc.stop().await;
        let observed = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), observed);
    }

    #[tokio::test]
    async fn errors_in_callable_do_not_stop_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let lc = LoopingCall::new();
        let c = count.clone();
        lc.start(
            "test",
            move || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(anyhow::anyhow!("boom"))
                    } else {
                        Ok(())
                    }
                }
            },
            Duration::from_millis(5),
            true,
        )
        .await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(count.load(Ordering::SeqCst) > 3);
        lc.stop().await;
    }
}

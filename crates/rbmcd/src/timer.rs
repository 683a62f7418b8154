//! One-shot timer bound to the runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A single-shot timer. Starting it again replaces any pending expiry.
pub struct Timer {
    callback: Arc<dyn Fn() + Send + Sync>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Timer {
            callback: Arc::new(callback),
            pending: Mutex::new(None),
        }
    }

    /// Arms the timer. Any previously pending expiry is cancelled first.
    pub fn start(&self, timeout: Duration) {
        let callback = Arc::clone(&self.callback);
        let mut pending = self.pending.lock().unwrap();
        if let Some(old) = pending.take() {
            old.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            callback();
        }));
    }

    /// Cancels a pending expiry, if any.
    pub fn stop(&self) {
        if let Some(pending) = self.pending.lock().unwrap().take() {
            pending.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_the_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = Timer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        timer.start(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // One-shot: nothing further fires.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_and_start_replaces() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = Timer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        timer.start(Duration::from_secs(10));
        timer.stop();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        timer.start(Duration::from_secs(10));
        timer.start(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

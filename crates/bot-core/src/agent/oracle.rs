use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::history::Turn;
use super::BoxFuture;

/// Text-generation collaborator: send prior turns plus a system prompt, get text back.
///
/// Implementations must be safe to retry; the core treats failures as retryable unless a call
/// site bounds them.
pub trait Oracle: Send + Sync {
    fn send_request<'a>(
        &'a self,
        turns: &'a [Turn],
        system_prompt: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>>;
}

impl<O: Oracle + ?Sized> Oracle for Arc<O> {
    fn send_request<'a>(
        &'a self,
        turns: &'a [Turn],
        system_prompt: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        (**self).send_request(turns, system_prompt)
    }
}

/// Per-agent cooldown gate in front of an oracle.
///
/// The lock is held for the whole request, so at most one request is in flight; before sending,
/// the gate waits until `cooldown` has passed since the previous request was issued.
pub struct GatedOracle<O> {
    inner: O,
    cooldown: Duration,
    last_issued: Mutex<Option<Instant>>,
}

impl<O: Oracle> GatedOracle<O> {
    pub fn new(inner: O, cooldown: Duration) -> Self {
        Self {
            inner,
            cooldown,
            last_issued: Mutex::new(None),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }
}

impl<O: Oracle> Oracle for GatedOracle<O> {
    fn send_request<'a>(
        &'a self,
        turns: &'a [Turn],
        system_prompt: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let mut last = self.last_issued.lock().await;
            if let Some(prev) = *last {
                let next_allowed = prev + self.cooldown;
                if Instant::now() < next_allowed {
                    tokio::time::sleep_until(next_allowed).await;
                }
            }
            *last = Some(Instant::now());
            tracing::trace!(prompt_chars = system_prompt.len(), turns = turns.len(), "agent.oracle.request");
            self.inner.send_request(turns, system_prompt).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Fails if two requests overlap; each request yields to the scheduler while "in flight".
    #[derive(Default)]
    struct OverlapDetector {
        in_flight: AtomicBool,
        calls: AtomicUsize,
        issued_at: std::sync::Mutex<Vec<Instant>>,
    }

    impl Oracle for OverlapDetector {
        fn send_request<'a>(
            &'a self,
            _turns: &'a [Turn],
            _system_prompt: &'a str,
        ) -> BoxFuture<'a, anyhow::Result<String>> {
            Box::pin(async move {
                if self.in_flight.swap(true, Ordering::SeqCst) {
                    anyhow::bail!("concurrent oracle request");
                }
                self.issued_at.lock().unwrap().push(Instant::now());
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                tokio::task::yield_now().await;
                self.in_flight.store(false, Ordering::SeqCst);
                Ok("ok".to_string())
            })
        }
    }

    #[tokio::test]
    async fn ungated_detector_sees_overlap() {
        let oracle = OverlapDetector::default();
        let (a, b) = tokio::join!(oracle.send_request(&[], "a"), oracle.send_request(&[], "b"));
        assert!(a.is_err() || b.is_err());
    }

    #[tokio::test]
    async fn gate_allows_one_request_in_flight() -> anyhow::Result<()> {
        let gate = GatedOracle::new(OverlapDetector::default(), Duration::ZERO);
        let (a, b, c) = tokio::join!(
            gate.send_request(&[], "a"),
            gate.send_request(&[], "b"),
            gate.send_request(&[], "c"),
        );
        assert_eq!(a?, "ok");
        assert_eq!(b?, "ok");
        assert_eq!(c?, "ok");
        assert_eq!(gate.inner().calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn gate_enforces_minimum_interval() -> anyhow::Result<()> {
        let cooldown = Duration::from_secs(4);
        let gate = GatedOracle::new(OverlapDetector::default(), cooldown);
        gate.send_request(&[], "first").await?;
        gate.send_request(&[], "second").await?;
        gate.send_request(&[], "third").await?;

        let issued = gate.inner().issued_at.lock().unwrap().clone();
        assert_eq!(issued.len(), 3);
        for pair in issued.windows(2) {
            assert!(pair[1] - pair[0] >= cooldown);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_is_not_delayed() -> anyhow::Result<()> {
        let gate = GatedOracle::new(OverlapDetector::default(), Duration::from_secs(60));
        let start = Instant::now();
        gate.send_request(&[], "first").await?;
        assert!(Instant::now() - start < Duration::from_secs(1));
        Ok(())
    }
}

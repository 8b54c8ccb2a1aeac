use std::sync::Arc;
use std::time::Duration;

use delay_store::Clock;
use delay_store::DelayStore;

use crate::config::LocationConfig;
use crate::metrics::GateMetrics;
use crate::publisher::AccountingPublisher;
use crate::wire::AccountingEvent;
use crate::wire::Verdict;

/// Classifies a request arriving at `now` against the next allowed time.
///
/// ```
/// use tower_gatekeeper::Verdict;
/// use tower_gatekeeper::classify;
///
/// assert_eq!(classify(10_000, 10_000, 5_000), Verdict::Accepted);
/// assert_eq!(classify(9_999, 10_000, 5_000), Verdict::Delayed);
/// assert_eq!(classify(4_999, 10_000, 5_000), Verdict::Rejected);
/// ```
pub fn classify(now: u64, next: u64, max_delay_ms: u64) -> Verdict {
    if now >= next {
        Verdict::Accepted
    } else if now >= next.saturating_sub(max_delay_ms) {
        Verdict::Delayed
    } else {
        Verdict::Rejected
    }
}

/// Result of one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub verdict: Verdict,
    pub received_at: u64,
    pub next_allowed: u64,
}

impl Admission {
    /// How long a delayed request has to be held.
    pub fn wait(&self) -> Duration {
        match self.verdict {
            Verdict::Delayed => {
                Duration::from_millis(self.next_allowed.saturating_sub(self.received_at))
            }
            Verdict::Accepted | Verdict::Rejected => Duration::ZERO,
        }
    }
}

/// Looks up, classifies and accounts for requests.
#[derive(Debug)]
pub struct AdmissionEngine<D>
where
    D: ?Sized,
{
    store: Arc<D>,
    clock: Arc<dyn Clock>,
    publishers: Vec<AccountingPublisher>,
    metrics: GateMetrics,
}

impl<D> AdmissionEngine<D>
where
    D: DelayStore + ?Sized,
{
    /// `publishers` is indexed like the master registry.
    pub fn new(store: Arc<D>, clock: Arc<dyn Clock>, publishers: Vec<AccountingPublisher>) -> Self {
        Self {
            store,
            clock,
            publishers,
            metrics: GateMetrics::new(),
        }
    }

    pub fn store(&self) -> &Arc<D> {
        &self.store
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn decide(&self, location: &LocationConfig, identifier: &str, log_info: &str) -> Admission {
        self.decide_at(location, identifier, log_info, self.clock.now_millis())
    }

    /// Decides for a request received at `now`.
    ///
    /// Exactly one accounting event is queued per call, whatever the verdict.
    pub fn decide_at(
        &self,
        location: &LocationConfig,
        identifier: &str,
        log_info: &str,
        now: u64,
    ) -> Admission {
        let next_allowed = self.store.lookup(&location.domain, identifier);
        let verdict = classify(now, next_allowed, location.max_delay_ms());
        let delay_until = (verdict == Verdict::Delayed).then_some(next_allowed);

        if let Some(publisher) = location.master.and_then(|index| self.publishers.get(index)) {
            publisher.publish(&AccountingEvent {
                domain: location.domain.clone(),
                verdict,
                identifier: identifier.to_string(),
                received_at: now,
                delay_until,
                log_info: log_info.to_string(),
            });
        }
        self.metrics.request(
            &location.domain,
            verdict,
            delay_until.map(|until| until - now),
        );
        tracing::debug!(
            domain = %location.domain,
            identifier,
            %verdict,
            now,
            next_allowed,
            "admission decided"
        );

        Admission {
            verdict,
            received_at: now,
            next_allowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use delay_store::LocalDelayStore;
    use delay_store::MonotonicClock;
    use http::StatusCode;

    use super::*;
    use crate::expression::Expression;
    use crate::wire::topic;

    fn location(master: Option<usize>) -> LocationConfig {
        LocationConfig {
            name: "api".into(),
            enabled: true,
            master,
            domain: "api".into(),
            identifier: Expression::RemoteAddr,
            log_info: Expression::Empty,
            max_delay: Duration::from_millis(5_000),
            reject_status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    #[test]
    fn test_classify_edges() {
        assert_eq!(classify(0, 0, 5_000), Verdict::Accepted);
        assert_eq!(classify(u64::MAX, 10, 0), Verdict::Accepted);
        assert_eq!(classify(5_000, 10_000, 5_000), Verdict::Delayed);
        assert_eq!(classify(1, 10_000, u64::MAX), Verdict::Delayed);
        assert_eq!(classify(9_999, 10_000, 0), Verdict::Rejected);
    }

    #[test]
    fn test_decide_publishes_every_verdict() {
        let store = Arc::new(LocalDelayStore::new());
        let clock = Arc::new(MonotonicClock::with_clock_at(quanta::Clock::mock().0, 0));
        let (publisher, mut accounting) = AccountingPublisher::channel(16);
        let engine = AdmissionEngine::new(store.clone(), clock, vec![publisher]);
        let location = location(Some(0));

        store.apply_update("api", "1.2.3.4", 10_000);

        let cases = [
            (10_000, Verdict::Accepted, ""),
            (9_999, Verdict::Delayed, "10000"),
            (4_999, Verdict::Rejected, ""),
        ];
        for (now, verdict, delay) in cases {
            let admission = engine.decide_at(&location, "1.2.3.4", "GET /", now);
            assert_eq!(admission.verdict, verdict);
            assert_eq!(admission.next_allowed, 10_000);

            let frames = accounting.try_recv().unwrap();
            assert_eq!(frames[0], topic("api").as_bytes());
            assert_eq!(frames[1], verdict.as_str().as_bytes());
            assert_eq!(frames[3], now.to_string().as_bytes());
            assert_eq!(frames[4], delay.as_bytes());
            assert_eq!(frames[5], "GET /".as_bytes());
        }
        assert!(accounting.try_recv().is_err());
    }

    #[test]
    fn test_wait() {
        let store = Arc::new(LocalDelayStore::new());
        let clock = Arc::new(MonotonicClock::with_clock_at(quanta::Clock::mock().0, 16_000));
        let engine = AdmissionEngine::new(store.clone(), clock, Vec::new());
        store.apply_update("api", "1.2.3.4", 20_000);

        let admission = engine.decide(&location(None), "1.2.3.4", "");
        assert_eq!(admission.verdict, Verdict::Delayed);
        assert_eq!(admission.received_at, 16_000);
        assert_eq!(admission.wait(), Duration::from_millis(4_000));

        let admission = engine.decide(&location(None), "5.6.7.8", "");
        assert_eq!(admission.verdict, Verdict::Accepted);
        assert_eq!(admission.wait(), Duration::ZERO);
    }
}

use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use delay_store::DelayStore;
use http::Request;
use tower::BoxError;
use tower::Service;

use crate::config::LocationConfig;
use crate::engine::AdmissionEngine;
use crate::error::GateError;
use crate::scheduler::AdmissionFuture;
use crate::scheduler::ClientTeardown;
use crate::wire::Verdict;

/// Marks a request that has already been through admission control.
///
/// Requests carrying it pass straight through, so re-entering the stack
/// never decides or accounts twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    pub verdict: Verdict,
    pub received_at: u64,
}

/// Admission control for one location.
#[derive(Debug)]
pub struct GatekeeperService<D, S>
where
    D: ?Sized,
{
    inner: S,
    engine: Arc<AdmissionEngine<D>>,
    location: Arc<LocationConfig>,
}

impl<D, S> Clone for GatekeeperService<D, S>
where
    D: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: Arc::clone(&self.engine),
            location: Arc::clone(&self.location),
        }
    }
}

impl<D, S> GatekeeperService<D, S>
where
    D: ?Sized,
{
    pub fn new(inner: S, engine: Arc<AdmissionEngine<D>>, location: Arc<LocationConfig>) -> Self {
        Self {
            inner,
            engine,
            location,
        }
    }

    pub fn location(&self) -> &LocationConfig {
        &self.location
    }
}

impl<D, S, B> Service<Request<B>> for GatekeeperService<D, S>
where
    D: DelayStore + ?Sized,
    S: Service<Request<B>> + Clone,
    S::Error: Into<BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = AdmissionFuture<S, Request<B>, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        if !self.location.enabled || req.extensions().get::<Admitted>().is_some() {
            return AdmissionFuture::running(self.call_ready(req));
        }

        let (identifier, log_info) = match self.evaluate(&req) {
            Ok(values) => values,
            Err(err) => {
                tracing::warn!(location = %self.location.name, %err, "aborting request");
                return AdmissionFuture::rejected(err);
            }
        };

        let admission = self.engine.decide(&self.location, &identifier, &log_info);
        req.extensions_mut().insert(Admitted {
            verdict: admission.verdict,
            received_at: admission.received_at,
        });

        match admission.verdict {
            Verdict::Accepted => AdmissionFuture::running(self.call_ready(req)),
            Verdict::Delayed => {
                let teardown = req
                    .extensions()
                    .get::<ClientTeardown>()
                    .map(|teardown| teardown.0.clone());
                AdmissionFuture::parked(self.inner.clone(), req, admission.wait(), teardown)
            }
            Verdict::Rejected => AdmissionFuture::rejected(GateError::Rejected {
                status: self.location.reject_status,
            }),
        }
    }
}

impl<D, S> GatekeeperService<D, S>
where
    D: ?Sized,
{
    /// Calls the service that `poll_ready` readied, leaving a clone behind.
    fn call_ready<B>(&mut self, req: Request<B>) -> S::Future
    where
        S: Service<Request<B>> + Clone,
    {
        let clone = self.inner.clone();
        let mut ready = std::mem::replace(&mut self.inner, clone);
        ready.call(req)
    }

    fn evaluate<B>(&self, req: &Request<B>) -> Result<(String, String), GateError> {
        let identifier = self
            .location
            .identifier
            .evaluate(req)
            .map_err(|err| GateError::Expression {
                what: "identifier",
                reason: err.to_string(),
            })?;
        let log_info = self
            .location
            .log_info
            .evaluate(req)
            .map_err(|err| GateError::Expression {
                what: "log_info",
                reason: err.to_string(),
            })?;
        Ok((identifier.into_owned(), log_info.into_owned()))
    }
}

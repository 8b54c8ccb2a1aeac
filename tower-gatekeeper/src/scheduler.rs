use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::time::Sleep;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tower::BoxError;
use tower::Service;

use crate::error::GateError;

/// Request extension through which the host reports connection teardown.
///
/// Cancelling the token while a request is held fails it with
/// [`GateError::Disconnected`].
#[derive(Debug, Clone, Default)]
pub struct ClientTeardown(pub CancellationToken);

/// Where a request is in its admission lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The inner service is handling the request.
    Running,
    /// Held until the next allowed time.
    Parked,
    /// Timer fired; waiting for the inner service to become ready.
    Resuming,
    /// Fails on the next poll.
    Rejected,
    Done,
}

pin_project! {
    /// Response future of [`GatekeeperService`](crate::GatekeeperService).
    ///
    /// Dropping it while parked cancels the timer.
    pub struct AdmissionFuture<S, Req, F> {
        phase: Phase,
        #[pin]
        running: Option<F>,
        pending: Option<(S, Req)>,
        timer: Option<Pin<Box<Sleep>>>,
        teardown: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
        failure: Option<GateError>,
    }
}

impl<S, Req, F> AdmissionFuture<S, Req, F> {
    fn with_phase(phase: Phase) -> Self {
        Self {
            phase,
            running: None,
            pending: None,
            timer: None,
            teardown: None,
            failure: None,
        }
    }

    pub(crate) fn running(future: F) -> Self {
        Self {
            running: Some(future),
            ..Self::with_phase(Phase::Running)
        }
    }

    /// Holds `request` for `wait`, then hands it to `service`.
    pub(crate) fn parked(
        service: S,
        request: Req,
        wait: Duration,
        teardown: Option<CancellationToken>,
    ) -> Self {
        Self {
            pending: Some((service, request)),
            timer: Some(Box::pin(sleep(wait))),
            teardown: teardown.map(|token| Box::pin(token.cancelled_owned())),
            ..Self::with_phase(Phase::Parked)
        }
    }

    pub(crate) fn rejected(error: GateError) -> Self {
        Self {
            failure: Some(error),
            ..Self::with_phase(Phase::Rejected)
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

impl<S, Req, F, T, E> Future for AdmissionFuture<S, Req, F>
where
    S: Service<Req, Response = T, Error = E, Future = F>,
    F: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            match *this.phase {
                Phase::Running => {
                    let Some(future) = this.running.as_mut().as_pin_mut() else {
                        *this.phase = Phase::Done;
                        return Poll::Ready(Err(lost_request()));
                    };
                    let result = ready!(future.poll(cx));
                    *this.phase = Phase::Done;
                    this.running.set(None);
                    return Poll::Ready(result.map_err(Into::into));
                }
                Phase::Parked => {
                    if let Some(teardown) = this.teardown.as_mut()
                        && teardown.as_mut().poll(cx).is_ready()
                    {
                        *this.phase = Phase::Done;
                        *this.timer = None;
                        *this.teardown = None;
                        *this.pending = None;
                        return Poll::Ready(Err(Box::new(GateError::Disconnected)));
                    }
                    // Any wake other than the timer leaves the request parked.
                    if let Some(timer) = this.timer.as_mut() {
                        ready!(timer.as_mut().poll(cx));
                    }
                    *this.timer = None;
                    *this.teardown = None;
                    *this.phase = Phase::Resuming;
                }
                Phase::Resuming => {
                    let Some((service, _)) = this.pending.as_mut() else {
                        *this.phase = Phase::Done;
                        return Poll::Ready(Err(lost_request()));
                    };
                    if let Err(err) = ready!(service.poll_ready(cx)) {
                        *this.phase = Phase::Done;
                        *this.pending = None;
                        return Poll::Ready(Err(err.into()));
                    }
                    if let Some((mut service, request)) = this.pending.take() {
                        this.running.set(Some(service.call(request)));
                    }
                    *this.phase = Phase::Running;
                }
                Phase::Rejected => {
                    *this.phase = Phase::Done;
                    let error = this.failure.take().unwrap_or(GateError::Disconnected);
                    return Poll::Ready(Err(Box::new(error)));
                }
                Phase::Done => return Poll::Ready(Err(lost_request())),
            }
        }
    }
}

fn lost_request() -> BoxError {
    Box::new(GateError::Inner(
        "admission future polled after completion".to_string(),
    ))
}

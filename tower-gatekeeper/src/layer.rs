use std::sync::Arc;

use tower::Layer;

use crate::config::LocationConfig;
use crate::engine::AdmissionEngine;
use crate::service::GatekeeperService;

/// Applies admission control for one location to requests.
#[derive(Debug)]
pub struct GatekeeperLayer<D>
where
    D: ?Sized,
{
    engine: Arc<AdmissionEngine<D>>,
    location: Arc<LocationConfig>,
}

impl<D> Clone for GatekeeperLayer<D>
where
    D: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            location: Arc::clone(&self.location),
        }
    }
}

impl<D> GatekeeperLayer<D>
where
    D: ?Sized,
{
    /// Create a GatekeeperLayer
    ///
    /// Usually obtained from [`Gatekeeper::layer`](crate::Gatekeeper::layer).
    pub fn new(engine: Arc<AdmissionEngine<D>>, location: Arc<LocationConfig>) -> Self {
        Self { engine, location }
    }
}

impl<D, S> Layer<S> for GatekeeperLayer<D>
where
    D: ?Sized,
{
    type Service = GatekeeperService<D, S>;

    fn layer(&self, service: S) -> Self::Service {
        GatekeeperService::new(service, Arc::clone(&self.engine), Arc::clone(&self.location))
    }
}

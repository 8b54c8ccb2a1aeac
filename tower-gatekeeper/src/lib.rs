//! # Tower Gatekeeper
//!
//! `tower-gatekeeper` is an admission control middleware for the
//! [Tower](https://github.com/tower-rs/tower) ecosystem. It enforces limits
//! computed by an external rate governor rather than computing them itself.
//!
//! ## How it works
//!
//! 1. **Control plane**: the governor publishes `DELAY_UNTIL` updates over a
//!    pub/sub channel. A [`ControlListener`] merges them into a shared
//!    [`delay_store::DelayStore`], keeping the highest timestamp per key.
//! 2. **Request path**: for every request the [`GatekeeperService`] evaluates
//!    the location's identifier expression, looks up the next allowed time and
//!    classifies the request:
//!    * **ACCEPTED**: the inner service is called immediately.
//!    * **DELAYED**: the request is parked until the next allowed time, then
//!      handed to the inner service as if it had been accepted.
//!    * **REJECTED**: fails with [`GateError::Rejected`] carrying the
//!      location's status code.
//! 3. **Accounting**: every decision is reported back to the governor,
//!    fire-and-forget, through an [`AccountingPublisher`].
//! 4. **Housekeeping**: a [`Sweeper`] evicts expired delays in bounded batches.
//!
//! [`Gatekeeper`] wires all of this up from a [`GatekeeperConfig`].
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`GateError`] and reads the client
//!   address from axum's `ConnectInfo`.

mod config;
mod engine;
mod error;
mod expression;
mod gatekeeper;
mod layer;
mod listener;
mod metrics;
mod publisher;
mod registry;
mod scheduler;
mod service;
mod sweeper;
mod transport;
mod wire;


pub use config::CompiledConfig;
pub use config::GatekeeperConfig;
pub use config::LocationConfig;
pub use config::LocationSettings;
pub use config::parse_size;
pub use engine::Admission;
pub use engine::AdmissionEngine;
pub use engine::classify;
pub use error::ConfigError;
pub use error::GateError;
pub use error::StartupError;
pub use expression::ClientAddr;
pub use expression::Expression;
pub use expression::ExpressionError;
pub use gatekeeper::Gatekeeper;
pub use gatekeeper::StartOptions;
pub use gatekeeper::WorkerIndex;
pub use layer::GatekeeperLayer;
pub use listener::ControlListener;
pub use listener::ListenError;
pub use publisher::AccountingPublisher;
pub use registry::DEFAULT_PORT;
pub use registry::GovernorAddress;
pub use registry::MasterEndpoint;
pub use registry::MasterRegistry;
pub use scheduler::AdmissionFuture;
pub use scheduler::ClientTeardown;
pub use scheduler::Phase;
pub use service::Admitted;
pub use service::GatekeeperService;
pub use sweeper::SWEEP_BATCH;
pub use sweeper::SWEEP_PERIOD;
pub use sweeper::Sweeper;
pub use transport::AccountingSink;
pub use transport::Connector;
pub use transport::ControlSource;
pub use transport::MemoryAccounting;
pub use transport::MemoryBus;
pub use transport::MemoryControl;
pub use transport::TransportError;
pub use transport::ZmqAccounting;
pub use transport::ZmqConnector;
pub use transport::ZmqControl;
pub use wire::AccountingEvent;
pub use wire::ControlMessage;
pub use wire::DecodeError;
pub use wire::Verdict;
pub use wire::decode_control;
pub use wire::resync_frames;
pub use wire::topic;

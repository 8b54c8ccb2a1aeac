use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use delay_store::ArenaDelayStore;
use delay_store::Clock;
use delay_store::MonotonicClock;
use tower::BoxError;
use tower::ServiceBuilder;
use tower_gatekeeper::ControlMessage;
use tower_gatekeeper::GateError;
use tower_gatekeeper::Gatekeeper;
use tower_gatekeeper::GatekeeperConfig;
use tower_gatekeeper::MemoryBus;
use tower_gatekeeper::StartOptions;
use tower_gatekeeper::WorkerIndex;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
    arena_size = "1m"

    [defaults]
    max_delay = "3s"

    [locations.api]
    enabled = true
    domain = "api"
    log_info = "$uri"
    reject_status = 429
"#;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // 1. Compile the configuration and start the gatekeeper on an in-process bus
    let config = GatekeeperConfig::from_toml_str(CONFIG)?;
    let bus = MemoryBus::default();
    let clock = Arc::new(MonotonicClock::new());
    let store = Arc::new(ArenaDelayStore::with_arena_size(config.arena_size)?);
    let gatekeeper = Gatekeeper::start(
        config.compile()?,
        store,
        clock.clone(),
        &bus,
        WorkerIndex::DESIGNATED,
        StartOptions::default(),
    )
    .await?;

    // 2. Play the governor: hold localhost back for two seconds every ten
    let governor = bus.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            let message = ControlMessage::DelayUntil {
                domain: "api".into(),
                identifier: "127.0.0.1".into(),
                until: clock.now_millis() + 2_000,
            };
            governor.publish_control(message.to_frames());
        }
    });

    // 3. Build the Router
    let app = Router::new()
        .route("/", get(|| async { "Hello, Gatekeeper!" }))
        .layer(
            ServiceBuilder::new()
                // Turns GateError into a response
                .layer(HandleErrorLayer::new(handle_gate_error))
                .layer(gatekeeper.layer("api")?),
        );

    // 4. Serve with ConnectInfo so `$remote_addr` resolves
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    println!("📡 Listening on http://127.0.0.1:3000");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    gatekeeper.shutdown().await;
    Ok(())
}

async fn handle_gate_error(err: BoxError) -> impl IntoResponse {
    if let Some(gate_err) = err.downcast_ref::<GateError>() {
        gate_err.clone().into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Service Error").into_response()
    }
}

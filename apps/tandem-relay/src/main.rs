mod config;
mod protocol;
mod server;

use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::server::{router, RelayState};

#[derive(Parser, Debug)]
#[command(
    name = "tandem-relay",
    about = "Rendezvous signaling relay for tandem peers",
    version
)]
struct Cli {
    #[arg(long, help = "Port to listen on (overrides TANDEM_RELAY_PORT)")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = RelayConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    let state = RelayState::new(&config);
    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("Tandem relay listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

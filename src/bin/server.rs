use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vitalhub::auth::JwtVerifier;
use vitalhub::server::Server;
use vitalhub::storage::{MemoryStorage, User};

#[derive(Parser)]
#[command(name = "server", about = "Device-telemetry fan-out hub")]
struct Args {
    /// TCP address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,

    /// Secret for verifying session tokens
    #[arg(long, env = "JWT_SECRET", default_value = "default-secret")]
    jwt_secret: String,

    /// Seconds between heartbeat sweeps
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Seed a demo patient account (user id 1, patient PT001)
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let storage = Arc::new(MemoryStorage::new());
    if args.demo {
        storage.insert_user(User {
            id: 1,
            username: "demo.patient".to_string(),
            patient_id: Some("PT001".to_string()),
        });
    }

    let srv = Server::new(
        storage,
        Arc::new(JwtVerifier::new(&args.jwt_secret)),
        Duration::from_secs(args.heartbeat_secs),
    );
    srv.start_heartbeat();

    // Graceful shutdown on Ctrl-C
    let shutdown = srv.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down");
        shutdown.stop_heartbeat();
        std::process::exit(0);
    });

    srv.listen_and_serve(&args.addr).await?;
    Ok(())
}

use std::net::SocketAddr;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::CONFIG;
use crate::controller::create_router;
use crate::database::batch;
use crate::service::{election, maintenance, sync};

mod config;
mod controller;
mod database;
mod relay;
mod schema;
mod service;
mod utils;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(CONFIG.log_level.clone())),
        )
        .init();

    let addr = format!("{}:{}", &CONFIG.host, CONFIG.port);
    info!("relay-hub starting at {}, instance={}", &addr, &CONFIG.instance_id);

    // Cluster coordination: one leader for background work, pub/sub for
    // immediate configuration reloads across peers.
    election::start_leader_election().await;
    sync::start_realtime_sync().await;
    batch::start_batch_flush_loop();
    maintenance::start_channel_test_loop();

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");
    axum::serve(
        listener,
        create_router().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("failed to start server");
}

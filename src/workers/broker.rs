//! Broker worker: bind, serve, shut down on cancellation.

use crate::core::broker::{server, Broker};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;

pub async fn run(host: &str, port: u16, sos: SignalOfStop) -> Result<()> {
    let broker = Arc::new(Broker::new());
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("binding broker listener on {host}:{port}"))?;
    server::run(broker, listener, sos).await
}

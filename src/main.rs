use fluxdrop::core::engine::TransferConfig;
use fluxdrop::utils::sos::SignalOfStop;
use fluxdrop::workers;
use fluxdrop::workers::args::{Args, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match args.command {
        Command::Broker { host, port } => workers::broker::run(&host, port, sos).await,
        Command::Send {
            broker,
            code,
            no_compression,
            chunk_size,
            files,
        } => {
            let config = TransferConfig {
                enable_compression: !no_compression,
                chunk_size: chunk_size as usize,
                ..TransferConfig::default()
            };
            workers::client::send(&broker, &code, &files, config, sos).await
        }
        Command::Receive { broker, output } => {
            workers::client::receive(&broker, &output, TransferConfig::default(), sos).await
        }
    }
}

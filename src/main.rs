pub mod action;
pub mod app;
pub mod config;
pub mod identity;
pub mod input;
pub mod mqtt;
pub mod status;
pub mod windows;

use app::App;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use config::{Args, MiniplayerConfig};
use mqtt::transport::RumqttTransport;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.debug)?;

    let config = MiniplayerConfig::from_args(&args).await?;
    let client_id = match &config.client_id {
        Some(id) => id.clone(),
        None => identity::client_identity().await,
    };
    info!(
        "Starting miniplayer as {} against {}:{}",
        client_id, config.broker.host, config.broker.port
    );

    let shutdown = CancellationToken::new();
    let mut app = App::new(
        &config,
        client_id,
        Box::new(RumqttTransport::new()),
        shutdown.clone(),
    )?;

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received");
                ctrl_c.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let (input_tx, input_rx) = mpsc::channel(32);
    let _input_thread = input::spawn_stdin_reader(input_tx, shutdown.clone())
        .map_err(|e| eyre!("Failed to start input reader: {}", e))?;

    app.start(config.default_window.as_deref()).await;
    app.run(input_rx).await?;

    info!("Bye");
    Ok(())
}

fn setup(debug: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", if debug { "debug" } else { "info" })
    }
    setup_logging_env(if debug { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

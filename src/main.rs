use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use groupvoice::config::Args;
use groupvoice::{LoggingSink, Session};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let file_appender = rolling::daily(&args.log_dir, "groupvoice.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_timer(fmt::time::OffsetTime::local_rfc_3339().unwrap())
                .with_ansi(false),
        )
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    std::panic::set_hook(Box::new(|panic_info| {
        error!("panic occurred: {panic_info}");
    }));

    let session = Arc::new(Session::new(Arc::new(LoggingSink)));

    session
        .connect(&args.server, args.local_port, args.transmit)
        .await
        .context("failed to connect session")?;

    info!(
        client_id = %session.client_id(),
        server = %args.server,
        "connected, press ctrl-c to exit"
    );

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;

    info!("shutting down");
    session.disconnect().await;

    Ok(())
}

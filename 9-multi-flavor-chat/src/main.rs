use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{net::TcpListener, select, sync::oneshot};
use tracing::{info, warn};

use multi_flavor_chat::{
    cli::{Cli, Command},
    client,
    server::ChatServer,
};

const OPERATOR_QUIT: &str = "QUIT CHAT";

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Resolves on Ctrl-C or when the operator types `QUIT CHAT`.
async fn shutdown_signal() {
    let console = operator_console();
    select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        }
        () = operator_quit(console) => info!("operator requested shutdown"),
    }
}

/// Watches stdin on a plain thread; a blocked read there does not hold up
/// runtime shutdown.
fn operator_console() -> oneshot::Receiver<()> {
    let (quit_tx, quit_rx) = oneshot::channel();
    thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) if line.trim() == OPERATOR_QUIT => {
                    let _ = quit_tx.send(());
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });
    quit_rx
}

async fn operator_quit(console: oneshot::Receiver<()>) {
    // Without a console only Ctrl-C can stop the server.
    if console.await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let server = ChatServer::new(listener, args.server_config()).await?;
            let addr = server.local_addr()?;
            info!("chat server listening on {}", addr);
            if let Err(err) = server.run_until(shutdown_signal()).await {
                warn!("chat server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

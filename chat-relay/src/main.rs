use anyhow::Result;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    client, console,
    listener::Listener,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // Logs go to stderr; stdout belongs to the console and chat output.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let listener = Listener::new();
            let addr = listener.start(args.listen).await?;
            println!("relay listening on {addr}");
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            listener.stop().await;
        }
        Command::Console(args) => {
            let listener = Listener::new();
            let stdin = BufReader::new(tokio::io::stdin());
            console::run(&listener, args.host, stdin, tokio::io::stdout()).await?;
            info!("console closed");
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

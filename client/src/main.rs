mod network;
mod remote;

use clap::Parser;
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Authority address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Name to present in the handshake
    #[arg(short = 'n', long, default_value = "wanderer")]
    name: String,

    /// Observe only: mirror the world without moving or acting
    #[arg(long)]
    idle: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("starting replication client");
    info!("connecting to: {}", args.server);
    info!("presenting as: {}", args.name);
    if args.idle {
        info!("idle mode: observing without wandering");
    }

    let mut client = network::Client::new(&args.server, &args.name, !args.idle).await?;

    client.run().await?;

    info!("session over: {}", client.state());
    Ok(())
}

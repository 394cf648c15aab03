use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "autofilld")]
#[command(about = "Privileged autofill service: answers the filling agent over a unix socket")]
struct Args {
    /// Unix socket path to listen on.
    #[arg(long)]
    socket: Option<String>,
}

#[cfg(unix)]
fn run(args: Args) -> Result<(), String> {
    use std::sync::Arc;

    use autofill_vault::bridge::server;
    use autofill_vault::config::{resolve_socket_path, BridgeConfig};
    use autofill_vault::service::Service;

    let config = BridgeConfig::from_env();
    let socket_path = resolve_socket_path(args.socket.as_deref());
    let service = Arc::new(Service::discover(config.selection_ttl)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;
    runtime.block_on(server::serve(&socket_path, service, config, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupt received, shutting down");
    }))
}

#[cfg(not(unix))]
fn run(_args: Args) -> Result<(), String> {
    Err("autofilld requires a unix-like OS".to_string())
}

fn main() {
    autofill_vault::config::init_logging("info");
    if let Err(err) = run(Args::parse()) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

use std::env;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: streakbot <serve|register> [--config <path>]";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // .env is optional; variables may come from the environment directly
    if dotenvy::dotenv().is_ok() {
        info!("loaded .env file");
    }

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" && cmd != "register" {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let mut config_path: Option<String> = None;
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = Some(v);
            }
        }
    }

    let cfg = match streakbot_config::load(config_path.as_deref()) {
        Ok(v) => v,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if cmd == "register" {
        if let Err(e) = streakbot_server::register_commands(&cfg).await {
            error!("command registration failed: {e}");
            std::process::exit(1);
        }
        return;
    }

    if let Err(e) = streakbot_server::serve(cfg).await {
        error!("server exited with error: {e}");
        std::process::exit(1);
    }
}

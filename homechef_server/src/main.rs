use std::process::ExitCode;

use clap::Parser;
use dotenvy::dotenv;
use homechef_server::{
    cli::{display_envs, Arguments, Command},
    config::ServerConfig,
    errors::ServerError,
    server::run_server,
};
use log::*;

const EXIT_CONFIG: u8 = 1;
const EXIT_STORE: u8 = 2;
const EXIT_FATAL: u8 = 3;

#[actix_web::main]
async fn main() -> ExitCode {
    dotenv().ok();
    env_logger::init();
    let args = Arguments::parse();
    let Command::Serve { show_env } = args.command;
    if show_env {
        display_envs();
        return ExitCode::SUCCESS;
    }
    let config = match ServerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("🪛️ {e}");
            eprintln!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        },
    };

    info!("🚀️ Starting HomeChef server on {}", config.http_addr);
    match run_server(config).await {
        Ok(()) => {
            info!("👋️ Clean shutdown. Bye!");
            ExitCode::SUCCESS
        },
        Err(e) => {
            error!("💥️ {e}");
            eprintln!("{e}");
            ExitCode::from(exit_code(&e))
        },
    }
}

fn exit_code(err: &ServerError) -> u8 {
    match err {
        ServerError::ConfigurationError(_) => EXIT_CONFIG,
        ServerError::StoreConnectError(_) => EXIT_STORE,
        _ => EXIT_FATAL,
    }
}

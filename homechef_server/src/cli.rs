use std::{env, env::VarError};

use clap::{Parser, Subcommand};

use crate::config::ENV_VARS;

#[derive(Parser, Debug)]
#[command(version, about = "HomeChef order core: order lifecycle, webhooks and WebSocket push")]
#[command(after_help = "All configuration is read from the environment (and a .env file, if present). \
                        Run `homechef_server serve --show-env` to print the current values.")]
pub struct Arguments {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP and WebSocket server
    #[clap(name = "serve")]
    Serve {
        /// Print the configuration variables (secrets by name only) and exit
        #[arg(long = "show-env")]
        show_env: bool,
    },
}

/// Prints the known configuration variables. Values of secrets are never printed, only whether they are set.
pub fn display_envs() {
    println!("Current environment values:");
    ENV_VARS.iter().for_each(|&(name, secret)| {
        let val = match env::var(name) {
            Ok(_) if secret => "<set>".to_string(),
            Ok(s) => s,
            Err(VarError::NotPresent) => "Not set".into(),
            Err(VarError::NotUnicode(s)) if !secret => format!("Invalid value: {}", s.to_string_lossy()),
            Err(VarError::NotUnicode(_)) => "Invalid value".into(),
        };
        println!("  {name:<30} {val}");
    })
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn serve_is_the_only_subcommand() {
        Arguments::command().debug_assert();
        let args = Arguments::try_parse_from(["homechef_server", "serve"]).unwrap();
        assert!(matches!(args.command, Command::Serve { show_env: false }));
        let args = Arguments::try_parse_from(["homechef_server", "serve", "--show-env"]).unwrap();
        assert!(matches!(args.command, Command::Serve { show_env: true }));
        assert!(Arguments::try_parse_from(["homechef_server"]).is_err());
        assert!(Arguments::try_parse_from(["homechef_server", "migrate"]).is_err());
    }
}

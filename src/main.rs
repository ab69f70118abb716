mod cli;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use threadpilot::commands;
use threadpilot::commands::map::MapRequest;
use threadpilot::{config, logging};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();
    let config = config::load(&cli.config)?;

    match cli.command {
        Command::Serve => commands::serve::serve(config).await?,
        Command::MapThread {
            thread,
            directory,
            project,
            channel,
            autopilot,
        } => {
            let request = MapRequest {
                key: thread,
                directory,
                project,
                channel,
                autopilot,
            };
            commands::map::map_thread(&config, &request, Utc::now(), &mut std::io::stdout())?;
        }
        Command::MapChannel {
            channel,
            directory,
            project,
            autopilot,
        } => {
            let request = MapRequest {
                key: channel,
                directory,
                project,
                channel: None,
                autopilot,
            };
            commands::map::map_channel(&config, &request, &mut std::io::stdout())?;
        }
        Command::Status => commands::status::status(&config, &mut std::io::stdout())?,
    }

    Ok(())
}

//! skylink CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use skylink_client::cli::{Cli, Command, ConfigAction, build_payload};
use skylink_client::commands::subscribe::SubscribeArgs;
use skylink_client::config::ClientConfig;
use skylink_client::error::ClientResult;
use skylink_core::{LogConfig, init_logging};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration comes first so `debug = true` in config.toml raises logging too.
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&LogConfig::cli(config.debug, cli.log_json)) {
        eprintln!("warning: failed to initialize logging: {}", e);
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> ClientResult<ClientConfig> {
    let mut config = if let Some(ref path) = cli.config {
        ClientConfig::load_from(path)?
    } else {
        ClientConfig::load()?
    };
    cli.apply_overrides(&mut config);
    Ok(config)
}

async fn run(cli: Cli, config: ClientConfig) -> ClientResult<()> {
    match cli.command {
        Command::Call {
            protocol,
            message_type,
            ref args,
            ref json,
            timeout_ms,
        } => {
            let payload = build_payload(json.as_deref(), args)?;
            skylink_client::commands::call::run(config, protocol, message_type, payload, timeout_ms)
                .await
        }
        Command::Subscribe {
            protocol,
            message_type,
            ref args,
            ref json,
            ref key_fields,
            unsubscribe_type,
            count,
        } => {
            let payload = build_payload(json.as_deref(), args)?;
            let args = SubscribeArgs {
                protocol,
                message_type,
                payload,
                key_fields: key_fields.clone(),
                unsubscribe_type,
                count,
            };
            skylink_client::commands::subscribe::run(config, args).await
        }
        Command::Config { ref action } => match action {
            ConfigAction::Dump => skylink_client::commands::config::dump(&config),
            ConfigAction::Validate => skylink_client::commands::config::validate(&config),
            ConfigAction::Path => skylink_client::commands::config::path(),
        },
    }
}

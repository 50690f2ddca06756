use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use owo_colors::OwoColorize;
use tokio::runtime::Runtime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use roam::cli::{Cli, Commands};
use roam::command::{run_command, CommandArgs};
use roam::config::Config;
use roam::{CallNotifier, ChannelSet, NotifierConfig, RoamClient};

use tabled::{Table, Tabled};
use tabled::settings::{Style, Modify, Padding, object::Rows};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let rt = Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Commands::Send { message, channels } => {
                let client = load_client(cli.config.clone(), &cli.profile)?;
                let explicit: Option<ChannelSet> =
                    (!channels.is_empty()).then(|| channels.into_iter().collect());
                client
                    .send_message(&message, explicit.as_ref())
                    .await
                    .context("Sending message")?;
            }
            Commands::Channels { json } => {
                let client = load_client(cli.config.clone(), &cli.profile)?;
                let groups = client.list_groups().await.context("Listing channels")?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&groups)?);
                    return Ok(());
                }

                #[derive(Tabled)]
                struct Row {
                    #[tabled(rename = "address id")]
                    address_id: String,
                    #[tabled(rename = "name")]
                    name: String,
                    #[tabled(rename = "type")]
                    group_type: String,
                    #[tabled(rename = "access")]
                    access_mode: String,
                }

                let rows: Vec<Row> = groups
                    .into_iter()
                    .map(|g| Row {
                        address_id: g.address_id,
                        name: g.name,
                        group_type: g.group_type.unwrap_or_default(),
                        access_mode: g.access_mode.unwrap_or_default(),
                    })
                    .collect();

                let mut table = Table::new(rows);
                table
                    .with(Style::modern())
                    .with(Modify::new(Rows::new(0..)).with(Padding::new(1, 1, 0, 0)));
                println!("{}", table);
            }
            Commands::Ping => {
                let client = load_client(cli.config.clone(), &cli.profile)?;
                if client.ping().await.context("Contacting Roam API")? {
                    println!("{} token accepted for {}", "ok".green(), client.identity().name);
                } else {
                    println!("{} Roam API did not report ok", "failed".red());
                    std::process::exit(1);
                }
            }
            Commands::Run {
                message,
                message_success,
                channels,
                name,
                command,
            } => {
                let mut builder = NotifierConfig::builder();
                if let Some(failure) = message {
                    builder = builder.message(failure);
                }
                if let Some(success) = message_success {
                    builder = builder.message_success(success);
                }
                if !channels.is_empty() {
                    builder = builder.channels(channels);
                }
                let config = builder.build()?;

                let client = Arc::new(load_client(cli.config.clone(), &cli.profile)?);
                let args = CommandArgs::new(command);
                let name = name.unwrap_or_else(|| args.program.clone());
                let wrapped = CallNotifier::new(client).wrap(name, config, run_command);

                // Exit code mirrors the wrapped command
                if let Err(err) = wrapped.call(args).await {
                    eprintln!("{} {err}", "error:".red());
                    std::process::exit(err.exit_code());
                }
            }
            Commands::Version { json } => {
                if json {
                    let info = serde_json::json!({
                        "version": env!("CARGO_PKG_VERSION"),
                        "commit": option_env!("GIT_SHA").unwrap_or("unknown"),
                        "build_date": option_env!("BUILD_DATE").unwrap_or("unknown"),
                    });
                    println!("{}", serde_json::to_string_pretty(&info)?);
                } else {
                    println!(
                        "roam {} (commit: {}, built: {})",
                        env!("CARGO_PKG_VERSION"),
                        option_env!("GIT_SHA").unwrap_or("unknown"),
                        option_env!("BUILD_DATE").unwrap_or("unknown"),
                    );
                }
            }
        }
        Ok(())
    })
}

fn load_client(path: Option<PathBuf>, profile: &str) -> anyhow::Result<RoamClient> {
    let config = Config::load(path)?;
    config.profile(profile)?.client()
}

/// RUST_LOG wins; otherwise -v is debug and -vv trace. Logs go to stderr.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

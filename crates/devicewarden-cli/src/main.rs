use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "devicewarden",
    version,
    about = "Operator tools for the DeviceWarden enforcement agent"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State file to inspect instead of the one under the data directory
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Init {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    Config {
        #[arg(long)]
        print: bool,
    },
    /// Safe mode, emergency window and current policy
    Status {
        #[arg(long)]
        json: bool,
    },
    SafeMode {
        #[command(subcommand)]
        action: SafeModeCommand,
    },
    Emergency {
        #[command(subcommand)]
        action: EmergencyCommand,
    },
    Policy {
        #[command(subcommand)]
        action: PolicyCommand,
    },
    /// Show how a device model is classified
    Profile {
        #[arg(long)]
        manufacturer: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SafeModeCommand {
    Status,
    Reset,
}

#[derive(Subcommand, Debug)]
enum EmergencyCommand {
    Status,
    Deactivate,
}

#[derive(Subcommand, Debug)]
enum PolicyCommand {
    /// Strip settings this device cannot survive and report what was removed
    Sanitize {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Apply a policy against a simulated device and print the result
    Plan { input: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let state = commands::StateInputs {
        config_path: cli.config,
        state_path: cli.state,
    };

    match cli.command {
        Commands::Init { path, force } => init_config(path, force),
        Commands::Config { print } => {
            if print {
                commands::config::print_effective(state.config_path)
            } else {
                Ok(())
            }
        }
        Commands::Status { json } => commands::status::execute(&state, json),
        Commands::SafeMode { action } => {
            let action = match action {
                SafeModeCommand::Status => commands::safe_mode::SafeModeAction::Status,
                SafeModeCommand::Reset => commands::safe_mode::SafeModeAction::Reset,
            };
            commands::safe_mode::execute(&state, action)
        }
        Commands::Emergency { action } => {
            let action = match action {
                EmergencyCommand::Status => commands::emergency::EmergencyAction::Status,
                EmergencyCommand::Deactivate => commands::emergency::EmergencyAction::Deactivate,
            };
            commands::emergency::execute(&state, action)
        }
        Commands::Policy { action } => {
            let action = match action {
                PolicyCommand::Sanitize { input, json } => {
                    commands::policy::PolicyAction::Sanitize { input, json }
                }
                PolicyCommand::Plan { input } => commands::policy::PolicyAction::Plan { input },
            };
            commands::policy::execute(&state, action)
        }
        Commands::Profile {
            manufacturer,
            model,
        } => commands::profile::execute(&state, manufacturer, model),
    }
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let paths = devicewarden_core::config::ConfigPaths::resolve()?;
    let config_path = path.unwrap_or(paths.config_path);
    if config_path.exists() && !force {
        return Err(anyhow::anyhow!(
            "Config already exists at {} (use --force to overwrite)",
            config_path.display()
        ));
    }
    let config = devicewarden_core::config::Config::default_config();
    config.save(&config_path)?;
    println!("Config written to {}", config_path.display());
    Ok(())
}

use anyhow::Result;
use clap::Parser;

use quizlock::cli::{Args, Commands};
use quizlock::commands;
use quizlock::commands::utils::init_logging;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let config_path = commands::resolve_config_path(args.config)?;

    match args.command {
        Commands::Init { output, force } => {
            commands::gate::init(output.as_deref().unwrap_or(config_path.as_path()), force)
        }
        Commands::AddApp {
            id,
            name,
            quota,
            minutes,
        } => commands::gate::add_app(&config_path, id, name, quota, minutes),
        Commands::RemoveApp { id } => commands::gate::remove_app(&config_path, &id),
        Commands::Enable { id } => commands::gate::set_enabled(&config_path, &id, true),
        Commands::Disable { id } => commands::gate::set_enabled(&config_path, &id, false),
        Commands::SetQuota { id, quota } => commands::gate::set_quota(&config_path, &id, quota),
        Commands::SetDuration { id, minutes } => {
            commands::gate::set_duration(&config_path, &id, minutes)
        }
        Commands::Status { json } => commands::gate::status(&config_path, json),
        Commands::ResetState => commands::gate::reset_state(&config_path),
        Commands::Run { stdin } => commands::run::run(&config_path, stdin),
    }
}

mod capture;
mod cli;

use clap::Parser;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use crate::capture::{run_channels, run_inject, run_sniff};
use crate::cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    TermLogger::init(
        cli.loglevel,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("Failed to initialize logger");

    let result = match cli.command {
        Commands::Sniff(args) => run_sniff(args),
        Commands::Inject(args) => run_inject(args),
        Commands::Channels(args) => run_channels(args),
    };

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

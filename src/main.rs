//! soupsync CLI entry point.

use clap::Parser;
use soupsync::cli::commands;
use soupsync::cli::{Cli, Commands};
use soupsync::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                eprintln!("{}", e.to_structured_json());
            } else if let Some(hint) = e.hint() {
                eprintln!("Error: {e}\n  Hint: {hint}");
            } else {
                eprintln!("Error: {e}");
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // RUST_LOG wins over -v
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli) -> Result<(), Error> {
    let db = cli.db.as_ref();
    let json = cli.json;
    match &cli.command {
        Commands::Soup { command } => commands::soup::execute(command, db, json),
        Commands::Upsert(args) => commands::record::execute_upsert(args, db, json),
        Commands::Get { soup, ids } => commands::record::execute_get(soup, ids, db, json),
        Commands::Query(args) => commands::query::execute(args, db, json),
        Commands::Delete { soup, ids, local } => {
            commands::record::execute_delete(soup, ids, *local, db, json)
        }
        Commands::Sync { command } => commands::sync::execute(command, db, json),
        Commands::Config { command } => commands::config::execute(command, json),
        Commands::Completions { shell } => commands::completions::execute(shell),
        Commands::Version => commands::version::execute(json),
    }
}

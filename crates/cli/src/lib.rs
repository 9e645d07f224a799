pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "billsync",
    about = "Billsync operator CLI",
    long_about = "Apply migrations, run reconciliation batches, and inspect config and event log state.",
    after_help = "Examples:\n  billsync migrate\n  billsync process --batch-size 20\n  billsync status"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Run one reconciliation batch over pending events")]
    Process {
        #[arg(long, help = "Override processor.batch_size for this run")]
        batch_size: Option<u32>,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Report pending, processed and failing event counts")]
    Status,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Process { batch_size } => commands::process::run(batch_size),
        Command::Config => commands::config::run(),
        Command::Status => commands::status::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

use std::process::ExitCode;

fn main() -> ExitCode {
    billsync_cli::run()
}

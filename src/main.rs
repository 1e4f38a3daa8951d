//! Binary entrypoint: parses argv with `clap`, starts logging, and hands
//! off to `choo::cli::dispatch`. Grounded on `cip999-limmat`'s `main.rs`
//! pattern of a thin `main()` wrapping a fallible `do_main()` so error
//! formatting and the process exit code stay in our control rather than
//! `std::process`'s default unwind-and-panic-message behavior.

use clap::Parser;
use flexi_logger::Logger;

use choo::cli::{Cli, CliError};

#[tokio::main]
async fn main() {
    if let Err(e) = Logger::try_with_env_or_str("info").and_then(|logger| logger.start()) {
        eprintln!("warning: failed to start logger: {e}");
    }

    let cli = Cli::parse();
    if let Err(e) = choo::cli::dispatch(cli).await {
        report_and_exit(e);
    }
}

fn report_and_exit(err: CliError) -> ! {
    eprintln!("choo: {err}");
    std::process::exit(err.exit_code());
}

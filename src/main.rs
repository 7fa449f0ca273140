//! Pkgdex CLI entrypoint

use clap::Parser;

use pkgdex::cli::Cli;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.execute() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

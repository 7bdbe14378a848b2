//! Replicar CLI — declarative SQL replication topology deployment.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "replicar",
    version,
    about = "Declarative SQL replication topology deployment — compiled plans, single-flight execution, cross-process locking"
)]
struct Cli {
    #[command(subcommand)]
    command: replicar::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    replicar::cli::init_tracing();
    if let Err(e) = replicar::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

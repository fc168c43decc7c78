use clap::Parser;
use mq_facade_cli::{exit_code, init_logging, run, Cli};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, cli.json_logs) {
        eprintln!("{}", e);
        std::process::exit(4);
    }

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "Command failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

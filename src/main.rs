use clap::Parser;
use swr::api::Cli;

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = swr::api::run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

mod cli;
mod dispatch;
mod errors;

use clap::Parser;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = cli::Cli::parse();
    let code = dispatch::run(cli).await;
    std::process::exit(code);
}

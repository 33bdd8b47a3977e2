use anyhow::Result;
use clap::Parser;

mod args;
mod bench;
mod lobby;
mod server;

use args::{Command, ServerArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    match &args.command {
        Command::Serve(serve) => server::start_server(serve).await,
        Command::Bench(bench) => bench::run_bench(bench).await,
    }
}

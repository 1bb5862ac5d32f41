mod cli;
mod clock;
mod discovery;
mod logging;
mod p2p;
mod rpc;
mod run;
mod sink;
mod storage;
#[cfg(test)]
mod test_utils;

use cli::{Cli, Command};
use eyre::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();
    logging::init_tracing(cli.verbose);

    match cli.command {
        Command::Crawl(args) => run::run_crawl(args).await,
        Command::Sensor(args) => run::run_sensor(args).await,
    }
}

//! tsmetrics CLI entry point.

use tsmetrics_lib::cli::{self, Cli};
use tsmetrics_lib::core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli::execute(cli).await
}

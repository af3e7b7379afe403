use anyhow::Result;
use clap::Parser;
use gitlab_ci_local::cli::Cli;
use gitlab_ci_local::output;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    output::print_banner();

    let cli = Cli::parse();
    info!("Starting gitlab-ci-local");
    cli.execute().await?;

    Ok(())
}

use anyhow::Result;
use tracing::{error, info};

use oval_store::config::{Command, Config};
use oval_store::meta::REVISION;
use oval_store::{commands, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_args();

    // Handle version subcommand
    if let Command::Version = config.command {
        println!(
            "oval-store {}, commit: {}, build_date: {}",
            env!("CARGO_PKG_VERSION"),
            REVISION,
            env!("VERGEN_BUILD_TIMESTAMP"),
        );
        return Ok(());
    }

    logging::init(&config.log_format, &config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = REVISION,
        db_type = %config.db_type,
        "oval-store starting"
    );

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    if let Err(e) = commands::run(config).await {
        error!(error = %format!("{e:#}"), "Application error");
        std::process::exit(1);
    }

    Ok(())
}

use anyhow::Context;
use clap::Parser;
use dipwatch::{
    arguments::Cli,
    commands,
    config,
    errors::{DipwatchError, EXIT_FATAL, EXIT_OK},
    logger::{self, LogTag},
};

/// Entry point: parse arguments, load config, start logging, dispatch.
///
/// Exit codes: 0 success, 1 fatal configuration/storage error,
/// 2 lock held by a live process.
#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(&cli).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            let code = e
                .downcast_ref::<DipwatchError>()
                .map(|de| de.exit_code())
                .unwrap_or(EXIT_FATAL);
            logger::error(LogTag::System, &format!("{:#}", e));
            code
        }
    };

    logger::flush();
    std::process::exit(code);
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config_path = cli.config_path();
    // Missing config file means defaults; a broken one is fatal
    let cfg = config::read_config_file(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;

    logger::init(cli.logger_config(&cfg));
    logger::debug(
        LogTag::System,
        &format!("Config: {}", config_path.display()),
    );
    for key in config::unknown_keys(&config_path) {
        logger::warning(LogTag::System, &format!("Unknown config key '{}' ignored", key));
    }

    commands::dispatch(cli, cfg).await?;
    Ok(())
}

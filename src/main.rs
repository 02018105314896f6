use clap::Parser;
use lchbot::bot::Bot;
use lchbot::config::BotConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lchbot", about = "OneBot-11 chat-bot runtime", version)]
struct Args {
    /// Path to the INI config file.
    #[arg(default_value = "config.ini")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match BotConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(config = %args.config.display(), "lchbot starting");

    // The script interpreter is provided by the embedding distribution;
    // the stock binary runs builtin and native plugins only.
    let bot = match Bot::init(config, None).await {
        Ok(bot) => bot,
        Err(e) => {
            tracing::error!(error = %e, "initialization failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = bot.run().await {
        tracing::error!(error = %e, "runtime error");
        std::process::exit(1);
    }
}

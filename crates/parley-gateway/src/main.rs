use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serenity::http::Http;
use serenity::model::id::GuildId;
use tracing::info;

use parley_agent::openai::OpenAiProvider;
use parley_core::ParleyConfig;
use parley_discord::{DiscordAdapter, DiscordError, ParleyApp};

#[derive(Parser)]
#[command(name = "parley", version, about = "Discord threads relayed to an LLM")]
struct Cli {
    /// Config file (defaults to $PARLEY_CONFIG, then ~/.parley/parley.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Connect to Discord and serve chat threads (default)
    Run,
    /// Register slash commands and exit
    SyncCommands {
        /// Register for one guild instead of globally
        #[arg(long)]
        guild: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info,parley_discord=info,parley_agent=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ParleyConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if config.discord.bot_token.trim().is_empty() {
        return Err(DiscordError::NoToken.into());
    }

    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run(config).await,
        Cmd::SyncCommands { guild } => sync_commands(&config, guild.or(config.discord.guild_id)).await,
    }
}

async fn run(config: ParleyConfig) -> anyhow::Result<()> {
    let provider = OpenAiProvider::from_config(&config.provider);
    info!(
        model = %config.chat.model,
        base_url = %config.provider.base_url,
        stream = config.chat.stream_responses,
        "starting parley"
    );

    let app = Arc::new(ParleyApp::new(Arc::new(config), Box::new(provider)));
    let adapter = DiscordAdapter::new(app)?;
    adapter.run().await;
    Ok(())
}

async fn sync_commands(config: &ParleyConfig, guild: Option<u64>) -> anyhow::Result<()> {
    let http = Http::new(&config.discord.bot_token);
    let application = http
        .get_current_application_info()
        .await
        .context("failed to look up the bot application")?;
    http.set_application_id(application.id);

    let count = parley_discord::commands::register_commands(&http, guild.map(GuildId::new)).await?;
    match guild {
        Some(id) => println!("Registered {count} commands in guild {id}."),
        None => println!("Registered {count} global commands."),
    }
    Ok(())
}

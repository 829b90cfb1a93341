//! Ballbet CLI binary

use anyhow::Context;
use ballbet::cli::{BallbetApp, Cli, Commands, ReplayScript};
use ballbet::{ExchangeConfig, ItemId, OutcomeKind};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ExchangeConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ExchangeConfig::default(),
    };
    if let Some(cooldown) = cli.cooldown {
        config.cooldown_secs = cooldown;
    }

    match cli.command {
        Commands::Simulate {
            outcome,
            seed,
            items,
            fail_item,
        } => {
            let outcome = OutcomeKind::from(outcome);
            tracing::info!("Simulating a {:?} negotiation with {} items each", outcome, items);

            let app = BallbetApp::new(config, outcome, seed)?;
            let summary = app.simulate(items, fail_item.map(ItemId)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            app.engine().shutdown().await;
        }

        Commands::Replay {
            script,
            outcome,
            seed,
        } => {
            let loaded = ReplayScript::from_json_file(&script)
                .with_context(|| format!("loading script {}", script.display()))?;
            let outcome = loaded
                .outcome
                .or(outcome.map(OutcomeKind::from))
                .unwrap_or(OutcomeKind::WinnerTakesAll);
            tracing::info!(
                "Replaying {} actions from {} ({:?})",
                loaded.actions.len(),
                script.display(),
                outcome
            );

            let app = BallbetApp::new(config, outcome, loaded.seed.or(seed))?;
            let steps = app.replay(&loaded).await;
            println!("{}", serde_json::to_string_pretty(&steps)?);

            app.engine().shutdown().await;
        }

        Commands::Config => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

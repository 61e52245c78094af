// src/main.rs
use anyhow::{anyhow, bail, Context};
use clap::Parser;
use log::{error, info, warn};
use sticker_hunter::{
    api::{ReqwestTransport, StickerdomApi},
    config::{load_config, Config, ProfileName, RateLimiterProfile},
    monitoring::CollectionWatcher,
    purchase::{PaymentCollaborators, PurchaseOrchestrator, PurchaseResult},
    rate_limiter::{RateLimiterService, SqliteStateStore},
    utils::setup_logging,
    wallet::{ton_to_nano, DryRunStars, DryRunWallet},
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct Target {
    collection_id: u64,
    character_id: u64,
}

fn parse_target(raw: &str) -> Result<Target, String> {
    let (collection, character) = raw
        .split_once('/')
        .ok_or_else(|| "expected <collection>/<character>, e.g. 19/2".to_string())?;
    let parse = |what: &str, v: &str| {
        v.trim()
            .parse::<u64>()
            .map_err(|_| format!("{} id must be a number, got '{}'", what, v))
    };
    Ok(Target {
        collection_id: parse("collection", collection)?,
        character_id: parse("character", character)?,
    })
}

#[derive(Parser)]
#[command(name = "sticker-hunter", about = "Rate-limit aware sticker pack buyer")]
struct Cli {
    /// Purchase target as <collection>/<character>
    #[arg(value_parser = parse_target)]
    target: Option<Target>,

    /// Rate limiter profile: safe, balanced, fast, aggressive, extreme
    #[arg(long)]
    profile: Option<ProfileName>,

    /// List the rate limiter profiles and exit
    #[arg(long)]
    list_profiles: bool,

    /// Shrink delay ceilings for fast iteration
    #[arg(long)]
    test_mode: bool,

    /// Plan the session without creating orders or paying
    #[arg(long)]
    dry_run: bool,

    /// Check configuration and API connectivity, then exit
    #[arg(long)]
    test: bool,

    /// Buy right away instead of watching for the drop
    #[arg(long, conflicts_with_all = ["continuous", "dry_run", "test"])]
    once: bool,

    /// Keep watching and buying after a successful session
    #[arg(long, conflicts_with_all = ["dry_run", "test"])]
    continuous: bool,
}

/// Payment back ends linked into this binary. TON signing and Telegram
/// sessions are external; until one is linked here, live runs stop at
/// startup with a configuration error.
fn live_collaborators() -> PaymentCollaborators {
    PaymentCollaborators::default()
}

fn simulated_collaborators(config: &Config) -> PaymentCollaborators {
    PaymentCollaborators::new(
        Arc::new(DryRunWallet::new(
            "dry-run-wallet",
            ton_to_nano(config.dry_run_balance_ton),
        )),
        Arc::new(DryRunStars::new()),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.list_profiles {
        println!("Available rate limiter profiles:");
        for profile in RateLimiterProfile::all() {
            println!("  {}", profile);
        }
        return Ok(());
    }

    let config = load_config(cli.profile, cli.test_mode)?;
    let log_file = config.log_to_file.then_some(config.log_file_path.as_str());
    setup_logging(&config.log_level, log_file).context("Failed to initialize logging")?;
    info!("🚀 Sticker hunter starting");
    config.log_settings();

    let store = Arc::new(SqliteStateStore::open(&config.rate_limiter.db_path).await?);
    let limiter = RateLimiterService::init(config.rate_limiter.clone(), store.clone()).await?;
    let transport = Arc::new(ReqwestTransport::new(&config.jwt_token)?);
    let api = Arc::new(StickerdomApi::new(
        config.api_client_config(),
        transport,
        limiter.clone(),
    ));

    let outcome = tokio::select! {
        outcome = run(&cli, &config, api.clone()) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("🛑 Interrupted, shutting down");
            Ok(())
        }
    };

    info!("📊 {}", limiter.stats().await);
    if let Err(e) = limiter.shutdown().await {
        error!("❌ Rate limiter shutdown failed: {}", e);
    }
    store.close().await;
    outcome
}

async fn run(cli: &Cli, config: &Config, api: Arc<StickerdomApi>) -> anyhow::Result<()> {
    if cli.test {
        return connection_test(&api).await;
    }

    let target = cli
        .target
        .ok_or_else(|| anyhow!("A target is required, e.g. `sticker-hunter 19/2`"))?;

    if cli.dry_run || config.dry_run_mode {
        return dry_run(config, api, target).await;
    }

    let collaborators = live_collaborators();
    let settings = config.purchase_settings();
    let strategies = collaborators
        .strategies(&config.payment_methods, &api, settings)
        .with_context(|| {
            format!(
                "Cannot pay with {:?}; use --dry-run to plan a session for {}/{}",
                config.payment_methods, target.collection_id, target.character_id
            )
        })?;
    collaborators.verify().await?;
    if !api.test_connection().await {
        bail!("Failed to connect to the marketplace API");
    }

    let orchestrator = strategies
        .into_iter()
        .fold(PurchaseOrchestrator::new(api.clone(), settings), |o, s| {
            o.with_strategy(s)
        });

    let results = if cli.once {
        orchestrator
            .execute_multiple_purchases(target.collection_id, target.character_id)
            .await?
    } else {
        let watcher = CollectionWatcher::new(api, config.watch_settings(cli.continuous));
        watcher
            .watch(&orchestrator, target.collection_id, target.character_id)
            .await?
            .results
    };
    report(&results, settings.stickers_per_purchase);
    Ok(())
}

fn report(results: &[PurchaseResult], stickers_per_purchase: u32) {
    let confirmed = results.iter().filter(|r| r.is_successful()).count();
    if confirmed == 0 {
        let last_error = results.iter().rev().find_map(|r| r.error_message.as_deref());
        error!(
            "❌ All purchase attempts failed{}",
            last_error.map(|e| format!(": {}", e)).unwrap_or_default()
        );
        return;
    }
    info!(
        "✅ Completed {} purchase(s) ({} stickers)",
        confirmed,
        confirmed as u64 * u64::from(stickers_per_purchase)
    );
    if confirmed < results.len() {
        warn!("⚠️ {} purchase(s) failed", results.len() - confirmed);
    }
}

async fn connection_test(api: &StickerdomApi) -> anyhow::Result<()> {
    info!("🧪 Testing API connection...");
    if api.test_connection().await {
        info!("✅ API connection OK");
        info!("📊 {}", api.limiter().stats().await);
        Ok(())
    } else {
        bail!("API connection test failed")
    }
}

async fn dry_run(config: &Config, api: Arc<StickerdomApi>, target: Target) -> anyhow::Result<()> {
    let settings = config.purchase_settings();
    let orchestrator = simulated_collaborators(config)
        .strategies(&config.payment_methods, &api, settings)?
        .into_iter()
        .fold(PurchaseOrchestrator::new(api.clone(), settings), |o, s| {
            o.with_strategy(s)
        });

    info!(
        "🎭 DRY RUN for {}/{} with {:.2} TON simulated balance",
        target.collection_id, target.character_id, config.dry_run_balance_ton
    );
    let report = orchestrator
        .dry_run(target.collection_id, target.character_id)
        .await?;

    let Some(name) = &report.collection_name else {
        info!("🎭 Collection {} is not published yet", target.collection_id);
        return Ok(());
    };
    if let Some(character) = &report.character {
        info!(
            "🎭 {} / {}: {} left at {} per sticker",
            name, character.name, character.left, character.price
        );
    }
    for (method, plan) in &report.plans {
        info!(
            "🎭 {}: {} purchase(s) x {} sticker(s), ~{:.4} TON",
            method, plan.purchases, settings.stickers_per_purchase, plan.total_cost_ton
        );
    }
    for (method, reason) in &report.shortfalls {
        warn!("🎭 {}: {}", method, reason);
    }
    info!(
        "🎭 Would make {} purchase(s) in total, ~{:.4} TON",
        report.total_purchases(),
        report.total_cost_ton()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_conflicts_with_continuous() {
        assert!(Cli::try_parse_from(["sticker-hunter", "19/2", "--once", "--continuous"]).is_err());
        let cli = Cli::try_parse_from(["sticker-hunter", "19/2", "--continuous"]).unwrap();
        assert!(cli.continuous && !cli.once);
    }

    #[test]
    fn test_parse_target() {
        let target = parse_target("19/2").unwrap();
        assert_eq!((target.collection_id, target.character_id), (19, 2));
        assert!(parse_target("19").is_err());
        assert!(parse_target("cats/2").is_err());
    }
}

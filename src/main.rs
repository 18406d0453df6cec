//! Mogogo
//!
//! `mogogo` runs the funnel interactively in the terminal; `mogogo serve`
//! exposes the same funnel and the plumes ledger over HTTP.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mogogo::config::{ConfigManager, MogogoConfig};
use mogogo::funnel::{Choice, FunnelOrchestrator, FunnelPhase, FunnelView, SessionView, UserContext};
use mogogo::ledger::{PlumesLedger, SqlitePlumesLedger};
use mogogo::oracle::{CachedOracle, OpenAICompatibleOracle, Oracle, ResponseCache, RetryingOracle};
use mogogo::places::{GooglePlacesClient, LatLng, ScanPipeline};
use mogogo::safety::OracleQuota;
use mogogo::server::{run_server, AppState};
use mogogo::utils::truncate_chars;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mogogo=info")))
        .with_target(true)
        .init();

    let config_path = std::env::var("MOGOGO_CONFIG").unwrap_or_else(|_| "mogogo.json".to_string());
    let mut config = ConfigManager::new(config_path).load().await?;
    config.apply_env();

    let orchestrator = Arc::new(build_orchestrator(&config).await?);

    match std::env::args().nth(1).as_deref() {
        Some("serve") => {
            let state = AppState { orchestrator };
            run_server(state, &config.bind_address).await
        }
        Some(other) if other != "play" => {
            println!("usage: mogogo [play|serve]");
            Ok(())
        }
        _ => run_cli(orchestrator, &config).await,
    }
}

async fn build_orchestrator(config: &MogogoConfig) -> Result<FunnelOrchestrator> {
    let settings = &config.oracle;
    let provider: Arc<dyn Oracle> =
        Arc::new(OpenAICompatibleOracle::new(settings.base_url.clone(), settings.api_key.clone()));
    let retrying: Arc<dyn Oracle> = Arc::new(RetryingOracle::new(provider, settings.timeout(), settings.retry_delay()));
    let cache = Arc::new(ResponseCache::new(settings.cache_capacity, settings.cache_ttl()));
    let oracle: Arc<dyn Oracle> = Arc::new(CachedOracle::new(retrying, cache));

    let ledger = Arc::new(
        SqlitePlumesLedger::new(&config.database_path)
            .await
            .with_context(|| format!("Failed to open ledger at {}", config.database_path.display()))?,
    );

    let mut orchestrator = FunnelOrchestrator::new(oracle, ledger, settings.clone(), config.funnel.clone());

    match &config.places_api_key {
        Some(key) => {
            let client = Arc::new(GooglePlacesClient::new(key.clone()));
            orchestrator = orchestrator.with_scanner(ScanPipeline::new(client));
        }
        None => warn!("No place search key configured, outdoor sessions will fall back to the oracle"),
    }

    if config.quota.enabled {
        let quota = OracleQuota::new(config.quota.burst, Duration::from_secs(config.quota.refill_secs));
        orchestrator = orchestrator.with_quota(quota);
    }

    Ok(orchestrator)
}

// ──────────────────────────────────────────────────────────────────────────────
// INTERACTIVE FUNNEL
// ──────────────────────────────────────────────────────────────────────────────

async fn run_cli(orchestrator: Arc<FunnelOrchestrator>, config: &MogogoConfig) -> Result<()> {
    let device_id = std::env::var("MOGOGO_DEVICE").unwrap_or_else(|_| "cli".to_string());
    let store = orchestrator.store();

    match store.load(&config.session_file).await {
        Ok(count) => info!("Restored {} sessions from {}", count, config.session_file.display()),
        Err(e) => info!("Starting without saved sessions: {}", e),
    }

    println!("\n{}", "═".repeat(60));
    println!("🦉 Mogogo v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", "═".repeat(60));
    let account = orchestrator.ledger().get_account(&device_id).await?;
    println!("🪶 Plumes: {}{}", account.balance, if account.is_premium { " (premium)" } else { "" });

    let mut current = match store.latest_for_device(&device_id).await {
        Some(session) if !matches!(session.phase, FunnelPhase::Result { .. }) => {
            println!("💾 Resuming your last session");
            Some(orchestrator.view(&session.id).await?)
        }
        _ => None,
    };

    println!("\n💡 Commands: a | b | n (neither) | back | retry | reroll | refine | new | plumes | ad | daily | quit\n");

    if current.is_none() {
        current = Some(orchestrator.start(&device_id, ask_context()?).await?);
    }

    loop {
        if let Some(view) = &current {
            render(view);
        }

        let input = prompt("👉 ")?;
        let command = input.to_lowercase();
        if command.is_empty() {
            continue;
        }

        let session_id = current.as_ref().map(|v| v.session_id.clone()).unwrap_or_default();
        let outcome = match command.as_str() {
            "quit" | "exit" | "q" => break,
            "a" => orchestrator.choose(&session_id, Choice::A).await,
            "b" => orchestrator.choose(&session_id, Choice::B).await,
            "n" | "neither" => orchestrator.choose(&session_id, Choice::Neither).await,
            "back" => orchestrator.back(&session_id).await,
            "retry" => orchestrator.retry(&session_id).await,
            "reroll" => orchestrator.reroll(&session_id).await,
            "refine" => orchestrator.refine(&session_id).await,
            "new" => orchestrator.start(&device_id, ask_context()?).await,
            "plumes" => {
                let account = orchestrator.ledger().get_account(&device_id).await?;
                println!("🪶 {} plumes\n", account.balance);
                continue;
            }
            "ad" => {
                let balance = orchestrator.ledger().reward_ad(&device_id).await?;
                println!("📺 Thanks for watching! {} plumes\n", balance);
                continue;
            }
            "daily" => {
                let claim = orchestrator.ledger().claim_daily(&device_id, chrono::Utc::now()).await?;
                println!("🎁 {}\n", serde_json::to_string(&claim)?);
                continue;
            }
            _ => {
                println!("❓ Unknown command\n");
                continue;
            }
        };

        match outcome {
            Ok(view) => current = Some(view),
            Err(e) => println!("❌ {} ({})\n", e, e.code()),
        }

        if let Err(e) = store.save(&config.session_file).await {
            warn!("Failed to save sessions: {}", e);
        }
    }

    store.save(&config.session_file).await?;
    println!("\n👋 À bientôt !\n");
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Parse a user answer through the type's wire names, falling back to `default`.
fn ask<T: DeserializeOwned>(label: &str, default: &str, prefix: &str) -> Result<T> {
    loop {
        let answer = prompt(&format!("{} [{}]: ", label, default))?;
        let raw = if answer.is_empty() { default.to_string() } else { answer.to_lowercase() };
        let wire = if raw.starts_with(prefix) { raw } else { format!("{}{}", prefix, raw) };
        match serde_json::from_value(serde_json::Value::String(wire)) {
            Ok(value) => return Ok(value),
            Err(_) => println!("   not understood, try again"),
        }
    }
}

fn ask_context() -> Result<UserContext> {
    println!("\n✨ New session");
    let environment = ask("Where? home | shelter | open_air", "home", "env_")?;
    let social = ask("With whom? solo | couple | friends | family", "solo", "")?;
    let energy = loop {
        let answer = prompt("Energy 1-5 [3]: ")?;
        if answer.is_empty() {
            break 3;
        }
        match answer.parse::<u8>() {
            Ok(n) if (1..=5).contains(&n) => break n,
            _ => println!("   between 1 and 5 please"),
        }
    };
    let budget = ask("Budget? free | budget | standard | luxury", "free", "")?;

    let mut context = UserContext::new(social, energy, budget, environment);
    if environment.is_location_based() {
        let answer = prompt("Position as lat,lng (empty to skip): ")?;
        if let Some((lat, lng)) = answer.split_once(',') {
            match (lat.trim().parse(), lng.trim().parse()) {
                (Ok(latitude), Ok(longitude)) => {
                    context = context.with_location(LatLng { latitude, longitude }, None);
                }
                _ => println!("   position ignored"),
            }
        }
    }
    let hint = prompt("Any idea already? (empty to skip): ")?;
    if !hint.is_empty() {
        context = context.with_hint(hint);
    }
    Ok(context)
}

fn render(view: &SessionView) {
    if let Some(error) = &view.error {
        println!("⚠️  {} ({}){}", error.message, error.code, if view.can_retry { " - type 'retry'" } else { "" });
    }

    match &view.view {
        FunnelView::ThemeDuel { a, b } => {
            println!("\n🅰  {} {}    or    🅱  {} {}\n", a.emoji, a.name, b.emoji, b.name);
        }
        FunnelView::DrillDown { message, question, option_a, option_b, emoji_a, emoji_b, depth, .. } => {
            println!("\n🦉 {}", message);
            println!("   {} (step {})", question, depth);
            println!("   🅰  {} {}", emoji_a.as_deref().unwrap_or(""), option_a);
            match option_b {
                Some(b) => println!("   🅱  {} {}\n", emoji_b.as_deref().unwrap_or(""), b),
                None => println!("   (last option, 'n' goes back up)\n"),
            }
        }
        FunnelView::PlacesScan { theme, radius_meters } => {
            println!("\n🔎 Looking for {} within {} m...\n", theme, radius_meters);
        }
        FunnelView::OutdoorDrill { message, question, option_a, option_b, candidates } => {
            println!("\n🦉 {}", message);
            if let Some(question) = question {
                println!("   {} ({} places left)", question, candidates);
            }
            if let (Some(a), Some(b)) = (option_a, option_b) {
                println!("   🅰  {}\n   🅱  {}\n", a, b);
            }
        }
        FunnelView::Result { message, recommendation, place, maps_url, .. } => {
            println!("\n{}", "─".repeat(50));
            println!("🎉 {}", message);
            println!("   {}", recommendation.titre);
            println!("   {}", truncate_chars(&recommendation.explication, 400));
            if let Some(place) = place {
                if let Some(rating) = place.rating {
                    println!("   ⭐ {:.1}", rating);
                }
            }
            for action in &recommendation.actions {
                println!("   → {}: {}", action.label, action.query);
            }
            if let Some(url) = maps_url {
                println!("   🗺  {}", url);
            }
            println!("{}", "─".repeat(50));
            let mut extras = Vec::new();
            if view.can_reroll {
                extras.push("reroll");
            }
            if view.can_refine {
                extras.push("refine");
            }
            if !extras.is_empty() {
                println!("   Not convinced? {}\n", extras.join(" | "));
            }
        }
    }
}

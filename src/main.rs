//! Process wiring: configuration, screener, enricher, then one trade
//! coordinator thread per selected opportunity.

use std::path::Path;
use std::process;
use std::thread;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fundarb::alert::BotAlert;
use fundarb::config;
use fundarb::enricher;
use fundarb::executor::TradeCoordinator;
use fundarb::screener;

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "main_config.json".to_string());
    let (config, credentials) = match config::load(Path::new(&config_path)) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(error = %format!("{e:#}"), "config_load_failed");
            process::exit(1);
        }
    };
    let alert = match BotAlert::new(config.chatid, &config.bot_token) {
        Ok(alert) => alert,
        Err(e) => {
            error!(error = %format!("{e:#}"), "alert_init_failed");
            process::exit(1);
        }
    };

    let candidates = match screener::screen() {
        Ok(candidates) => candidates,
        Err(e) => {
            error!(error = %format!("{e:#}"), "screener_failed");
            process::exit(1);
        }
    };
    info!(candidates = candidates.len(), "screener_done");

    let opportunities = match enricher::enrich(
        candidates,
        &credentials,
        config.usdt_amount,
        config.leverage,
        config.estimated_pnl,
    ) {
        Ok(opportunities) => opportunities,
        Err(e) => {
            error!(error = %format!("{e:#}"), "enrichment_failed");
            process::exit(1);
        }
    };
    if opportunities.is_empty() {
        info!("no_tradeable_opportunities");
        return;
    }

    let mut handles = Vec::new();
    for opportunity in opportunities {
        let coordinator = TradeCoordinator::new(
            opportunity,
            config.funding_timeout_secs,
            config.db_connection_string.clone(),
            alert.clone(),
        );
        let name = format!("trade-{}", coordinator.ticker().to_lowercase());
        match thread::Builder::new()
            .name(name)
            .spawn(move || coordinator.run())
        {
            Ok(handle) => handles.push(handle),
            Err(e) => error!(error = %e, "coordinator_spawn_failed"),
        }
    }
    for handle in handles {
        handle.join().ok();
    }
    info!("all_coordinators_finished");
}

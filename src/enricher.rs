//! Opportunity enrichment: bring each surviving candidate from a scored
//! funding differential to a fully tradeable plan — live adapters with
//! warm order books, lot-feasible size, leverage, routes, margin mode and
//! an estimated PnL the final filter can judge.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::Credentials;
use crate::exchanges::{build_venue, StreamShared, Venue, VenueName};
use crate::funding::{
    crypto_amount_for_usdt, estimate_pnl_percent, route_sides, used_leverage, ExchangeRoutes,
};
use crate::models::{MarginMode, PositionSide, Side};
use crate::screener::RawOpportunity;

/// Seconds to let the freshly started order books warm before pricing.
const BOOK_WARMUP_SECS: u64 = 10;

/// One venue's half of a prepared arbitrage.
pub struct VenueLeg {
    pub name: VenueName,
    pub symbol: String,
    pub venue: Arc<dyn Venue>,
    pub streams: StreamShared,
    pub side: PositionSide,
    /// Funding rate (percent) the screener saw.
    pub funding_rate: Decimal,
    /// Top-of-book price in the opening direction at enrichment time.
    pub open_price: Decimal,
}

/// A candidate that survived sizing and the PnL filter, ready for its
/// trade coordinator.
pub struct Opportunity {
    pub ticker: String,
    pub qty: Decimal,
    pub leverage: Decimal,
    pub routes: ExchangeRoutes,
    pub estimated_pnl_percent: Decimal,
    pub legs: [VenueLeg; 2],
}

struct LegInit {
    venue: Arc<dyn Venue>,
    streams: StreamShared,
    multiplier: Decimal,
    bracket: (Decimal, Decimal),
}

/// Construct the adapter, start its streams and fetch the static
/// instrument facts, all off the caller's thread.
fn spawn_leg_init(
    name: VenueName,
    symbol: String,
    credentials: &Credentials,
    usdt_amount: Decimal,
) -> Result<JoinHandle<Result<LegInit>>> {
    let creds = credentials
        .venue(name)
        .with_context(|| format!("no credentials for {name}"))?
        .clone();
    Ok(thread::Builder::new()
        .name(format!("enrich-{}-{}", name.as_str().to_lowercase(), symbol))
        .spawn(move || -> Result<LegInit> {
            let venue: Arc<dyn Venue> = Arc::from(build_venue(name, &symbol, &creds)?);
            let streams = StreamShared::new(&symbol);
            venue.start_streams(&streams)?;
            let multiplier = venue.get_multiplier()?;
            let bracket = venue.get_max_leverage_for_usdt_amount(usdt_amount)?;
            Ok(LegInit {
                venue,
                streams,
                multiplier,
                bracket,
            })
        })?)
}

fn join_leg(handle: JoinHandle<Result<LegInit>>) -> Result<LegInit> {
    handle
        .join()
        .map_err(|_| anyhow!("enrichment worker panicked"))?
}

/// Top-of-book price for opening a position of `side`: a long buys the
/// best ask, a short sells into the best bid.
fn opening_price(streams: &StreamShared, side: PositionSide) -> Option<Decimal> {
    let book = streams.book.lock();
    if !book.is_ready() {
        return None;
    }
    match side.open_side() {
        Side::Buy => book.best_ask().map(|(price, _)| price),
        Side::Sell => book.best_bid().map(|(price, _)| price),
    }
}

pub fn enrich(
    candidates: Vec<RawOpportunity>,
    credentials: &Credentials,
    usdt_amount: Decimal,
    configured_leverage: Decimal,
    pnl_threshold: Decimal,
) -> Result<Vec<Opportunity>> {
    // Fan out every leg's setup, then barrier.
    let mut pending = Vec::new();
    for raw in candidates {
        let first = spawn_leg_init(raw.venue_1, raw.symbol_1.clone(), credentials, usdt_amount)?;
        let second = spawn_leg_init(raw.venue_2, raw.symbol_2.clone(), credentials, usdt_amount)?;
        pending.push((raw, first, second));
    }
    let mut resolved = Vec::new();
    for (raw, first, second) in pending {
        resolved.push((raw, join_leg(first)?, join_leg(second)?));
    }

    // Let the books replicate a few update cycles before reading prices.
    thread::sleep(Duration::from_secs(BOOK_WARMUP_SECS));

    let percent = Decimal::ONE_HUNDRED;
    let mut prepared = Vec::new();
    for (raw, init_1, init_2) in resolved {
        let leverage = used_leverage(configured_leverage, init_1.bracket, init_2.bracket);
        let routes = route_sides(raw.venue_1, raw.funding_1, raw.venue_2, raw.funding_2);
        let side_1 = routes.side_for(raw.venue_1);
        let side_2 = routes.side_for(raw.venue_2);

        let (Some(price_1), Some(price_2)) = (
            opening_price(&init_1.streams, side_1),
            opening_price(&init_2.streams, side_2),
        ) else {
            warn!(ticker = %raw.ticker, "book_not_ready");
            continue;
        };

        let Some(qty) = crypto_amount_for_usdt(
            price_1,
            price_2,
            usdt_amount,
            init_1.multiplier,
            init_2.multiplier,
        ) else {
            info!(ticker = %raw.ticker, "under_minimum_lot");
            continue;
        };

        let (price_long, price_short) = if side_1 == PositionSide::Long {
            (price_1, price_2)
        } else {
            (price_2, price_1)
        };
        let estimate = estimate_pnl_percent(
            raw.funding_1 / percent,
            raw.funding_2 / percent,
            qty * price_1 * leverage,
            qty * price_2 * leverage,
            raw.fee_1 / percent,
            raw.fee_2 / percent,
            qty,
            price_long,
            price_short,
            leverage,
        );

        // Isolated margin and the common leverage on both venues, in
        // parallel; a failure here kills the whole run before any order.
        let setter_1 = {
            let venue = init_1.venue.clone();
            thread::spawn(move || venue.set_margin_type_and_leverage(MarginMode::Isolated, leverage))
        };
        let setter_2 = {
            let venue = init_2.venue.clone();
            thread::spawn(move || venue.set_margin_type_and_leverage(MarginMode::Isolated, leverage))
        };
        setter_1
            .join()
            .map_err(|_| anyhow!("margin setup worker panicked"))??;
        setter_2
            .join()
            .map_err(|_| anyhow!("margin setup worker panicked"))??;

        let Some(estimated_pnl_percent) = estimate else {
            info!(ticker = %raw.ticker, "pnl_estimate_undefined");
            continue;
        };
        if estimated_pnl_percent <= pnl_threshold {
            info!(
                ticker = %raw.ticker,
                estimate = %estimated_pnl_percent,
                threshold = %pnl_threshold,
                "estimate_below_threshold"
            );
            continue;
        }

        info!(
            ticker = %raw.ticker,
            qty = %qty,
            leverage = %leverage,
            estimate = %estimated_pnl_percent,
            long = %routes.long,
            short = %routes.short,
            "opportunity_prepared"
        );
        prepared.push(Opportunity {
            ticker: raw.ticker.clone(),
            qty,
            leverage,
            routes,
            estimated_pnl_percent,
            legs: [
                VenueLeg {
                    name: raw.venue_1,
                    symbol: raw.symbol_1.clone(),
                    venue: init_1.venue,
                    streams: init_1.streams,
                    side: side_1,
                    funding_rate: raw.funding_1,
                    open_price: price_1,
                },
                VenueLeg {
                    name: raw.venue_2,
                    symbol: raw.symbol_2.clone(),
                    venue: init_2.venue,
                    streams: init_2.streams,
                    side: side_2,
                    funding_rate: raw.funding_2,
                    open_price: price_2,
                },
            ],
        });
    }
    Ok(prepared)
}

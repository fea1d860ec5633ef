//! Cross-venue funding screener: collect funding tables in parallel,
//! intersect tickers, score every venue pair and keep the best
//! non-overlapping candidates.

pub mod binance;
pub mod bybit;

use std::collections::HashMap;
use std::thread;

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use tracing::info;

use crate::exchanges::VenueName;
use crate::funding::calculate_delta;

/// One funding-table row as a venue reports it.
#[derive(Debug, Clone)]
pub struct FundingQuote {
    /// Last funding rate, percent.
    pub rate: Decimal,
    /// The venue's own symbol spelling for the ticker.
    pub original_symbol: String,
}

/// Screener-side view of one venue: public data only, no credentials.
pub trait MarketData: Send {
    fn name(&self) -> VenueName;
    /// Maker commission, percent.
    fn maker_fee(&self) -> Decimal;
    /// Taker commission, percent. Arbitrage legs open and close
    /// aggressively, so scoring charges this one.
    fn taker_fee(&self) -> Decimal;
    /// USDT-quoted funding table, venue blacklist already applied.
    fn funding_rates(&self, quote_asset: &str) -> Result<HashMap<String, FundingQuote>>;
}

/// Funding snapshot for one venue: the rate table plus its fee schedule.
#[derive(Debug)]
pub struct VenueFunding {
    pub venue: VenueName,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    pub rates: HashMap<String, FundingQuote>,
}

/// A scored venue pair for one ticker, before enrichment.
#[derive(Debug, Clone)]
pub struct RawOpportunity {
    pub ticker: String,
    pub venue_1: VenueName,
    pub venue_2: VenueName,
    pub symbol_1: String,
    pub symbol_2: String,
    pub funding_1: Decimal,
    pub funding_2: Decimal,
    pub fee_1: Decimal,
    pub fee_2: Decimal,
    pub delta_gross: Decimal,
    pub delta_net: Decimal,
}

/// Minimum fee-adjusted differential (percent) worth trading.
fn net_delta_floor() -> Decimal {
    Decimal::new(1, 1) // 0.1
}

/// Fetch every venue's funding table, one worker thread per venue.
pub fn collect_funding(clients: Vec<Box<dyn MarketData>>) -> Result<Vec<VenueFunding>> {
    let handles: Vec<_> = clients
        .into_iter()
        .map(|client| {
            thread::spawn(move || -> Result<VenueFunding> {
                let rates = client.funding_rates("USDT")?;
                Ok(VenueFunding {
                    venue: client.name(),
                    maker_fee: client.maker_fee(),
                    taker_fee: client.taker_fee(),
                    rates,
                })
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|handle| {
            handle
                .join()
                .map_err(|_| anyhow!("screener worker panicked"))?
        })
        .collect()
}

/// Score every (ticker, venue pair) present on at least two venues and
/// sort by net differential descending.
pub fn score_pairs(collected: &[VenueFunding]) -> Vec<RawOpportunity> {
    let mut tickers: HashMap<&str, Vec<&VenueFunding>> = HashMap::new();
    for venue in collected {
        for ticker in venue.rates.keys() {
            tickers.entry(ticker.as_str()).or_default().push(venue);
        }
    }

    let mut scored = Vec::new();
    for (ticker, venues) in tickers {
        if venues.len() < 2 {
            continue;
        }
        for i in 0..venues.len() {
            for j in i + 1..venues.len() {
                let (a, b) = (venues[i], venues[j]);
                let quote_a = &a.rates[ticker];
                let quote_b = &b.rates[ticker];
                let gross = calculate_delta(
                    quote_a.rate,
                    quote_b.rate,
                    Decimal::ZERO,
                    Decimal::ZERO,
                );
                let net = calculate_delta(quote_a.rate, quote_b.rate, a.taker_fee, b.taker_fee);
                scored.push(RawOpportunity {
                    ticker: ticker.to_string(),
                    venue_1: a.venue,
                    venue_2: b.venue,
                    symbol_1: quote_a.original_symbol.clone(),
                    symbol_2: quote_b.original_symbol.clone(),
                    funding_1: quote_a.rate,
                    funding_2: quote_b.rate,
                    fee_1: a.taker_fee,
                    fee_2: b.taker_fee,
                    delta_gross: gross,
                    delta_net: net,
                });
            }
        }
    }

    scored.sort_by(|a, b| b.delta_net.cmp(&a.delta_net));
    scored
}

/// Greedy venue-exclusive selection: walk the sorted list and keep an
/// opportunity only when its net differential clears the floor and
/// neither venue is already committed. Each venue therefore trades in at
/// most one coordinator.
pub fn select_exclusive(sorted: &[RawOpportunity]) -> Vec<RawOpportunity> {
    let mut committed: Vec<VenueName> = Vec::new();
    let mut selected = Vec::new();
    for candidate in sorted {
        if candidate.delta_net <= net_delta_floor() {
            continue;
        }
        if committed.contains(&candidate.venue_1) || committed.contains(&candidate.venue_2) {
            continue;
        }
        committed.push(candidate.venue_1);
        committed.push(candidate.venue_2);
        selected.push(candidate.clone());
    }
    selected
}

/// The whole pipeline against the live venues.
pub fn screen() -> Result<Vec<RawOpportunity>> {
    let clients: Vec<Box<dyn MarketData>> = vec![
        Box::new(binance::BinanceMarket::new()?),
        Box::new(bybit::BybitMarket::new()?),
    ];
    let collected = collect_funding(clients)?;
    let scored = score_pairs(&collected);
    info!(pairs = scored.len(), "screener_scored");
    let selected = select_exclusive(&scored);
    info!(selected = selected.len(), "screener_selected");
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue(name: VenueName, fee: Decimal, rates: &[(&str, Decimal)]) -> VenueFunding {
        VenueFunding {
            venue: name,
            maker_fee: fee,
            taker_fee: fee,
            rates: rates
                .iter()
                .map(|(ticker, rate)| {
                    (
                        ticker.to_string(),
                        FundingQuote {
                            rate: *rate,
                            original_symbol: ticker.to_string(),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn pair_below_floor_is_dropped() {
        // Shared ticker, 0.08% vs -0.05% funding, 0.04% fees on both:
        // net = 0.13 - 0.16 = -0.03 < 0.1.
        let collected = vec![
            venue(VenueName::Binance, dec!(0.04), &[("XUSDT", dec!(0.08))]),
            venue(VenueName::Bybit, dec!(0.04), &[("XUSDT", dec!(-0.05))]),
        ];
        let scored = score_pairs(&collected);
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].delta_net, dec!(-0.03));
        assert!(select_exclusive(&scored).is_empty());
    }

    #[test]
    fn tickers_on_one_venue_never_score() {
        let collected = vec![
            venue(VenueName::Binance, dec!(0.04), &[("AUSDT", dec!(0.3))]),
            venue(VenueName::Bybit, dec!(0.06), &[("BUSDT", dec!(-0.3))]),
        ];
        assert!(score_pairs(&collected).is_empty());
    }

    #[test]
    fn selection_is_venue_exclusive() {
        // Two tickers both clear the floor; with only two venues, only the
        // better one may trade.
        let collected = vec![
            venue(
                VenueName::Binance,
                dec!(0.04),
                &[("AUSDT", dec!(0.5)), ("BUSDT", dec!(0.4))],
            ),
            venue(
                VenueName::Bybit,
                dec!(0.06),
                &[("AUSDT", dec!(-0.5)), ("BUSDT", dec!(-0.1))],
            ),
        ];
        let scored = score_pairs(&collected);
        let selected = select_exclusive(&scored);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].ticker, "AUSDT");

        let mut seen = Vec::new();
        for opp in &selected {
            assert!(!seen.contains(&opp.venue_1));
            assert!(!seen.contains(&opp.venue_2));
            seen.push(opp.venue_1);
            seen.push(opp.venue_2);
        }
    }

    #[test]
    fn scoring_sorts_by_net_descending() {
        let collected = vec![
            venue(
                VenueName::Binance,
                Decimal::ZERO,
                &[("AUSDT", dec!(0.2)), ("BUSDT", dec!(0.9))],
            ),
            venue(
                VenueName::Bybit,
                Decimal::ZERO,
                &[("AUSDT", dec!(-0.2)), ("BUSDT", dec!(0.1))],
            ),
        ];
        let scored = score_pairs(&collected);
        assert_eq!(scored.len(), 2);
        assert!(scored[0].delta_net >= scored[1].delta_net);
        assert_eq!(scored[0].ticker, "BUSDT");
    }
}

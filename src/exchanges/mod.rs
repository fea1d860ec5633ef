//! Venue adapters: uniform REST + streaming access to one derivatives
//! venue for one symbol.
//!
//! The two venues expose the same capability set (balances, order
//! lifecycle, funding, leverage, streams) behind the [`Venue`] trait; all
//! venue-specific signing, payload shapes and streaming dialects stay
//! inside this module tree.

pub mod binance;
pub mod bybit;
pub mod rest;
pub mod session;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Timelike, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::book::OrderBook;
use crate::config::VenueCredentials;
use crate::models::{
    AssetBalance, Fill, IncomeKind, IncomeRecord, MarginMode, Order, OrderInfo, OrderRequest,
    Position,
};

/// UTC offsets (seconds after midnight) at which perpetual funding settles.
/// Venue config; both supported venues settle on the 8-hour grid.
pub const DEFAULT_FUNDING_TIMES: [i64; 3] = [0, 28_800, 57_600];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VenueName {
    Binance,
    Bybit,
}

impl VenueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueName::Binance => "Binance",
            VenueName::Bybit => "ByBit",
        }
    }

    pub fn parse(raw: &str) -> Option<VenueName> {
        match raw {
            "Binance" => Some(VenueName::Binance),
            "ByBit" | "Bybit" => Some(VenueName::Bybit),
            _ => None,
        }
    }
}

impl std::fmt::Display for VenueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals the private stream raises for the trade coordinator, plus the
/// raw user-data payloads for the trade log.
#[derive(Debug, Default)]
pub struct StreamReports {
    pub user_events: Vec<Value>,
    /// client order id -> latest venue-reported status.
    pub order_statuses: HashMap<String, String>,
    pub funding_collected: bool,
    pub liquidated: bool,
}

impl StreamReports {
    pub fn clear(&mut self) {
        self.user_events.clear();
        self.order_statuses.clear();
        self.funding_collected = false;
        self.liquidated = false;
    }
}

/// Per venue-symbol shared state: streaming threads write, the trade
/// coordinator reads. Every access goes through the owning lock and no
/// critical section performs I/O.
#[derive(Clone)]
pub struct StreamShared {
    pub book: Arc<Mutex<OrderBook>>,
    pub reports: Arc<Mutex<StreamReports>>,
    pub balances: Arc<Mutex<HashMap<String, AssetBalance>>>,
}

impl StreamShared {
    pub fn new(symbol: &str) -> StreamShared {
        StreamShared {
            book: Arc::new(Mutex::new(OrderBook::new(symbol))),
            reports: Arc::new(Mutex::new(StreamReports::default())),
            balances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wipe everything a dead session may have left behind.
    pub fn clear(&self) {
        self.book.lock().clear();
        self.reports.lock().clear();
        self.balances.lock().clear();
    }

    pub fn funding_collected(&self) -> bool {
        self.reports.lock().funding_collected
    }

    pub fn liquidated(&self) -> bool {
        self.reports.lock().liquidated
    }
}

/// True when a funding tick lies in `(now + window, now + window + 60)`.
pub fn before_funding_window(times: &[i64], now_secs: i64, window_secs: i64) -> bool {
    times
        .iter()
        .any(|&t| window_secs < t - now_secs && t - now_secs < window_secs + 60)
}

/// True when a funding tick lies in `(now - window - 60, now - window)`.
pub fn after_funding_window(times: &[i64], now_secs: i64, window_secs: i64) -> bool {
    times
        .iter()
        .any(|&t| window_secs < now_secs - t && now_secs - t < window_secs + 60)
}

pub fn utc_secs_since_midnight() -> i64 {
    i64::from(Utc::now().num_seconds_from_midnight())
}

/// The capability set every venue adapter provides. REST operations are
/// synchronous; `start_streams` hands off to dedicated market-data
/// threads that own the socket lifecycle.
pub trait Venue: Send + Sync {
    fn name(&self) -> VenueName;

    fn symbol(&self) -> &str;

    /// Minimum quantity increment (lot step) for the symbol.
    fn get_multiplier(&self) -> Result<Decimal>;

    fn get_balances(&self) -> Result<HashMap<String, AssetBalance>>;

    /// Place an order and report its terminal post-placement status (the
    /// adapter re-queries the status immediately on success).
    fn place_order(&self, request: &OrderRequest) -> Result<Order>;

    /// Tolerant of the open-orders/all-orders asymmetry: when the
    /// open-orders endpoint no longer knows the order, the historical
    /// endpoint supplies the status.
    fn get_order_status(&self, order: &Order) -> Result<Order>;

    /// Aggregate per-fill commission, quote and base quantity; average
    /// price is sum(quote)/sum(base).
    fn get_order_info(&self, order: &Order) -> Result<OrderInfo>;

    fn get_fills(&self, start_ms: i64, end_ms: i64) -> Result<Vec<Fill>>;

    fn get_positions(&self) -> Result<Vec<Position>>;

    fn get_income_history(
        &self,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<IncomeRecord>>;

    fn get_income_funding_fee(&self, start_ms: i64, end_ms: i64) -> Result<Decimal> {
        let incomes = self.get_income_history(Some(start_ms), Some(end_ms))?;
        Ok(incomes
            .iter()
            .filter(|i| i.kind == IncomeKind::FundingFee)
            .map(|i| i.income)
            .sum())
    }

    /// Highest leverage bracket whose notional cap strictly exceeds
    /// `usdt_amount * initial_leverage`, plus the venue's leverage step.
    fn get_max_leverage_for_usdt_amount(&self, usdt_amount: Decimal) -> Result<(Decimal, Decimal)>;

    fn cancel_order(&self, order: &Order) -> Result<bool>;

    /// Last funding rate, in percent.
    fn get_funding_rate(&self) -> Result<Decimal>;

    /// Leverage first, then margin mode. The venue answering "no need to
    /// change margin type" counts as success.
    fn set_margin_type_and_leverage(&self, mode: MarginMode, leverage: Decimal) -> Result<bool>;

    /// Spawn the market-data/user-data session threads for this
    /// venue-symbol, wired to `shared`.
    fn start_streams(&self, shared: &StreamShared) -> Result<()>;

    fn funding_times(&self) -> &[i64] {
        &DEFAULT_FUNDING_TIMES
    }

    /// A funding settlement is coming up within the configured window.
    fn closest_time_before_funding(&self, window_secs: i64) -> bool {
        before_funding_window(self.funding_times(), utc_secs_since_midnight(), window_secs)
    }

    /// A funding settlement happened at least `window_secs` ago.
    fn funding_timeout(&self, window_secs: i64) -> bool {
        after_funding_window(self.funding_times(), utc_secs_since_midnight(), window_secs)
    }
}

pub fn build_venue(
    name: VenueName,
    symbol: &str,
    creds: &VenueCredentials,
) -> Result<Box<dyn Venue>> {
    Ok(match name {
        VenueName::Binance => Box::new(binance::Binance::new(symbol, creds)?),
        VenueName::Bybit => Box::new(bybit::Bybit::new(symbol, creds)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funding_window_predicates() {
        let times = &DEFAULT_FUNDING_TIMES;

        // 28800 - 28550 = 250: inside (240, 300).
        assert!(before_funding_window(times, 28_550, 240));
        // Exactly on either boundary: excluded (strict comparisons).
        assert!(!before_funding_window(times, 28_500, 240));
        assert!(!before_funding_window(times, 28_560, 240));
        // Far from any tick.
        assert!(!before_funding_window(times, 10_000, 240));

        // 29050 - 28800 = 250: funding happened 250s ago, window 240.
        assert!(after_funding_window(times, 29_050, 240));
        assert!(!after_funding_window(times, 29_100, 240));
        assert!(!after_funding_window(times, 29_040, 240));
        assert!(!after_funding_window(times, 20_000, 240));
    }

    #[test]
    fn venue_name_round_trip() {
        assert_eq!(VenueName::parse("Binance"), Some(VenueName::Binance));
        assert_eq!(VenueName::parse("ByBit"), Some(VenueName::Bybit));
        assert_eq!(VenueName::Bybit.as_str(), "ByBit");
        assert_eq!(VenueName::parse("Kraken"), None);
    }

    #[test]
    fn stream_shared_clear_resets_signals() {
        let shared = StreamShared::new("BTCUSDT");
        shared.reports.lock().funding_collected = true;
        shared.book.lock().timestamp_ms = 1;
        shared.clear();
        assert!(!shared.funding_collected());
        assert_eq!(shared.book.lock().timestamp_ms, 0);
    }
}

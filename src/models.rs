//! Core data model shared by both venue adapters.
//!
//! Venue-local encodings ("BUY"/"Buy", "LIMIT"/"Limit", "CANCELLED"/
//! "Cancelled") are translated into these types at the adapter boundary;
//! nothing outside `exchanges` touches a raw venue string.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn flipped(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Gtx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Parse a venue-reported status, tolerating case and underscore
    /// differences between dialects ("PARTIALLY_FILLED" vs
    /// "PartiallyFilled", "CANCELLED" vs "Cancelled").
    pub fn from_venue(raw: &str) -> Result<OrderStatus> {
        let norm = raw.trim().to_uppercase().replace('_', "");
        Ok(match norm.as_str() {
            "NEW" | "CREATED" | "UNTRIGGERED" => OrderStatus::New,
            "PARTIALLYFILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELLED" | "CANCELED" | "PENDINGCANCEL" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" | "DEACTIVATED" => OrderStatus::Expired,
            other => bail!("unknown order status {other:?}"),
        })
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated,
    Cross,
}

/// Which side of the paired trade a venue holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order direction that opens this position.
    pub fn open_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Order direction that flattens this position.
    pub fn close_side(self) -> Side {
        self.open_side().flipped()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

/// Immutable identity record produced by a venue on order placement.
/// Status refresh produces a new value; orders are never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub price: Decimal,
    pub status: OrderStatus,
}

impl Order {
    /// Synthetic record for a placement the venue refused outright
    /// (e.g. insufficient margin). Lets the coordinator roll back the
    /// surviving leg instead of failing the whole trade.
    pub fn rejected(symbol: &str, price: Decimal) -> Order {
        Order {
            order_id: String::new(),
            client_order_id: String::new(),
            symbol: symbol.to_string(),
            price,
            status: OrderStatus::Rejected,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.status == OrderStatus::Rejected
    }
}

/// Order augmented after settlement with its fill aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order: Order,
    pub side: Side,
    pub position_side: Option<PositionSide>,
    /// Average fill price = sum(quote) / sum(base).
    pub avg_order_price: Decimal,
    pub quote_qty: Decimal,
    pub qty: Decimal,
    pub fee: Decimal,
    pub order_time: DateTime<Utc>,
}

impl OrderInfo {
    /// Mock row journaled for the venue whose leg never opened.
    pub fn rejected_stub() -> OrderInfo {
        OrderInfo {
            order: Order::rejected("", Decimal::ZERO),
            side: Side::Sell,
            position_side: Some(PositionSide::Short),
            avg_order_price: Decimal::ZERO,
            quote_qty: Decimal::ZERO,
            qty: Decimal::ZERO,
            fee: Decimal::ZERO,
            order_time: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub entry_price: Decimal,
    /// Signed notional of the open position.
    pub position_value: Decimal,
    pub cum_pnl: Decimal,
    pub mark_price: Decimal,
    pub liquidation_price: Decimal,
    pub leverage: Decimal,
    pub margin_mode: MarginMode,
}

/// A single venue-reported fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub trade_id: String,
    pub order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub quote_qty: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
    pub realized_pnl: Decimal,
    pub margin_asset: String,
    pub time_ms: i64,
    pub position_side: Option<PositionSide>,
    pub maker: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncomeKind {
    Pnl,
    FundingFee,
    Commission,
    Other,
}

impl IncomeKind {
    pub fn from_venue(raw: &str) -> IncomeKind {
        match raw {
            "PNL" | "REALIZED_PNL" => IncomeKind::Pnl,
            "FUNDING_FEE" => IncomeKind::FundingFee,
            "COMMISSION" => IncomeKind::Commission,
            _ => IncomeKind::Other,
        }
    }
}

/// One income-history row (realized pnl, funding credit, commission, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomeRecord {
    pub symbol: String,
    pub kind: IncomeKind,
    pub income: Decimal,
    pub asset: String,
    pub time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub balance: Decimal,
    pub available: Decimal,
}

/// Everything a venue needs to place one order. Venue-specific request
/// encodings are produced from this by each adapter.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub side: Side,
    pub qty: Decimal,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub close_position: bool,
}

impl OrderRequest {
    pub fn market(side: Side, qty: Decimal) -> OrderRequest {
        OrderRequest {
            side,
            qty,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Gtc,
            price: None,
            stop_price: None,
            reduce_only: false,
            close_position: false,
        }
    }

    pub fn limit(side: Side, qty: Decimal, price: Decimal) -> OrderRequest {
        OrderRequest {
            side,
            qty,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            price: Some(price),
            stop_price: None,
            reduce_only: false,
            close_position: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation_covers_both_dialects() {
        assert_eq!(
            OrderStatus::from_venue("PARTIALLY_FILLED").unwrap(),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(
            OrderStatus::from_venue("PartiallyFilled").unwrap(),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(
            OrderStatus::from_venue("Cancelled").unwrap(),
            OrderStatus::Cancelled
        );
        assert_eq!(
            OrderStatus::from_venue("REJECTED").unwrap(),
            OrderStatus::Rejected
        );
        assert!(OrderStatus::from_venue("Bogus").is_err());
    }

    #[test]
    fn position_side_order_directions() {
        assert_eq!(PositionSide::Long.open_side(), Side::Buy);
        assert_eq!(PositionSide::Long.close_side(), Side::Sell);
        assert_eq!(PositionSide::Short.open_side(), Side::Sell);
        assert_eq!(PositionSide::Short.close_side(), Side::Buy);
    }
}

//! Order book replica maintained from a venue's depth stream.
//!
//! Two price-sorted ladders (bids descending, asks ascending) built from an
//! initial snapshot plus incremental deltas, with depth-walking calculators
//! the close-watch loop uses to price a prospective exit.

use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::models::Side;

/// (price, size) pair; zero-size levels are never persisted.
pub type BookLevel = (Decimal, Decimal);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bids,
    Asks,
}

/// Result of walking one side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthQuote {
    /// Price of the deepest level the walk touched.
    pub price: Decimal,
    /// Volume-weighted average fill price.
    pub avg_price: Decimal,
    /// Amount in the opposite denomination: quote spent/received for
    /// [`OrderBook::calculate`], base bought/sold for
    /// [`OrderBook::calculate_for_usdt`].
    pub filled: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    pub symbol: String,
    pub timestamp_ms: i64,
    /// Monotonic depth sequence number; `None` until the first snapshot.
    pub last_update_id: Option<u64>,
    /// Last funding rate (percent) from the mark-price stream.
    pub funding_rate: Option<Decimal>,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> OrderBook {
        OrderBook {
            symbol: symbol.into(),
            ..OrderBook::default()
        }
    }

    /// Drop all replicated state. Called when a streaming session dies so
    /// readers never act on a ladder that stopped updating.
    pub fn clear(&mut self) {
        self.timestamp_ms = 0;
        self.last_update_id = None;
        self.funding_rate = None;
        self.bids.clear();
        self.asks.clear();
    }

    /// Both ladders populated and stamped.
    pub fn is_ready(&self) -> bool {
        self.timestamp_ms > 0 && !self.bids.is_empty() && !self.asks.is_empty()
    }

    /// Replace the whole book from a REST or stream snapshot. Resets the
    /// sequence number; deltas older than the snapshot must be discarded by
    /// the caller.
    pub fn replace(
        &mut self,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        last_update_id: Option<u64>,
        timestamp_ms: i64,
    ) {
        self.bids = bids;
        self.asks = asks;
        self.last_update_id = last_update_id;
        self.timestamp_ms = timestamp_ms;
    }

    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }

    /// Apply one delta level: overwrite on price match (remove when the new
    /// size is zero), insert before the first dominated level, ignore
    /// deletes of absent prices.
    pub fn manage_side(&mut self, side: BookSide, price: Decimal, qty: Decimal) {
        let ladder = match side {
            BookSide::Bids => &mut self.bids,
            BookSide::Asks => &mut self.asks,
        };
        for i in 0..ladder.len() {
            if price == ladder[i].0 {
                if qty.is_zero() {
                    ladder.remove(i);
                } else {
                    ladder[i] = (price, qty);
                }
                return;
            }
            let dominates = match side {
                BookSide::Bids => price > ladder[i].0,
                BookSide::Asks => price < ladder[i].0,
            };
            if dominates {
                if !qty.is_zero() {
                    ladder.insert(i, (price, qty));
                }
                return;
            }
        }
        // Worse than every resting level (or empty ladder): new tail entry.
        if !qty.is_zero() {
            ladder.push((price, qty));
        }
    }

    /// Walk the ladder a `route`-side order would consume (BUY eats asks,
    /// SELL eats bids) until `amount` base units are filled. Returns `None`
    /// when the book lacks the depth.
    pub fn calculate(&self, route: Side, amount: Decimal) -> Option<DepthQuote> {
        if amount <= Decimal::ZERO {
            return None;
        }
        let ladder = match route {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        let mut remaining = amount;
        let mut quote = Decimal::ZERO;
        for &(price, size) in ladder {
            if size >= remaining {
                quote += remaining * price;
                return Some(DepthQuote {
                    price,
                    avg_price: quote / amount,
                    filled: quote,
                });
            }
            quote += size * price;
            remaining -= size;
        }
        None
    }

    /// Dual of [`calculate`]: walk by quote amount, returning the base
    /// quantity that amount buys/sells.
    ///
    /// [`calculate`]: OrderBook::calculate
    pub fn calculate_for_usdt(&self, route: Side, amount: Decimal) -> Option<DepthQuote> {
        if amount <= Decimal::ZERO {
            return None;
        }
        let ladder = match route {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        let mut remaining = amount;
        let mut base = Decimal::ZERO;
        for &(price, size) in ladder {
            let level_quote = size * price;
            if level_quote >= remaining {
                base += remaining / price;
                return Some(DepthQuote {
                    price,
                    avg_price: amount / base,
                    filled: base,
                });
            }
            base += size;
            remaining -= level_quote;
        }
        None
    }

    /// Top-25-levels dump for trade logs.
    pub fn depth_summary(&self) -> Value {
        let cap = |side: &[BookLevel]| -> Vec<[String; 2]> {
            side.iter()
                .take(25)
                .map(|(p, q)| [p.to_string(), q.to_string()])
                .collect()
        };
        json!({
            "bids": cap(&self.bids),
            "asks": cap(&self.asks),
            "timestamp": self.timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book_with_levels() -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT");
        book.replace(
            vec![(dec!(100), dec!(1)), (dec!(99), dec!(2)), (dec!(98), dec!(3))],
            vec![(dec!(101), dec!(1)), (dec!(102), dec!(2)), (dec!(103), dec!(3))],
            Some(100),
            1_700_000_000_000,
        );
        book
    }

    fn assert_sorted(book: &OrderBook) {
        for pair in book.bids.windows(2) {
            assert!(pair[0].0 > pair[1].0, "bids not strictly descending");
        }
        for pair in book.asks.windows(2) {
            assert!(pair[0].0 < pair[1].0, "asks not strictly ascending");
        }
        if let (Some((bb, _)), Some((ba, _))) = (book.best_bid(), book.best_ask()) {
            assert!(bb < ba, "crossed book");
        }
    }

    #[test]
    fn ordering_survives_delta_sequences() {
        let mut book = book_with_levels();

        book.manage_side(BookSide::Bids, dec!(99.5), dec!(1)); // insert mid
        book.manage_side(BookSide::Bids, dec!(100.5), dec!(4)); // new best bid
        book.manage_side(BookSide::Asks, dec!(102), dec!(5)); // overwrite
        book.manage_side(BookSide::Asks, dec!(101), dec!(0)); // remove best ask
        book.manage_side(BookSide::Asks, dec!(104), dec!(1)); // tail insert
        book.manage_side(BookSide::Bids, dec!(97), dec!(0)); // absent delete: no-op

        assert_sorted(&book);
        assert_eq!(book.best_bid(), Some((dec!(100.5), dec!(4))));
        assert_eq!(book.best_ask(), Some((dec!(102), dec!(5))));
    }

    #[test]
    fn identical_delta_is_idempotent() {
        let mut book = book_with_levels();
        book.manage_side(BookSide::Bids, dec!(99.5), dec!(7));
        let once = book.bids.clone();
        book.manage_side(BookSide::Bids, dec!(99.5), dec!(7));
        assert_eq!(book.bids, once);
    }

    #[test]
    fn empty_ladder_insert_becomes_first_level() {
        let mut book = OrderBook::new("X");
        book.manage_side(BookSide::Asks, dec!(10), dec!(1));
        assert_eq!(book.asks, vec![(dec!(10), dec!(1))]);
        book.manage_side(BookSide::Asks, dec!(10), dec!(0));
        assert!(book.asks.is_empty());
    }

    #[test]
    fn buy_walk_consumes_asks() {
        let book = book_with_levels();
        // 1 @ 101 fully inside the first level.
        let q = book.calculate(Side::Buy, dec!(1)).unwrap();
        assert_eq!(q.price, dec!(101));
        assert_eq!(q.avg_price, dec!(101));
        assert_eq!(q.filled, dec!(101));

        // 2 = 1 @ 101 + 1 @ 102.
        let q = book.calculate(Side::Buy, dec!(2)).unwrap();
        assert_eq!(q.price, dec!(102));
        assert_eq!(q.filled, dec!(203));
        assert_eq!(q.avg_price, dec!(101.5));
    }

    #[test]
    fn sell_walk_consumes_bids() {
        let book = book_with_levels();
        let q = book.calculate(Side::Sell, dec!(3)).unwrap();
        // 1 @ 100 + 2 @ 99 = 298.
        assert_eq!(q.price, dec!(99));
        assert_eq!(q.filled, dec!(298));
    }

    #[test]
    fn insufficient_depth_is_unfilled() {
        let book = book_with_levels();
        assert!(book.calculate(Side::Buy, dec!(100)).is_none());
        assert!(book.calculate(Side::Buy, Decimal::ZERO).is_none());
    }

    #[test]
    fn quote_walk_is_dual_of_base_walk() {
        let book = book_with_levels();
        // 203 USDT buys exactly 2 base (1 @ 101 + 1 @ 102).
        let q = book.calculate_for_usdt(Side::Buy, dec!(203)).unwrap();
        assert_eq!(q.price, dec!(102));
        assert_eq!(q.filled, dec!(2));
        assert_eq!(q.avg_price, dec!(101.5));

        assert!(book.calculate_for_usdt(Side::Sell, dec!(1_000_000)).is_none());
    }

    #[test]
    fn depth_summary_caps_levels() {
        let mut book = OrderBook::new("X");
        for i in 0..30 {
            book.manage_side(BookSide::Bids, Decimal::from(1000 - i), dec!(1));
        }
        book.timestamp_ms = 42;
        let summary = book.depth_summary();
        assert_eq!(summary["bids"].as_array().unwrap().len(), 25);
        assert_eq!(summary["timestamp"], 42);
    }

    #[test]
    fn clear_resets_readiness() {
        let mut book = book_with_levels();
        assert!(book.is_ready());
        book.clear();
        assert!(!book.is_ready());
        assert_eq!(book.last_update_id, None);
    }
}

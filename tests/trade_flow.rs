//! End-to-end scenarios over the library surface: screener scoring and
//! selection, route assignment, sizing, close recombination and the
//! journal round trip.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use fundarb::book::OrderBook;
use fundarb::exchanges::VenueName;
use fundarb::funding::{
    calculate_delta, crypto_amount_for_usdt, route_sides,
};
use fundarb::journal::{Journal, LegRecord, TradeRecord};
use fundarb::models::{Order, OrderInfo, OrderStatus, PositionSide, Side};
use fundarb::screener::{score_pairs, select_exclusive, FundingQuote, VenueFunding};

fn venue_funding(name: VenueName, fee: Decimal, rates: &[(&str, Decimal)]) -> VenueFunding {
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
fn screener_drops_pair_below_threshold() {
    // Funding 0.08% vs -0.05%, fees 0.04%/0.04%: net -0.03 < 0.1.
    let collected = vec![
        venue_funding(VenueName::Binance, dec!(0.04), &[("XUSDT", dec!(0.08))]),
        venue_funding(VenueName::Bybit, dec!(0.04), &[("XUSDT", dec!(-0.05))]),
    ];
    let scored = score_pairs(&collected);
    assert_eq!(scored.len(), 1);
    assert_eq!(scored[0].delta_net, dec!(-0.03));
    assert!(select_exclusive(&scored).is_empty());
}

#[test]
fn higher_funding_venue_goes_short() {
    let routes = route_sides(VenueName::Binance, dec!(0.20), VenueName::Bybit, dec!(0.05));
    assert_eq!(routes.short, VenueName::Binance);
    assert_eq!(routes.long, VenueName::Bybit);
    assert_eq!(routes.side_for(VenueName::Binance), PositionSide::Short);
}

#[test]
fn sizing_quantizes_to_coarser_lot() {
    let qty = crypto_amount_for_usdt(
        dec!(20000),
        dec!(20010),
        dec!(1000),
        dec!(0.001),
        dec!(0.0001),
    )
    .unwrap();
    assert_eq!(qty, dec!(0.049));
}

#[test]
fn screener_pipeline_is_venue_exclusive_and_sorted() {
    let collected = vec![
        venue_funding(
            VenueName::Binance,
            dec!(0.04),
            &[("AUSDT", dec!(0.6)), ("BUSDT", dec!(0.9))],
        ),
        venue_funding(
            VenueName::Bybit,
            dec!(0.06),
            &[("AUSDT", dec!(-0.2)), ("BUSDT", dec!(-0.4))],
        ),
    ];
    let scored = score_pairs(&collected);
    // Net deltas: B pair |0.9-(-0.4)| - 0.2 = 1.1; A pair 0.8 - 0.2 = 0.6.
    assert_eq!(scored[0].ticker, "BUSDT");
    assert_eq!(
        scored[0].delta_net,
        calculate_delta(dec!(0.9), dec!(-0.4), dec!(0.04), dec!(0.06))
    );

    let selected = select_exclusive(&scored);
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].ticker, "BUSDT");
}

#[test]
fn favorable_recombination_across_books() {
    // Long leg opened at 20000 on venue A, short at 20000 on venue B.
    let mut book_a = OrderBook::new("BTCUSDT");
    book_a.replace(
        vec![(dec!(20050), dec!(5))],
        vec![(dec!(20060), dec!(5))],
        None,
        1,
    );
    let mut book_b = OrderBook::new("BTCUSDT");
    book_b.replace(
        vec![(dec!(19960), dec!(5))],
        vec![(dec!(19970), dec!(5))],
        None,
        1,
    );

    let qty = dec!(1);
    // The long closes by selling into A's bids, the short by buying B's asks.
    let close_a = book_a.calculate(Side::Sell, qty).unwrap().price;
    let close_b = book_b.calculate(Side::Buy, qty).unwrap().price;
    assert_eq!(close_a, dec!(20050));
    assert_eq!(close_b, dec!(19970));

    let delta_long = qty * (close_a - dec!(20000));
    let delta_short = qty * (dec!(20000) - close_b);
    assert_eq!(delta_long + delta_short, dec!(80));
    assert!(delta_long + delta_short >= Decimal::ZERO);
}

fn filled_info(order_id: &str, side: Side, qty: Decimal, price: Decimal) -> OrderInfo {
    OrderInfo {
        order: Order {
            order_id: order_id.to_string(),
            client_order_id: order_id.to_string(),
            symbol: "BTCUSDT".to_string(),
            price,
            status: OrderStatus::Filled,
        },
        side,
        position_side: None,
        avg_order_price: price,
        quote_qty: qty * price,
        qty,
        fee: dec!(0.4),
        order_time: Utc::now(),
    }
}

#[test]
fn failed_trade_journals_synthetic_rejected_leg() {
    // One leg opened and was rolled back; the other venue refused. The
    // journal still carries the full two-position shape, with zeroed
    // Rejected rows for the refused venue.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.db");
    let mut journal = Journal::open(path.to_str().unwrap()).unwrap();

    let open = filled_info("open-1", Side::Buy, dec!(0.05), dec!(20000));
    let rollback = filled_info("rollback-1", Side::Sell, dec!(0.05), dec!(19995));
    let stub = OrderInfo::rejected_stub();

    journal
        .insert_trade(&TradeRecord {
            ticker: "BTCUSDT",
            legs: [
                LegRecord {
                    venue: "Binance",
                    position_side: PositionSide::Long,
                    open: &open,
                    close: &rollback,
                    funding_rate: dec!(0.01),
                    funding_fee: Decimal::ZERO,
                },
                LegRecord {
                    venue: "ByBit",
                    position_side: PositionSide::Short,
                    open: &stub,
                    close: &stub,
                    funding_rate: dec!(0.30),
                    funding_fee: Decimal::ZERO,
                },
            ],
            pnl: dec!(-0.25),
            leverage: dec!(5),
            entry_time: Utc::now(),
            close_time: Utc::now(),
        })
        .unwrap();
}

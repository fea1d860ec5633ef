//! Durable trade journal. One settled arbitrage becomes exactly one
//! transaction: four order rows, two position rows, one trade row. Any
//! failure rolls the whole transaction back; journal rows are append-only.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use rust_decimal::Decimal;
use tracing::{error, info};

use crate::models::{OrderInfo, PositionSide};

/// Everything journaled about one venue's side of the trade.
pub struct LegRecord<'a> {
    pub venue: &'a str,
    pub position_side: PositionSide,
    pub open: &'a OrderInfo,
    pub close: &'a OrderInfo,
    /// Funding rate (percent) the trade was entered on.
    pub funding_rate: Decimal,
    /// Funding actually credited/debited during the hold.
    pub funding_fee: Decimal,
}

pub struct TradeRecord<'a> {
    pub ticker: &'a str,
    pub legs: [LegRecord<'a>; 2],
    pub pnl: Decimal,
    pub leverage: Decimal,
    pub entry_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
}

pub struct Journal {
    conn: Connection,
}

impl Journal {
    pub fn open(path: &str) -> Result<Journal> {
        let conn = Connection::open(path).context("open journal db")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY,
                venue TEXT NOT NULL,
                ex_order_id TEXT NOT NULL,
                side TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
                contract_quantity DECIMAL(26,16) NOT NULL,
                leverage INTEGER NOT NULL,
                avg_order_price DECIMAL(26,16) NOT NULL,
                fee_amount DECIMAL(26,16) NOT NULL,
                usdt_amount DECIMAL(26,16) NOT NULL,
                trade_time TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS position (
                id INTEGER PRIMARY KEY,
                position_side TEXT NOT NULL CHECK (position_side IN ('LONG', 'SHORT')),
                entry_order_id INTEGER NOT NULL REFERENCES orders(id),
                close_order_id INTEGER NOT NULL REFERENCES orders(id),
                funding_rate DECIMAL(26,16) NOT NULL,
                funding_fee DECIMAL(26,16) NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY,
                ticker TEXT NOT NULL,
                position_id_1 INTEGER NOT NULL REFERENCES position(id),
                position_id_2 INTEGER NOT NULL REFERENCES position(id),
                pnl DECIMAL(10,5) NOT NULL,
                entry_time TEXT NOT NULL,
                close_time TEXT NOT NULL
            );",
        )
        .context("create journal schema")?;
        Ok(Journal { conn })
    }

    /// Write the complete record. Fatal on failure: the transaction is
    /// rolled back and the trade is lost to the journal.
    pub fn insert_trade(&mut self, record: &TradeRecord) -> Result<()> {
        let tx = self.conn.transaction().context("begin journal tx")?;

        let result = Self::insert_rows(&tx, record);
        match result {
            Ok(()) => {
                tx.commit().context("commit journal tx")?;
                info!(ticker = record.ticker, pnl = %record.pnl, "journal_insert_ok");
                Ok(())
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                error!(ticker = record.ticker, error = %e, "journal_insert_failed");
                Err(e)
            }
        }
    }

    fn insert_rows(tx: &Transaction<'_>, record: &TradeRecord) -> Result<()> {
        let mut position_ids = [0i64; 2];
        for (idx, leg) in record.legs.iter().enumerate() {
            let open_id = Self::insert_order(tx, leg.venue, leg.open, record.leverage)?;
            let close_id = Self::insert_order(tx, leg.venue, leg.close, record.leverage)?;
            tx.execute(
                "INSERT INTO position
                 (position_side, entry_order_id, close_order_id, funding_rate, funding_fee)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    leg.position_side.as_str(),
                    open_id,
                    close_id,
                    leg.funding_rate.to_string(),
                    leg.funding_fee.to_string(),
                ],
            )
            .context("insert position")?;
            position_ids[idx] = tx.last_insert_rowid();
        }

        tx.execute(
            "INSERT INTO trades
             (ticker, position_id_1, position_id_2, pnl, entry_time, close_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.ticker,
                position_ids[0],
                position_ids[1],
                record.pnl.to_string(),
                record.entry_time.to_rfc3339(),
                record.close_time.to_rfc3339(),
            ],
        )
        .context("insert trade")?;
        Ok(())
    }

    fn insert_order(
        tx: &Transaction<'_>,
        venue: &str,
        info: &OrderInfo,
        leverage: Decimal,
    ) -> Result<i64> {
        tx.execute(
            "INSERT INTO orders
             (venue, ex_order_id, side, contract_quantity, leverage,
              avg_order_price, fee_amount, usdt_amount, trade_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                venue,
                info.order.order_id,
                info.side.as_str(),
                info.qty.to_string(),
                leverage.to_string(),
                info.avg_order_price.to_string(),
                info.fee.to_string(),
                info.quote_qty.to_string(),
                info.order_time.to_rfc3339(),
            ],
        )
        .context("insert order")?;
        Ok(tx.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, OrderStatus, Side};
    use rust_decimal_macros::dec;

    fn order_info(order_id: &str, side: Side, qty: Decimal, price: Decimal) -> OrderInfo {
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
            fee: dec!(0.02),
            order_time: Utc::now(),
        }
    }

    fn sample_record<'a>(
        open_1: &'a OrderInfo,
        close_1: &'a OrderInfo,
        open_2: &'a OrderInfo,
        close_2: &'a OrderInfo,
    ) -> TradeRecord<'a> {
        TradeRecord {
            ticker: "BTCUSDT",
            legs: [
                LegRecord {
                    venue: "Binance",
                    position_side: PositionSide::Long,
                    open: open_1,
                    close: close_1,
                    funding_rate: dec!(0.01),
                    funding_fee: dec!(0.5),
                },
                LegRecord {
                    venue: "ByBit",
                    position_side: PositionSide::Short,
                    open: open_2,
                    close: close_2,
                    funding_rate: dec!(0.30),
                    funding_fee: dec!(-0.2),
                },
            ],
            pnl: dec!(1.23456),
            leverage: dec!(5),
            entry_time: Utc::now(),
            close_time: Utc::now(),
        }
    }

    #[test]
    fn trade_insert_writes_seven_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let mut journal = Journal::open(path.to_str().unwrap()).unwrap();

        let open_1 = order_info("o1", Side::Buy, dec!(0.05), dec!(20000));
        let close_1 = order_info("c1", Side::Sell, dec!(0.05), dec!(20050));
        let open_2 = order_info("o2", Side::Sell, dec!(0.05), dec!(20010));
        let close_2 = order_info("c2", Side::Buy, dec!(0.05), dec!(19970));
        journal
            .insert_trade(&sample_record(&open_1, &close_1, &open_2, &close_2))
            .unwrap();

        let orders: i64 = journal
            .conn
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap();
        let positions: i64 = journal
            .conn
            .query_row("SELECT COUNT(*) FROM position", [], |row| row.get(0))
            .unwrap();
        let trades: i64 = journal
            .conn
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .unwrap();
        assert_eq!((orders, positions, trades), (4, 2, 1));

        // Position rows reference the right entry/close orders.
        let (entry, close): (i64, i64) = journal
            .conn
            .query_row(
                "SELECT entry_order_id, close_order_id FROM position WHERE position_side = 'LONG'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        let entry_ex: String = journal
            .conn
            .query_row(
                "SELECT ex_order_id FROM orders WHERE id = ?1",
                [entry],
                |row| row.get(0),
            )
            .unwrap();
        let close_ex: String = journal
            .conn
            .query_row(
                "SELECT ex_order_id FROM orders WHERE id = ?1",
                [close],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!((entry_ex.as_str(), close_ex.as_str()), ("o1", "c1"));

        // Quantities survive with their full precision.
        let qty: String = journal
            .conn
            .query_row(
                "SELECT contract_quantity FROM orders WHERE ex_order_id = 'o1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(qty, "0.05");
    }

    #[test]
    fn failed_insert_leaves_database_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let mut journal = Journal::open(path.to_str().unwrap()).unwrap();

        // Break the last of the seven inserts.
        journal.conn.execute("DROP TABLE trades", []).unwrap();

        let open_1 = order_info("o1", Side::Buy, dec!(0.05), dec!(20000));
        let close_1 = order_info("c1", Side::Sell, dec!(0.05), dec!(20050));
        let open_2 = order_info("o2", Side::Sell, dec!(0.05), dec!(20010));
        let close_2 = order_info("c2", Side::Buy, dec!(0.05), dec!(19970));
        let result = journal.insert_trade(&sample_record(&open_1, &close_1, &open_2, &close_2));
        assert!(result.is_err());

        // The first six inserts rolled back with the seventh.
        let orders: i64 = journal
            .conn
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap();
        let positions: i64 = journal
            .conn
            .query_row("SELECT COUNT(*) FROM position", [], |row| row.get(0))
            .unwrap();
        assert_eq!((orders, positions), (0, 0));
    }
}

//! Trade coordinator: executes one two-leg arbitrage end to end.
//!
//! State machine: `SETUP -> OPENING -> OPEN_WAIT_FUNDING -> CLOSE_WAITING
//! -> CLOSING -> SETTLING -> JOURNALED`, with `ABORTED` when both legs are
//! refused. A single refused leg is compensated by a market rollback on
//! the surviving venue and journaled as a failed trade.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::alert::BotAlert;
use crate::enricher::Opportunity;
use crate::journal::{Journal, LegRecord, TradeRecord};
use crate::models::{Order, OrderInfo, OrderRequest, PositionSide};

/// Time after funding settles before an unfavorable spread is closed at
/// market anyway.
const CLOSE_DEADLINE: Duration = Duration::from_secs(7 * 3600 + 54 * 60);

/// Cadence of the close-price watch.
const CLOSE_POLL: Duration = Duration::from_millis(100);

/// Cadence of the funding-wait poll.
const FUNDING_POLL: Duration = Duration::from_millis(500);

/// Settlement propagation pause after flattening both legs.
const SETTLE_QUIESCENCE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TradeState {
    Setup,
    Opening,
    OpenWaitFunding,
    CloseWaiting,
    Closing,
    Settling,
    Journaled,
    Aborted,
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "SETUP"),
            Self::Opening => write!(f, "OPENING"),
            Self::OpenWaitFunding => write!(f, "OPEN_WAIT_FUNDING"),
            Self::CloseWaiting => write!(f, "CLOSE_WAITING"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Settling => write!(f, "SETTLING"),
            Self::Journaled => write!(f, "JOURNALED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Close,
}

/// Price delta one leg contributes when closed at `close_price`, in quote
/// units: a long gains when price rose, a short when it fell.
pub(crate) fn close_delta(
    side: PositionSide,
    qty: Decimal,
    open_price: Decimal,
    close_price: Decimal,
) -> Decimal {
    match side {
        PositionSide::Long => qty * (close_price - open_price),
        PositionSide::Short => qty * (open_price - close_price),
    }
}

fn is_rejected_slot(slot: &Option<Order>) -> bool {
    match slot {
        None => true,
        Some(order) => order.is_rejected(),
    }
}

pub struct TradeCoordinator {
    opportunity: Opportunity,
    funding_timeout_secs: i64,
    journal_path: String,
    alert: BotAlert,
}

impl TradeCoordinator {
    pub fn new(
        opportunity: Opportunity,
        funding_timeout_secs: i64,
        journal_path: String,
        alert: BotAlert,
    ) -> TradeCoordinator {
        TradeCoordinator {
            opportunity,
            funding_timeout_secs,
            journal_path,
            alert,
        }
    }

    pub fn ticker(&self) -> &str {
        &self.opportunity.ticker
    }

    /// Run the trade to completion. Failures past the opening phase
    /// surface here and alert; nothing is partially journaled.
    pub fn run(&self) {
        if let Err(e) = self.execute() {
            error!(ticker = %self.opportunity.ticker, error = %format!("{e:#}"), "trade_failed");
            self.alert
                .send_text_message(&format!("Something went wrong: {e:#}"));
        }
    }

    fn transition(&self, state: TradeState) {
        info!(ticker = %self.opportunity.ticker, state = %state, "trade_state");
    }

    fn execute(&self) -> Result<()> {
        let opp = &self.opportunity;
        self.transition(TradeState::Setup);
        // Margin mode and leverage were applied by the enricher.
        self.alert.send_text_message(&format!(
            "I'm starting to trade\nticker={}\nlong={} short={}\nqty={} leverage={}\nfunding rates: {}={} {}={}",
            opp.ticker,
            opp.routes.long,
            opp.routes.short,
            opp.qty,
            opp.leverage,
            opp.legs[0].name,
            opp.legs[0].funding_rate,
            opp.legs[1].name,
            opp.legs[1].funding_rate,
        ));
        let start_ms = Utc::now().timestamp_millis();

        self.transition(TradeState::Opening);
        let opened = self.place_paired(Phase::Open);
        let rejected: Vec<usize> = (0..2).filter(|&i| is_rejected_slot(&opened[i])).collect();

        match rejected.len() {
            2 => {
                info!(ticker = %opp.ticker, "all_legs_rejected");
                self.transition(TradeState::Aborted);
                return Ok(());
            }
            1 => return self.rollback_and_journal(rejected[0], &opened, start_ms),
            _ => {}
        }
        let open_orders: Vec<Order> = opened.into_iter().flatten().collect();
        if open_orders.len() != 2 {
            bail!("open leg order missing after placement");
        }

        self.transition(TradeState::OpenWaitFunding);
        self.wait_for_funding();
        let funding_at = Instant::now();

        self.transition(TradeState::CloseWaiting);
        let close_prices = self.wait_for_close_prices(funding_at);
        if close_prices.is_none() {
            info!(ticker = %opp.ticker, "close_window_elapsed_closing_at_market");
        }

        self.transition(TradeState::Closing);
        let mut closed = self.place_paired(Phase::Close);
        for (i, leg) in opp.legs.iter().enumerate() {
            if is_rejected_slot(&closed[i]) {
                warn!(venue = %leg.name, "close_rejected_retrying_at_market");
                let retry = leg
                    .venue
                    .place_order(&OrderRequest::market(leg.side.close_side(), opp.qty))?;
                closed[i] = Some(retry);
            }
        }
        thread::sleep(SETTLE_QUIESCENCE);

        self.transition(TradeState::Settling);
        let end_ms = Utc::now().timestamp_millis();
        let funding_fees = self.collect_funding_fees(start_ms)?;
        thread::sleep(Duration::from_secs(1));
        let open_infos = self.order_infos(&open_orders)?;
        thread::sleep(Duration::from_secs(1));
        let pnl = self.collect_pnl(start_ms, end_ms)?;
        thread::sleep(Duration::from_secs(1));
        let close_orders: Vec<Order> = closed.into_iter().flatten().collect();
        if close_orders.len() != 2 {
            bail!("close leg order missing after placement");
        }
        let close_infos = self.order_infos(&close_orders)?;

        self.journal_trade(
            &open_infos,
            &close_infos,
            pnl,
            funding_fees,
            start_ms,
            end_ms,
        )?;
        self.transition(TradeState::Journaled);
        self.alert
            .send_text_message(&format!("I got out of position. Total PnL={pnl}"));
        Ok(())
    }

    /// Fire one market order per leg in parallel and await both. A slot is
    /// `None` when placement errored; the caller decides what a refusal
    /// means in its phase.
    fn place_paired(&self, phase: Phase) -> Vec<Option<Order>> {
        let handles: Vec<_> = self
            .opportunity
            .legs
            .iter()
            .map(|leg| {
                let venue = leg.venue.clone();
                let name = leg.name;
                let side = match phase {
                    Phase::Open => leg.side.open_side(),
                    Phase::Close => leg.side.close_side(),
                };
                let qty = self.opportunity.qty;
                thread::spawn(move || match venue.place_order(&OrderRequest::market(side, qty)) {
                    Ok(order) => Some(order),
                    Err(e) => {
                        error!(venue = %name, error = %format!("{e:#}"), "order_place_failed");
                        None
                    }
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(slot) => slot,
                Err(_) => {
                    error!("order placement worker panicked");
                    None
                }
            })
            .collect()
    }

    /// One leg opened, the other was refused: flatten the opened leg with
    /// an opposite-direction market order and journal a failed trade with
    /// a synthetic Rejected row for the refused venue.
    fn rollback_and_journal(
        &self,
        failed: usize,
        opened: &[Option<Order>],
        start_ms: i64,
    ) -> Result<()> {
        let survivor = 1 - failed;
        let leg = &self.opportunity.legs[survivor];
        warn!(
            rejected_on = %self.opportunity.legs[failed].name,
            rollback_on = %leg.name,
            "one_leg_rejected_rolling_back"
        );
        let rollback = leg
            .venue
            .place_order(&OrderRequest::market(leg.side.close_side(), self.opportunity.qty))?;

        let open_order = opened[survivor]
            .as_ref()
            .context("surviving leg order missing")?;
        let open_info = leg.venue.get_order_info(open_order)?;
        let close_info = leg.venue.get_order_info(&rollback)?;
        let stub = OrderInfo::rejected_stub();

        let end_ms = Utc::now().timestamp_millis();
        let pnl = self.collect_pnl(start_ms, end_ms)?;

        let (open_infos, close_infos) = if survivor == 0 {
            (
                vec![open_info, stub.clone()],
                vec![close_info, stub],
            )
        } else {
            (
                vec![stub.clone(), open_info],
                vec![stub, close_info],
            )
        };
        self.journal_trade(
            &open_infos,
            &close_infos,
            pnl,
            [Decimal::ZERO, Decimal::ZERO],
            start_ms,
            end_ms,
        )?;
        info!(ticker = %self.opportunity.ticker, "failed_trade_journaled");
        Ok(())
    }

    /// Block until each venue independently reports funding: either its
    /// private stream flagged the credit or the wall clock says the
    /// settlement window has passed.
    fn wait_for_funding(&self) {
        let mut done = [false, false];
        while !(done[0] && done[1]) {
            for (i, leg) in self.opportunity.legs.iter().enumerate() {
                if done[i] {
                    continue;
                }
                if leg.venue.funding_timeout(self.funding_timeout_secs) {
                    info!(venue = %leg.name, "funding_wait_closed_by_clock");
                    done[i] = true;
                } else if leg.streams.funding_collected() {
                    info!(venue = %leg.name, "funding_wait_closed_by_stream");
                    done[i] = true;
                }
            }
            if !(done[0] && done[1]) {
                thread::sleep(FUNDING_POLL);
            }
        }
    }

    /// Watch both books until the combined realized price delta of
    /// closing both legs turns non-negative, or the deadline forces an
    /// unconditional market close (`None`).
    fn wait_for_close_prices(&self, funding_at: Instant) -> Option<[Decimal; 2]> {
        let qty = self.opportunity.qty;
        let mut cycles: u64 = 0;
        loop {
            if funding_at.elapsed() >= CLOSE_DEADLINE {
                return None;
            }

            let mut closes = [Decimal::ZERO; 2];
            let mut total = Decimal::ZERO;
            let mut complete = true;
            for (i, leg) in self.opportunity.legs.iter().enumerate() {
                let quote = {
                    let book = leg.streams.book.lock();
                    if !book.is_ready() {
                        complete = false;
                        break;
                    }
                    book.calculate(leg.side.close_side(), qty)
                };
                let Some(quote) = quote else {
                    debug!(venue = %leg.name, "insufficient_close_depth");
                    complete = false;
                    break;
                };
                closes[i] = quote.price;
                total += close_delta(leg.side, qty, leg.open_price, quote.price);
            }

            if complete {
                cycles += 1;
                if cycles % 100 == 0 {
                    debug!(
                        ticker = %self.opportunity.ticker,
                        total_delta = %total,
                        "close_watch"
                    );
                }
                if total >= Decimal::ZERO {
                    info!(
                        ticker = %self.opportunity.ticker,
                        total_delta = %total,
                        "favorable_recombination"
                    );
                    return Some(closes);
                }
            }
            thread::sleep(CLOSE_POLL);
        }
    }

    fn collect_funding_fees(&self, start_ms: i64) -> Result<[Decimal; 2]> {
        let until = Utc::now().timestamp_millis() + 60_000;
        let mut fees = [Decimal::ZERO; 2];
        for (i, leg) in self.opportunity.legs.iter().enumerate() {
            fees[i] = leg.venue.get_income_funding_fee(start_ms - 60_000, until)?;
            info!(venue = %leg.name, funding_fee = %fees[i], "funding_fee_collected");
        }
        Ok(fees)
    }

    fn collect_pnl(&self, start_ms: i64, end_ms: i64) -> Result<Decimal> {
        let mut total = Decimal::ZERO;
        for leg in &self.opportunity.legs {
            let incomes = leg
                .venue
                .get_income_history(Some(start_ms - 60_000), Some(end_ms + 60_000))?;
            let venue_pnl: Decimal = incomes.iter().map(|income| income.income).sum();
            info!(venue = %leg.name, pnl = %venue_pnl, "income_collected");
            total += venue_pnl;
        }
        Ok(total)
    }

    fn order_infos(&self, orders: &[Order]) -> Result<Vec<OrderInfo>> {
        self.opportunity
            .legs
            .iter()
            .zip(orders)
            .map(|(leg, order)| leg.venue.get_order_info(order))
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn journal_trade(
        &self,
        open_infos: &[OrderInfo],
        close_infos: &[OrderInfo],
        pnl: Decimal,
        funding_fees: [Decimal; 2],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<()> {
        let opp = &self.opportunity;
        let mut journal = Journal::open(&self.journal_path)?;
        journal.insert_trade(&TradeRecord {
            ticker: &opp.ticker,
            legs: [
                LegRecord {
                    venue: opp.legs[0].name.as_str(),
                    position_side: opp.legs[0].side,
                    open: &open_infos[0],
                    close: &close_infos[0],
                    funding_rate: opp.legs[0].funding_rate,
                    funding_fee: funding_fees[0],
                },
                LegRecord {
                    venue: opp.legs[1].name.as_str(),
                    position_side: opp.legs[1].side,
                    open: &open_infos[1],
                    close: &close_infos[1],
                    funding_rate: opp.legs[1].funding_rate,
                    funding_fee: funding_fees[1],
                },
            ],
            pnl,
            leverage: opp.leverage,
            entry_time: DateTime::<Utc>::from_timestamp_millis(start_ms)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            close_time: DateTime::<Utc>::from_timestamp_millis(end_ms)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn recombination_deltas_add_across_legs() {
        // Long opened at 20000 closes at 20050; short opened at 20000
        // closes at 19970. Both legs gained: 50 + 30 per unit.
        let qty = dec!(1);
        let long = close_delta(PositionSide::Long, qty, dec!(20000), dec!(20050));
        let short = close_delta(PositionSide::Short, qty, dec!(20000), dec!(19970));
        assert_eq!(long, dec!(50));
        assert_eq!(short, dec!(30));
        assert!(long + short >= Decimal::ZERO);
    }

    #[test]
    fn adverse_move_keeps_the_watch_open() {
        let qty = dec!(2);
        let long = close_delta(PositionSide::Long, qty, dec!(100), dec!(99));
        let short = close_delta(PositionSide::Short, qty, dec!(100), dec!(102));
        assert_eq!(long, dec!(-2));
        assert_eq!(short, dec!(-4));
        assert!(long + short < Decimal::ZERO);
    }

    #[test]
    fn rejected_slot_detection() {
        assert!(is_rejected_slot(&None));
        let rejected = Order::rejected("BTCUSDT", Decimal::ZERO);
        assert!(is_rejected_slot(&Some(rejected)));
        let live = Order {
            order_id: "1".into(),
            client_order_id: "c".into(),
            symbol: "BTCUSDT".into(),
            price: dec!(100),
            status: crate::models::OrderStatus::Filled,
        };
        assert!(!is_rejected_slot(&Some(live)));
    }
}

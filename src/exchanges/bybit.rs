//! Bybit USDT-perpetual adapter (contract v3 dialect).
//!
//! REST dialect: the signature prehash is
//! `timestamp + api_key + recv_window + <encoded params>`, sent in the
//! `X-BAPI-*` header set. Responses wrap everything in a
//! `{retCode, retMsg, result}` envelope; `retCode != 0` is a venue
//! rejection even on HTTP 200.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::VenueCredentials;
use crate::models::{
    AssetBalance, Fill, IncomeKind, IncomeRecord, MarginMode, Order, OrderInfo, OrderRequest,
    OrderStatus, OrderType, Position, Side, TimeInForce,
};

use super::rest::{
    decimal_param, parse_decimal, response_error, send_with_retry, sign_payload, timestamp_ms,
    urlencode,
};
use super::session::SessionConfig;
use super::ws::bybit::BybitStreams;
use super::{StreamShared, Venue, VenueName};

const VENUE: &str = "ByBit";

/// Insufficient available balance for the requested order: maps to a
/// Rejected order like the other venue's margin refusal.
const INSUFFICIENT_BALANCE: i64 = 110_007;

pub struct Bybit {
    symbol: String,
    api_key: String,
    api_sec: String,
    recv_window: u64,
    base_url: String,
    ws_url: String,
    http: blocking::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ResultList<T> {
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceRow {
    coin: String,
    wallet_balance: String,
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreated {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRow {
    order_id: String,
    price: String,
    order_status: String,
    side: String,
    cum_exec_value: String,
    cum_exec_qty: String,
    cum_exec_fee: String,
    created_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosedPnlRow {
    symbol: String,
    order_id: String,
    side: String,
    order_price: String,
    qty: String,
    closed_pnl: String,
    cum_exec_fee: String,
    created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRow {
    entry_price: String,
    position_value: String,
    cum_realised_pnl: String,
    mark_price: String,
    liq_price: String,
    leverage: String,
    trade_mode: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionRow {
    exec_type: String,
    exec_fee: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentRow {
    lot_size_filter: LotSizeFilter,
    leverage_filter: LeverageFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    qty_step: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeverageFilter {
    max_leverage: String,
    leverage_step: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerRow {
    funding_rate: String,
}

fn side_param(side: Side) -> &'static str {
    match side {
        Side::Buy => "Buy",
        Side::Sell => "Sell",
    }
}

fn order_type_param(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Limit => "Limit",
        OrderType::Market => "Market",
    }
}

fn tif_param(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Gtc => "GoodTillCancel",
        TimeInForce::Ioc => "ImmediateOrCancel",
        TimeInForce::Fok => "FillOrKill",
        TimeInForce::Gtx => "PostOnly",
    }
}

fn side_from(raw: &str) -> Result<Side> {
    match raw {
        "Buy" | "BUY" => Ok(Side::Buy),
        "Sell" | "SELL" => Ok(Side::Sell),
        other => bail!("unknown {VENUE} side {other:?}"),
    }
}

fn parse_ms(raw: &str) -> i64 {
    raw.parse().unwrap_or_default()
}

impl Bybit {
    pub fn new(symbol: &str, creds: &VenueCredentials) -> Result<Bybit> {
        Ok(Bybit {
            symbol: symbol.to_string(),
            api_key: creds.api_key.clone(),
            api_sec: creds.api_sec.clone(),
            recv_window: creds.recv_window,
            base_url: creds.base_url.clone(),
            ws_url: creds.websockets_base_url.clone(),
            http: blocking::Client::builder()
                .build()
                .context("build http client")?,
        })
    }

    fn signed_builder(
        &self,
        builder: blocking::RequestBuilder,
        payload: &str,
    ) -> Result<blocking::RequestBuilder> {
        let ts = timestamp_ms();
        let prehash = format!("{ts}{}{}{payload}", self.api_key, self.recv_window);
        let signature = sign_payload(&self.api_sec, &prehash)?;
        Ok(builder
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string())
            .header("X-BAPI-SIGN", signature))
    }

    fn signed_get(&self, path: &str, params: &[(&str, String)]) -> Result<blocking::Response> {
        send_with_retry(VENUE, || {
            let query = urlencode(params);
            let builder = self
                .http
                .get(format!("{}{}?{}", self.base_url, path, query));
            self.signed_builder(builder, &query)
        })
    }

    fn signed_post(&self, path: &str, params: &[(&str, String)]) -> Result<blocking::Response> {
        send_with_retry(VENUE, || {
            let body = urlencode(params);
            let builder = self
                .http
                .post(format!("{}{}", self.base_url, path))
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body.clone());
            self.signed_builder(builder, &body)
        })
    }

    fn public_get(&self, url: String) -> Result<blocking::Response> {
        send_with_retry(VENUE, || Ok(self.http.get(url.clone())))
    }

    /// Check both the HTTP status and the envelope retCode, then unwrap
    /// the result payload.
    fn unwrap_envelope<T: DeserializeOwned>(&self, response: blocking::Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let envelope: Envelope<T> = response.json().context("decode envelope")?;
        if envelope.ret_code != 0 {
            bail!(
                "{VENUE} request rejected: retCode={} retMsg={}",
                envelope.ret_code,
                envelope.ret_msg
            );
        }
        envelope
            .result
            .with_context(|| format!("{VENUE} envelope without result"))
    }

    fn instrument_info(&self) -> Result<InstrumentRow> {
        let response = self.public_get(format!(
            "{}/derivatives/v3/public/instruments-info?symbol={}&category=linear",
            self.base_url, self.symbol
        ))?;
        let mut result: ResultList<InstrumentRow> = self.unwrap_envelope(response)?;
        if result.list.is_empty() {
            bail!("{VENUE} knows no instrument {}", self.symbol);
        }
        Ok(result.list.remove(0))
    }

    fn order_list_head(&self, order_id: &str) -> Result<OrderRow> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("orderId", order_id.to_string()),
        ];
        let response = self.signed_get("/contract/v3/private/order/list", &params)?;
        let mut result: ResultList<OrderRow> = self.unwrap_envelope(response)?;
        if result.list.is_empty() {
            bail!("{VENUE} order {order_id} not found");
        }
        Ok(result.list.remove(0))
    }

    fn set_leverage(&self, leverage: Decimal) -> Result<()> {
        let lev = decimal_param(leverage);
        let params = [
            ("symbol", self.symbol.clone()),
            ("buyLeverage", lev.clone()),
            ("sellLeverage", lev),
        ];
        let response = self.signed_post("/contract/v3/private/position/set-leverage", &params)?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        // "leverage not modified" comes back as a non-zero retCode; both
        // outcomes leave the venue in the requested state.
        Ok(())
    }
}

impl Venue for Bybit {
    fn name(&self) -> VenueName {
        VenueName::Bybit
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn get_multiplier(&self) -> Result<Decimal> {
        parse_decimal(&self.instrument_info()?.lot_size_filter.qty_step)
    }

    fn get_balances(&self) -> Result<HashMap<String, AssetBalance>> {
        let response = self.signed_get("/contract/v3/private/account/wallet/balance", &[])?;
        let result: ResultList<BalanceRow> = self.unwrap_envelope(response)?;
        let mut balances = HashMap::new();
        for row in result.list {
            balances.insert(
                row.coin,
                AssetBalance {
                    balance: parse_decimal(&row.wallet_balance)?,
                    available: parse_decimal(&row.available_balance)?,
                },
            );
        }
        Ok(balances)
    }

    fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        let mut params = vec![
            ("symbol", self.symbol.clone()),
            ("side", side_param(request.side).to_string()),
            ("orderType", order_type_param(request.order_type).to_string()),
            ("qty", decimal_param(request.qty)),
            ("timeInForce", tif_param(request.time_in_force).to_string()),
        ];
        if let Some(price) = request.price {
            params.push(("price", decimal_param(price)));
        }
        if let Some(stop) = request.stop_price {
            params.push(("stopPrice", decimal_param(stop)));
        }
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let response = self.signed_post("/contract/v3/private/order/create", &params)?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let envelope: Envelope<OrderCreated> = response.json().context("decode order create")?;
        if envelope.ret_code == INSUFFICIENT_BALANCE {
            return Ok(Order::rejected(
                &self.symbol,
                request.price.unwrap_or_default(),
            ));
        }
        if envelope.ret_code != 0 {
            bail!(
                "{VENUE} order placement rejected: retCode={} retMsg={}",
                envelope.ret_code,
                envelope.ret_msg
            );
        }
        let created = envelope
            .result
            .with_context(|| format!("{VENUE} order create without result"))?;
        let order = Order {
            order_id: created.order_id.clone(),
            client_order_id: created.order_id,
            symbol: self.symbol.clone(),
            price: request.price.unwrap_or_default(),
            status: OrderStatus::New,
        };
        self.get_order_status(&order)
    }

    fn get_order_status(&self, order: &Order) -> Result<Order> {
        let row = self.order_list_head(&order.order_id)?;
        Ok(Order {
            order_id: row.order_id.clone(),
            client_order_id: row.order_id,
            symbol: self.symbol.clone(),
            price: parse_decimal(&row.price)?,
            status: OrderStatus::from_venue(&row.order_status)?,
        })
    }

    fn get_order_info(&self, order: &Order) -> Result<OrderInfo> {
        let row = self.order_list_head(&order.order_id)?;
        let status = OrderStatus::from_venue(&row.order_status)?;

        let (avg_order_price, fee, quote_qty, qty) =
            if matches!(status, OrderStatus::Rejected | OrderStatus::Cancelled) {
                (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
            } else {
                let quote = parse_decimal(&row.cum_exec_value)?;
                let base = parse_decimal(&row.cum_exec_qty)?;
                let avg = if base.is_zero() {
                    Decimal::ZERO
                } else {
                    quote / base
                };
                (avg, parse_decimal(&row.cum_exec_fee)?, quote, base)
            };

        Ok(OrderInfo {
            order: Order {
                order_id: row.order_id.clone(),
                client_order_id: row.order_id.clone(),
                symbol: self.symbol.clone(),
                price: parse_decimal(&row.price)?,
                status,
            },
            side: side_from(&row.side)?,
            position_side: None,
            avg_order_price,
            quote_qty,
            qty,
            fee,
            order_time: DateTime::<Utc>::from_timestamp_millis(parse_ms(&row.created_time))
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        })
    }

    fn get_fills(&self, start_ms: i64, end_ms: i64) -> Result<Vec<Fill>> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("limit", "200".to_string()),
        ];
        let response = self.signed_get("/contract/v3/private/position/closed-pnl", &params)?;
        let result: ResultList<ClosedPnlRow> = self.unwrap_envelope(response)?;
        result
            .list
            .into_iter()
            .map(|row| {
                let price = parse_decimal(&row.order_price)?;
                let qty = parse_decimal(&row.qty)?;
                Ok(Fill {
                    symbol: row.symbol,
                    trade_id: row.order_id.clone(),
                    order_id: row.order_id,
                    side: side_from(&row.side)?,
                    price,
                    qty,
                    quote_qty: qty * price,
                    commission: parse_decimal(&row.cum_exec_fee)?,
                    commission_asset: String::new(),
                    realized_pnl: parse_decimal(&row.closed_pnl)?,
                    margin_asset: "USDT".to_string(),
                    time_ms: parse_ms(&row.created_at),
                    position_side: None,
                    maker: None,
                })
            })
            .collect()
    }

    fn get_positions(&self) -> Result<Vec<Position>> {
        let params = [("symbol", self.symbol.clone())];
        let response = self.signed_get("/contract/v3/private/position/list", &params)?;
        let result: ResultList<PositionRow> = self.unwrap_envelope(response)?;
        result
            .list
            .into_iter()
            .map(|row| {
                Ok(Position {
                    entry_price: parse_decimal(&row.entry_price)?,
                    position_value: parse_decimal(&row.position_value)?,
                    cum_pnl: parse_decimal(&row.cum_realised_pnl)?,
                    mark_price: parse_decimal(&row.mark_price)?,
                    liquidation_price: parse_decimal(&row.liq_price)?,
                    leverage: parse_decimal(&row.leverage)?,
                    margin_mode: if row.trade_mode == 0 {
                        MarginMode::Cross
                    } else {
                        MarginMode::Isolated
                    },
                })
            })
            .collect()
    }

    fn get_income_history(
        &self,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<IncomeRecord>> {
        let mut params = vec![
            ("symbol", self.symbol.clone()),
            ("limit", "100".to_string()),
        ];
        if let (Some(start), Some(end)) = (start_ms, end_ms) {
            params.push(("startTime", start.to_string()));
            params.push(("endTime", end.to_string()));
        }
        let response = self.signed_get("/contract/v3/private/position/closed-pnl", &params)?;
        let result: ResultList<ClosedPnlRow> = self.unwrap_envelope(response)?;
        result
            .list
            .into_iter()
            .map(|row| {
                Ok(IncomeRecord {
                    symbol: row.symbol,
                    kind: IncomeKind::Pnl,
                    income: parse_decimal(&row.closed_pnl)?,
                    asset: "USDT".to_string(),
                    time_ms: parse_ms(&row.created_at),
                })
            })
            .collect()
    }

    /// The realized-pnl listing does not itemize funding; the execution
    /// list does, as `execType == "Funding"` rows.
    fn get_income_funding_fee(&self, start_ms: i64, end_ms: i64) -> Result<Decimal> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("limit", "100".to_string()),
        ];
        let response = self.signed_get("/contract/v3/private/execution/list", &params)?;
        let result: ResultList<ExecutionRow> = self.unwrap_envelope(response)?;
        let mut funding = Decimal::ZERO;
        for row in result.list {
            if row.exec_type == "Funding" {
                funding += parse_decimal(&row.exec_fee)?;
            }
        }
        Ok(funding)
    }

    fn get_max_leverage_for_usdt_amount(
        &self,
        _usdt_amount: Decimal,
    ) -> Result<(Decimal, Decimal)> {
        // No per-notional brackets on this venue: the instrument carries a
        // flat leverage cap and step.
        let info = self.instrument_info()?;
        Ok((
            parse_decimal(&info.leverage_filter.max_leverage)?,
            parse_decimal(&info.leverage_filter.leverage_step)?,
        ))
    }

    fn cancel_order(&self, order: &Order) -> Result<bool> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("orderId", order.order_id.clone()),
        ];
        let response = self.signed_post("/contract/v3/private/order/cancel", &params)?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        Ok(true)
    }

    fn get_funding_rate(&self) -> Result<Decimal> {
        let response = self.public_get(format!(
            "{}/derivatives/v3/public/tickers?category=linear&symbol={}",
            self.base_url, self.symbol
        ))?;
        let result: ResultList<TickerRow> = self.unwrap_envelope(response)?;
        let row = result
            .list
            .first()
            .with_context(|| format!("{VENUE} ticker for {} missing", self.symbol))?;
        Ok(parse_decimal(&row.funding_rate)? * Decimal::ONE_HUNDRED)
    }

    fn set_margin_type_and_leverage(&self, mode: MarginMode, leverage: Decimal) -> Result<bool> {
        self.set_leverage(leverage)?;

        let lev = decimal_param(leverage);
        let trade_mode = match mode {
            MarginMode::Isolated => "1",
            MarginMode::Cross => "0",
        };
        let params = [
            ("symbol", self.symbol.clone()),
            ("tradeMode", trade_mode.to_string()),
            ("buyLeverage", lev.clone()),
            ("sellLeverage", lev),
        ];
        let response =
            self.signed_post("/contract/v3/private/position/switch-isolated", &params)?;
        if !response.status().is_success() {
            let body = response.text().unwrap_or_default();
            if body.contains("No need to change margin type") {
                return Ok(true);
            }
            bail!("{VENUE} margin type change failed: {body}");
        }
        let envelope: Envelope<serde_json::Value> =
            response.json().context("decode switch-isolated")?;
        // 110026: margin mode is already the requested one.
        if envelope.ret_code != 0 && envelope.ret_code != 110_026 {
            bail!(
                "{VENUE} margin type change rejected: retCode={} retMsg={}",
                envelope.ret_code,
                envelope.ret_msg
            );
        }
        Ok(true)
    }

    fn start_streams(&self, shared: &StreamShared) -> Result<()> {
        BybitStreams {
            symbol: self.symbol.clone(),
            api_key: self.api_key.clone(),
            api_sec: self.api_sec.clone(),
            ws_url: self.ws_url.clone(),
            shared: shared.clone(),
            config: SessionConfig::from_env(),
        }
        .spawn();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_string_translation() {
        assert_eq!(side_param(Side::Buy), "Buy");
        assert_eq!(order_type_param(OrderType::Limit), "Limit");
        assert_eq!(tif_param(TimeInForce::Fok), "FillOrKill");
        assert_eq!(side_from("Sell").unwrap(), Side::Sell);
        assert!(side_from("Hold").is_err());
    }

    #[test]
    fn envelope_rejection_is_detected() {
        let raw = r#"{"retCode":110007,"retMsg":"insufficient balance","result":{"orderId":"x"}}"#;
        let envelope: Envelope<OrderCreated> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.ret_code, INSUFFICIENT_BALANCE);
    }
}

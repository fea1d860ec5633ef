//! Binance USDⓈ-M futures adapter.
//!
//! REST dialect: every private call is a query string (or form body)
//! signed with HMAC-SHA256 over the encoded parameters, the digest
//! appended as `signature` and the key sent in `X-MBX-APIKEY`.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::VenueCredentials;
use crate::models::{
    AssetBalance, Fill, IncomeKind, IncomeRecord, MarginMode, Order, OrderInfo, OrderRequest,
    OrderStatus, OrderType, Position, PositionSide, Side, TimeInForce,
};

use super::rest::{
    decimal_param, parse_decimal, response_error, send_with_retry, sign_payload, timestamp_ms,
    urlencode,
};
use super::session::SessionConfig;
use super::ws::binance::BinanceStream;
use super::{StreamShared, Venue, VenueName};

const VENUE: &str = "Binance";

/// Code the venue answers with when it refuses the order itself rather
/// than the request (cannot be margined/filled). Maps to a Rejected order
/// so the coordinator can roll back instead of failing the trade.
const ORDER_REJECT_CODE: i64 = -5021;

pub struct Binance {
    symbol: String,
    api_key: String,
    api_sec: String,
    recv_window: u64,
    base_url: String,
    ws_url: String,
    http: blocking::Client,
}

#[derive(Debug, Deserialize)]
struct VenueError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceRow {
    asset: String,
    balance: String,
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: i64,
    client_order_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRow {
    order_id: i64,
    client_order_id: String,
    price: String,
    status: String,
    #[serde(default)]
    time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillRow {
    symbol: String,
    id: i64,
    order_id: i64,
    side: String,
    price: String,
    qty: String,
    quote_qty: String,
    commission: String,
    commission_asset: String,
    realized_pnl: String,
    margin_asset: String,
    time: i64,
    position_side: String,
    maker: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRow {
    entry_price: String,
    position_amt: String,
    un_realized_profit: String,
    mark_price: String,
    liquidation_price: String,
    leverage: String,
    margin_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomeRow {
    symbol: String,
    income_type: String,
    income: String,
    asset: String,
    time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    last_funding_rate: String,
}

fn side_param(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn order_type_param(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Limit => "LIMIT",
        OrderType::Market => "MARKET",
    }
}

fn tif_param(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
        TimeInForce::Fok => "FOK",
        TimeInForce::Gtx => "GTX",
    }
}

fn margin_param(mode: MarginMode) -> &'static str {
    match mode {
        MarginMode::Isolated => "ISOLATED",
        MarginMode::Cross => "CROSSED",
    }
}

fn position_side_from(raw: &str) -> Option<PositionSide> {
    match raw {
        "LONG" => Some(PositionSide::Long),
        "SHORT" => Some(PositionSide::Short),
        _ => None,
    }
}

fn side_from(raw: &str) -> Result<Side> {
    match raw {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => bail!("unknown {VENUE} side {other:?}"),
    }
}

/// First bracket whose notional cap strictly exceeds
/// `usdt_amount * initial_leverage`; brackets arrive highest-leverage
/// first. The venue has no sub-integer leverage steps.
fn pick_bracket(brackets: &[Value], usdt_amount: Decimal) -> Option<(Decimal, Decimal)> {
    for bracket in brackets {
        let initial = bracket.get("initialLeverage")?.as_u64()?;
        let cap = bracket.get("notionalCap")?.as_u64()?;
        if usdt_amount * Decimal::from(initial) < Decimal::from(cap) {
            return Some((Decimal::from(initial), Decimal::ONE));
        }
    }
    None
}

impl Binance {
    pub fn new(symbol: &str, creds: &VenueCredentials) -> Result<Binance> {
        Ok(Binance {
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

    fn signed_query(&self, mut params: Vec<(&str, String)>) -> Result<String> {
        params.push(("timestamp", timestamp_ms().to_string()));
        params.push(("recvWindow", self.recv_window.to_string()));
        let query = urlencode(&params);
        let signature = sign_payload(&self.api_sec, &query)?;
        Ok(format!("{query}&signature={signature}"))
    }

    fn signed_get(&self, path: &str, params: &[(&str, String)]) -> Result<blocking::Response> {
        send_with_retry(VENUE, || {
            let query = self.signed_query(params.to_vec())?;
            Ok(self
                .http
                .get(format!("{}{}?{}", self.base_url, path, query))
                .header("X-MBX-APIKEY", &self.api_key))
        })
    }

    fn signed_form(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<blocking::Response> {
        send_with_retry(VENUE, || {
            let body = self.signed_query(params.to_vec())?;
            Ok(self
                .http
                .request(method.clone(), format!("{}{}", self.base_url, path))
                .header("X-MBX-APIKEY", &self.api_key)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body))
        })
    }

    fn public_get(&self, url: String) -> Result<blocking::Response> {
        send_with_retry(VENUE, || Ok(self.http.get(url.clone())))
    }

    fn order_row(&self, order_id: &str) -> Result<blocking::Response> {
        self.signed_get(
            "/fapi/v1/order",
            &[
                ("symbol", self.symbol.clone()),
                ("orderId", order_id.to_string()),
            ],
        )
    }
}

impl Venue for Binance {
    fn name(&self) -> VenueName {
        VenueName::Binance
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn get_multiplier(&self) -> Result<Decimal> {
        let response = self.public_get(format!("{}/fapi/v1/exchangeInfo", self.base_url))?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let info: Value = response.json().context("decode exchangeInfo")?;
        let symbols = info
            .get("symbols")
            .and_then(Value::as_array)
            .context("exchangeInfo without symbols")?;
        for entry in symbols {
            if entry.get("symbol").and_then(Value::as_str) != Some(self.symbol.as_str()) {
                continue;
            }
            let filters = entry
                .get("filters")
                .and_then(Value::as_array)
                .context("symbol without filters")?;
            for filter in filters {
                if filter.get("filterType").and_then(Value::as_str) == Some("LOT_SIZE") {
                    let step = filter
                        .get("stepSize")
                        .and_then(Value::as_str)
                        .context("LOT_SIZE without stepSize")?;
                    return parse_decimal(step);
                }
            }
        }
        bail!("{VENUE} exchangeInfo has no LOT_SIZE for {}", self.symbol)
    }

    fn get_balances(&self) -> Result<HashMap<String, AssetBalance>> {
        let response = self.signed_get("/fapi/v2/balance", &[])?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let rows: Vec<BalanceRow> = response.json().context("decode balances")?;
        let mut balances = HashMap::new();
        for row in rows {
            balances.insert(
                row.asset,
                AssetBalance {
                    balance: parse_decimal(&row.balance)?,
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
            ("type", order_type_param(request.order_type).to_string()),
            ("quantity", decimal_param(request.qty)),
            ("newClientOrderId", Uuid::new_v4().to_string()),
            ("reduceOnly", request.reduce_only.to_string()),
        ];
        if request.order_type != OrderType::Market {
            if let Some(price) = request.price {
                params.push(("price", decimal_param(price)));
            }
            params.push((
                "timeInForce",
                tif_param(request.time_in_force).to_string(),
            ));
        }
        if let Some(stop) = request.stop_price {
            params.push(("stopPrice", decimal_param(stop)));
        }
        if request.close_position {
            params.push(("closePosition", "true".to_string()));
        }

        let response = self.signed_form(Method::POST, "/fapi/v1/order", &params)?;
        if !response.status().is_success() {
            let body = response.text().unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<VenueError>(&body) {
                if err.code == ORDER_REJECT_CODE {
                    return Ok(Order::rejected(
                        &self.symbol,
                        request.price.unwrap_or_default(),
                    ));
                }
            }
            bail!("{VENUE} order placement failed: {body}");
        }

        let ack: OrderAck = response.json().context("decode order ack")?;
        let order = Order {
            order_id: ack.order_id.to_string(),
            client_order_id: ack.client_order_id,
            symbol: self.symbol.clone(),
            price: request.price.unwrap_or_default(),
            status: OrderStatus::from_venue(&ack.status)?,
        };
        self.get_order_status(&order)
    }

    fn get_order_status(&self, order: &Order) -> Result<Order> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("orderId", order.order_id.clone()),
        ];
        let response = self.signed_get("/fapi/v1/openOrder", &params)?;
        if response.status().is_success() {
            let row: OrderRow = response.json().context("decode open order")?;
            return Ok(Order {
                order_id: row.order_id.to_string(),
                client_order_id: row.client_order_id,
                symbol: self.symbol.clone(),
                price: parse_decimal(&row.price)?,
                status: OrderStatus::from_venue(&row.status)?,
            });
        }

        // Filled orders fall out of the open-orders endpoint; the
        // historical endpoint still knows them.
        let open_body = response.text().unwrap_or_default();
        let not_found = serde_json::from_str::<VenueError>(&open_body)
            .map(|e| e.msg == "Order does not exist.")
            .unwrap_or(false);
        if !not_found {
            bail!("{VENUE} order status failed: {open_body}");
        }

        let fallback = self.order_row(&order.order_id)?;
        if !fallback.status().is_success() {
            let body = fallback.text().unwrap_or_default();
            bail!("{VENUE} order status failed: {open_body}\n{body}");
        }
        let row: OrderRow = fallback.json().context("decode order")?;
        let mut updated = order.clone();
        updated.status = OrderStatus::from_venue(&row.status)?;
        Ok(updated)
    }

    fn get_order_info(&self, order: &Order) -> Result<OrderInfo> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("orderId", order.order_id.clone()),
        ];
        let response = self.signed_get("/fapi/v1/userTrades", &params)?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let fills: Vec<FillRow> = response.json().context("decode order fills")?;

        let detail = self.order_row(&order.order_id)?;
        if !detail.status().is_success() {
            return Err(response_error(VENUE, detail));
        }
        let row: OrderRow = detail.json().context("decode order")?;
        let order_time = DateTime::<Utc>::from_timestamp_millis(row.time)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let mut fee = Decimal::ZERO;
        let mut quote_qty = Decimal::ZERO;
        let mut qty = Decimal::ZERO;
        let mut side = Side::Buy;
        let mut position_side = None;
        for fill in &fills {
            quote_qty += parse_decimal(&fill.quote_qty)?;
            fee += parse_decimal(&fill.commission)?;
            qty += parse_decimal(&fill.qty)?;
            side = side_from(&fill.side)?;
            position_side = position_side_from(&fill.position_side);
        }
        let avg_order_price = if qty.is_zero() {
            Decimal::ZERO
        } else {
            quote_qty / qty
        };

        Ok(OrderInfo {
            order: order.clone(),
            side,
            position_side,
            avg_order_price,
            quote_qty,
            qty,
            fee,
            order_time,
        })
    }

    fn get_fills(&self, start_ms: i64, end_ms: i64) -> Result<Vec<Fill>> {
        let params = [
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("symbol", self.symbol.clone()),
        ];
        let response = self.signed_get("/fapi/v1/userTrades", &params)?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let rows: Vec<FillRow> = response.json().context("decode fills")?;
        rows.into_iter()
            .map(|row| {
                Ok(Fill {
                    symbol: row.symbol,
                    trade_id: row.id.to_string(),
                    order_id: row.order_id.to_string(),
                    side: side_from(&row.side)?,
                    price: parse_decimal(&row.price)?,
                    qty: parse_decimal(&row.qty)?,
                    quote_qty: parse_decimal(&row.quote_qty)?,
                    commission: parse_decimal(&row.commission)?,
                    commission_asset: row.commission_asset,
                    realized_pnl: parse_decimal(&row.realized_pnl)?,
                    margin_asset: row.margin_asset,
                    time_ms: row.time,
                    position_side: position_side_from(&row.position_side),
                    maker: Some(row.maker),
                })
            })
            .collect()
    }

    fn get_positions(&self) -> Result<Vec<Position>> {
        let params = [("symbol", self.symbol.clone())];
        let response = self.signed_get("/fapi/v2/positionRisk", &params)?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let rows: Vec<PositionRow> = response.json().context("decode positions")?;
        rows.into_iter()
            .map(|row| {
                Ok(Position {
                    entry_price: parse_decimal(&row.entry_price)?,
                    position_value: parse_decimal(&row.position_amt)?,
                    cum_pnl: parse_decimal(&row.un_realized_profit)?,
                    mark_price: parse_decimal(&row.mark_price)?,
                    liquidation_price: parse_decimal(&row.liquidation_price)?,
                    leverage: parse_decimal(&row.leverage)?,
                    margin_mode: if row.margin_type.eq_ignore_ascii_case("isolated") {
                        MarginMode::Isolated
                    } else {
                        MarginMode::Cross
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
        let mut params = vec![("symbol", self.symbol.clone())];
        if let (Some(start), Some(end)) = (start_ms, end_ms) {
            params.push(("startTime", start.to_string()));
            params.push(("endTime", end.to_string()));
        }
        let response = self.signed_get("/fapi/v1/income", &params)?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let rows: Vec<IncomeRow> = response.json().context("decode income")?;
        rows.into_iter()
            .map(|row| {
                Ok(IncomeRecord {
                    symbol: row.symbol,
                    kind: IncomeKind::from_venue(&row.income_type),
                    income: parse_decimal(&row.income)?,
                    asset: row.asset,
                    time_ms: row.time,
                })
            })
            .collect()
    }

    fn get_max_leverage_for_usdt_amount(&self, usdt_amount: Decimal) -> Result<(Decimal, Decimal)> {
        let params = [("symbol", self.symbol.clone())];
        let response = self.signed_get("/fapi/v1/leverageBracket", &params)?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let body: Value = response.json().context("decode leverage brackets")?;
        let brackets = body
            .get(0)
            .and_then(|entry| entry.get("brackets"))
            .and_then(Value::as_array)
            .context("leverageBracket without brackets")?;
        pick_bracket(brackets, usdt_amount)
            .with_context(|| format!("{VENUE} has no bracket for notional {usdt_amount}"))
    }

    fn cancel_order(&self, order: &Order) -> Result<bool> {
        let params = [
            ("symbol", self.symbol.clone()),
            ("orderId", order.order_id.clone()),
        ];
        let response = self.signed_form(Method::DELETE, "/fapi/v1/order", &params)?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        Ok(true)
    }

    fn get_funding_rate(&self) -> Result<Decimal> {
        let response = self.public_get(format!(
            "{}/fapi/v1/premiumIndex?symbol={}",
            self.base_url, self.symbol
        ))?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let index: PremiumIndex = response.json().context("decode premiumIndex")?;
        Ok(parse_decimal(&index.last_funding_rate)? * Decimal::ONE_HUNDRED)
    }

    fn set_margin_type_and_leverage(&self, mode: MarginMode, leverage: Decimal) -> Result<bool> {
        let params = [
            ("leverage", decimal_param(leverage)),
            ("symbol", self.symbol.clone()),
        ];
        let response = self.signed_form(Method::POST, "/fapi/v1/leverage", &params)?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }

        let params = [
            ("marginType", margin_param(mode).to_string()),
            ("symbol", self.symbol.clone()),
        ];
        let response = self.signed_form(Method::POST, "/fapi/v1/marginType", &params)?;
        if !response.status().is_success() {
            let body = response.text().unwrap_or_default();
            let already_set = serde_json::from_str::<VenueError>(&body)
                .map(|e| e.msg == "No need to change margin type.")
                .unwrap_or(false);
            if already_set {
                return Ok(true);
            }
            bail!("{VENUE} margin type change failed: {body}");
        }
        Ok(true)
    }

    fn start_streams(&self, shared: &StreamShared) -> Result<()> {
        BinanceStream {
            symbol: self.symbol.clone(),
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            ws_url: self.ws_url.clone(),
            shared: shared.clone(),
            config: SessionConfig::from_env(),
        }
        .spawn();
        Ok(())
    }
}

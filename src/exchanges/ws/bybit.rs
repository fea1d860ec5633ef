//! Bybit streaming sessions: a public socket (typed snapshot/delta book
//! messages plus the tickers funding feed) and a private socket
//! authenticated with an inline signed frame. Both require a JSON ping
//! every 20 seconds or the venue drops them.

use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::book::{BookLevel, BookSide};
use crate::exchanges::rest::{sign_payload, timestamp_ms};
use crate::exchanges::session::{Backoff, SessionConfig, SessionState};
use crate::exchanges::StreamShared;
use crate::models::AssetBalance;

const VENUE: &str = "ByBit";

const PING_FRAME: &str = r#"{"req_id":"100001","op":"ping"}"#;

fn parse_level_rows(rows: Option<&Value>) -> Result<Vec<BookLevel>> {
    let Some(rows) = rows.and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    rows.iter()
        .map(|row| {
            let price = row
                .get(0)
                .and_then(Value::as_str)
                .context("book level without price")?;
            let qty = row
                .get(1)
                .and_then(Value::as_str)
                .context("book level without qty")?;
            Ok((price.parse::<Decimal>()?, qty.parse::<Decimal>()?))
        })
        .collect()
}

/// Spawns both Bybit sessions for one symbol.
pub struct BybitStreams {
    pub symbol: String,
    pub api_key: String,
    pub api_sec: String,
    pub ws_url: String,
    pub shared: StreamShared,
    pub config: SessionConfig,
}

impl BybitStreams {
    pub fn spawn(self) {
        let public = PublicStream {
            symbol: self.symbol.clone(),
            ws_url: self.ws_url.clone(),
            shared: self.shared.clone(),
            config: self.config.clone(),
        };
        thread::Builder::new()
            .name(format!("bybit-public-{}", self.symbol.to_lowercase()))
            .spawn(move || public.run_loop())
            .expect("failed to spawn stream thread");

        let private = PrivateStream {
            symbol: self.symbol.clone(),
            api_key: self.api_key,
            api_sec: self.api_sec,
            ws_url: self.ws_url,
            shared: self.shared,
            config: self.config,
        };
        thread::Builder::new()
            .name(format!("bybit-private-{}", self.symbol.to_lowercase()))
            .spawn(move || private.run_loop())
            .expect("failed to spawn stream thread");
    }
}

struct PublicStream {
    symbol: String,
    ws_url: String,
    shared: StreamShared,
    config: SessionConfig,
}

impl PublicStream {
    fn run_loop(self) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to create stream runtime");
        let mut backoff = Backoff::new(&self.config);
        loop {
            info!(
                venue = VENUE,
                symbol = %self.symbol,
                state = %SessionState::Connecting,
                "session_transition"
            );
            if let Err(e) = rt.block_on(self.run_connection(&mut backoff)) {
                warn!(
                    venue = VENUE,
                    symbol = %self.symbol,
                    error = %e,
                    state = %SessionState::Reconnecting,
                    "session_transition"
                );
                self.shared.clear();
                thread::sleep(backoff.next_backoff());
            }
        }
    }

    async fn run_connection(&self, backoff: &mut Backoff) -> Result<()> {
        let url = format!("{}/contract/usdt/public/v3", self.ws_url);
        let (ws, _) = tokio::time::timeout(self.config.connect_timeout(), connect_async(&url))
            .await
            .context("connect timeout")?
            .context("websocket connect")?;
        let (mut write, mut read) = ws.split();

        let subscribe = json!({
            "op": "subscribe",
            "args": [format!("orderbook.50.{}", self.symbol)],
            "req_id": "depthsub",
        });
        write.send(Message::Text(subscribe.to_string())).await?;
        let subscribe = json!({
            "op": "subscribe",
            "args": [format!("tickers.{}", self.symbol)],
            "req_id": "tickersub",
        });
        write.send(Message::Text(subscribe.to_string())).await?;
        info!(
            venue = VENUE,
            symbol = %self.symbol,
            state = %SessionState::Subscribed,
            "session_transition"
        );

        let mut ping = tokio::time::interval(Duration::from_secs(
            self.config.keepalive_interval_secs,
        ));
        ping.tick().await;
        let mut streaming = false;

        loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_message(&text)?;
                            if !streaming {
                                streaming = true;
                                backoff.reset();
                                info!(
                                    venue = VENUE,
                                    symbol = %self.symbol,
                                    state = %SessionState::Streaming,
                                    "session_transition"
                                );
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            write.send(Message::Pong(payload)).await.ok();
                        }
                        Some(Ok(Message::Close(frame))) => bail!("server closed stream: {frame:?}"),
                        Some(Err(e)) => return Err(e).context("websocket read"),
                        None => bail!("stream ended"),
                        _ => {}
                    }
                }
                _ = ping.tick() => {
                    write.send(Message::Text(PING_FRAME.to_string())).await?;
                }
            }
        }
    }

    fn handle_message(&self, text: &str) -> Result<()> {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return Ok(());
        };
        let Some(topic) = frame.get("topic").and_then(Value::as_str) else {
            return Ok(());
        };

        if topic == format!("tickers.{}", self.symbol) {
            // Ticker deltas only carry the fields that changed.
            if let Some(raw) = frame
                .pointer("/data/fundingRate")
                .and_then(Value::as_str)
                .filter(|raw| !raw.is_empty())
            {
                if let Ok(rate) = raw.parse::<Decimal>() {
                    self.shared.book.lock().funding_rate = Some(rate * Decimal::ONE_HUNDRED);
                }
            }
            return Ok(());
        }

        if topic == format!("orderbook.50.{}", self.symbol) {
            match frame.get("type").and_then(Value::as_str) {
                Some("snapshot") => {
                    let bids = parse_level_rows(frame.pointer("/data/b"))?;
                    let asks = parse_level_rows(frame.pointer("/data/a"))?;
                    let mut book = self.shared.book.lock();
                    book.replace(bids, asks, None, timestamp_ms());
                }
                Some("delta") => {
                    let bids = parse_level_rows(frame.pointer("/data/b"))?;
                    let asks = parse_level_rows(frame.pointer("/data/a"))?;
                    let mut book = self.shared.book.lock();
                    for (price, qty) in bids {
                        book.manage_side(BookSide::Bids, price, qty);
                    }
                    for (price, qty) in asks {
                        book.manage_side(BookSide::Asks, price, qty);
                    }
                    book.timestamp_ms = timestamp_ms();
                }
                _ => {}
            }
        }
        Ok(())
    }
}

struct PrivateStream {
    symbol: String,
    api_key: String,
    api_sec: String,
    ws_url: String,
    shared: StreamShared,
    config: SessionConfig,
}

impl PrivateStream {
    fn run_loop(self) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to create stream runtime");
        let mut backoff = Backoff::new(&self.config);
        loop {
            info!(
                venue = VENUE,
                symbol = %self.symbol,
                stream = "private",
                state = %SessionState::Connecting,
                "session_transition"
            );
            if let Err(e) = rt.block_on(self.run_connection(&mut backoff)) {
                warn!(
                    venue = VENUE,
                    symbol = %self.symbol,
                    stream = "private",
                    error = %e,
                    state = %SessionState::Reconnecting,
                    "session_transition"
                );
                self.shared.clear();
                thread::sleep(backoff.next_backoff());
            }
        }
    }

    async fn run_connection(&self, backoff: &mut Backoff) -> Result<()> {
        let url = format!("{}/contract/private/v3", self.ws_url);
        let (ws, _) = tokio::time::timeout(self.config.connect_timeout(), connect_async(&url))
            .await
            .context("connect timeout")?
            .context("websocket connect")?;
        let (mut write, mut read) = ws.split();

        // Inline auth: signature over "GET/realtime{expires}".
        let expires = timestamp_ms() + 10_000;
        let signature = sign_payload(&self.api_sec, &format!("GET/realtime{expires}"))?;
        let auth = json!({
            "op": "auth",
            "args": [self.api_key.clone(), expires, signature],
        });
        write.send(Message::Text(auth.to_string())).await?;

        let subscribe = json!({
            "op": "subscribe",
            "args": [
                "user.wallet.contractAccount",
                "user.order.contractAccount",
                "user.execution.contractAccount",
                "user.position.contractAccount",
            ],
            "req_id": "udssub",
        });
        write.send(Message::Text(subscribe.to_string())).await?;
        info!(
            venue = VENUE,
            symbol = %self.symbol,
            stream = "private",
            state = %SessionState::Subscribed,
            "session_transition"
        );

        let mut ping = tokio::time::interval(Duration::from_secs(
            self.config.keepalive_interval_secs,
        ));
        ping.tick().await;
        let mut streaming = false;

        loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_message(&text);
                            if !streaming {
                                streaming = true;
                                backoff.reset();
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            write.send(Message::Pong(payload)).await.ok();
                        }
                        Some(Ok(Message::Close(frame))) => bail!("server closed stream: {frame:?}"),
                        Some(Err(e)) => return Err(e).context("websocket read"),
                        None => bail!("stream ended"),
                        _ => {}
                    }
                }
                _ = ping.tick() => {
                    write.send(Message::Text(PING_FRAME.to_string())).await?;
                }
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let Some(topic) = frame.get("topic").and_then(Value::as_str) else {
            return;
        };
        let rows = frame.get("data").and_then(Value::as_array);

        match topic {
            "user.execution.contractAccount" => {
                let mut reports = self.shared.reports.lock();
                reports.user_events.push(frame.clone());
                if let Some(rows) = rows {
                    for row in rows {
                        match row.get("execType").and_then(Value::as_str) {
                            Some("Funding") => reports.funding_collected = true,
                            Some("BustTrade") => reports.liquidated = true,
                            _ => {}
                        }
                    }
                }
            }
            "user.order.contractAccount" => {
                let mut reports = self.shared.reports.lock();
                reports.user_events.push(frame.clone());
                if let Some(rows) = rows {
                    for row in rows {
                        if let (Some(order_id), Some(status)) = (
                            row.get("orderId").and_then(Value::as_str),
                            row.get("orderStatus").and_then(Value::as_str),
                        ) {
                            reports
                                .order_statuses
                                .insert(order_id.to_string(), status.to_string());
                        }
                    }
                }
            }
            "user.wallet.contractAccount" => {
                if let Some(rows) = rows {
                    let mut balances = self.shared.balances.lock();
                    for row in rows {
                        let coin = row.get("coin").and_then(Value::as_str);
                        let wallet = row.get("walletBalance").and_then(Value::as_str);
                        let available = row.get("availableBalance").and_then(Value::as_str);
                        if let (Some(coin), Some(wallet), Some(available)) =
                            (coin, wallet, available)
                        {
                            if let (Ok(balance), Ok(available)) =
                                (wallet.parse::<Decimal>(), available.parse::<Decimal>())
                            {
                                balances.insert(
                                    coin.to_string(),
                                    AssetBalance { balance, available },
                                );
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn private_stream() -> PrivateStream {
        PrivateStream {
            symbol: "BTCUSDT".to_string(),
            api_key: "key".to_string(),
            api_sec: "secret".to_string(),
            ws_url: "wss://example".to_string(),
            shared: StreamShared::new("BTCUSDT"),
            config: SessionConfig::default(),
        }
    }

    #[test]
    fn funding_execution_raises_the_flag() {
        let stream = private_stream();
        let frame = json!({
            "topic": "user.execution.contractAccount",
            "data": [{"execType": "Funding", "execFee": "0.01"}],
        });
        stream.handle_message(&frame.to_string());
        assert!(stream.shared.funding_collected());
        assert!(!stream.shared.liquidated());
        assert_eq!(stream.shared.reports.lock().user_events.len(), 1);
    }

    #[test]
    fn bust_trade_marks_liquidation() {
        let stream = private_stream();
        let frame = json!({
            "topic": "user.execution.contractAccount",
            "data": [{"execType": "BustTrade"}],
        });
        stream.handle_message(&frame.to_string());
        assert!(stream.shared.liquidated());
    }

    #[test]
    fn wallet_rows_update_balances() {
        let stream = private_stream();
        let frame = json!({
            "topic": "user.wallet.contractAccount",
            "data": [{"coin": "USDT", "walletBalance": "1500.5", "availableBalance": "1200"}],
        });
        stream.handle_message(&frame.to_string());
        let balances = stream.shared.balances.lock();
        let usdt = balances.get("USDT").unwrap();
        assert_eq!(usdt.balance.to_string(), "1500.5");
        assert_eq!(usdt.available.to_string(), "1200");
    }

    #[test]
    fn level_rows_parse() {
        let rows = json!([["100.5", "2"], ["100.0", "0"]]);
        let levels = parse_level_rows(Some(&rows)).unwrap();
        assert_eq!(levels.len(), 2);
        assert!(levels[1].1.is_zero());
        assert!(parse_level_rows(None).unwrap().is_empty());
    }

    #[test]
    fn auth_prehash_matches_dialect() {
        // The signed payload is the literal "GET/realtime" + expires.
        let signature = sign_payload("secret", "GET/realtime1700000000000").unwrap();
        assert_eq!(signature.len(), 64);
    }
}

//! Binance streaming session: one combined socket carrying the depth diff
//! stream, the mark-price stream and the listen-key user-data stream.
//!
//! Depth synchronization (venue variant A): replay starts from a REST
//! snapshot; the first delta with `U <= lastUpdateId <= u` completes the
//! bootstrap, after which each delta must chain via `pu == lastUpdateId`.
//! Any gap discards the replica and re-snapshots.

use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::book::{BookLevel, BookSide, OrderBook};
use crate::exchanges::rest::timestamp_ms;
use crate::exchanges::session::{Backoff, SessionConfig, SessionState};
use crate::exchanges::StreamShared;
use crate::models::AssetBalance;

const VENUE: &str = "Binance";

/// Outcome of sequencing one depth delta against the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeltaOutcome {
    Apply,
    /// Delta predates the snapshot; drop it.
    Skip,
    /// Sequence gap; the replica must be rebuilt from a fresh snapshot.
    Resync,
}

/// Bootstrap state for the snapshot+delta reconciliation.
#[derive(Debug, Default)]
pub(crate) struct DepthSync {
    bootstrapped: bool,
}

impl DepthSync {
    pub(crate) fn reset(&mut self) {
        self.bootstrapped = false;
    }

    /// `replica_id` is the book's sequence number, `first`/`last` the
    /// delta's `U`/`u` span, `prev` the venue's pointer to the previous
    /// delta (`pu`).
    pub(crate) fn assess(
        &mut self,
        replica_id: u64,
        first: u64,
        last: u64,
        prev: u64,
    ) -> DeltaOutcome {
        if !self.bootstrapped {
            if first <= replica_id && replica_id <= last {
                self.bootstrapped = true;
                DeltaOutcome::Apply
            } else if first > replica_id {
                // Snapshot predates the live stream entirely.
                DeltaOutcome::Resync
            } else {
                DeltaOutcome::Skip
            }
        } else if prev == replica_id {
            DeltaOutcome::Apply
        } else {
            DeltaOutcome::Resync
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotPayload {
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyPayload {
    listen_key: String,
}

fn parse_levels(rows: &[[String; 2]]) -> Result<Vec<BookLevel>> {
    rows.iter()
        .map(|row| Ok((row[0].parse::<Decimal>()?, row[1].parse::<Decimal>()?)))
        .collect()
}

fn apply_delta_side(book: &mut OrderBook, side: BookSide, levels: Option<&Value>) -> Result<()> {
    let Some(rows) = levels.and_then(Value::as_array) else {
        return Ok(());
    };
    for row in rows {
        let price = row
            .get(0)
            .and_then(Value::as_str)
            .context("depth level without price")?;
        let qty = row
            .get(1)
            .and_then(Value::as_str)
            .context("depth level without qty")?;
        book.manage_side(side, price.parse()?, qty.parse()?);
    }
    Ok(())
}

pub struct BinanceStream {
    pub symbol: String,
    pub api_key: String,
    /// REST origin (snapshots, listen-key lifecycle).
    pub base_url: String,
    /// WebSocket origin.
    pub ws_url: String,
    pub shared: StreamShared,
    pub config: SessionConfig,
}

impl BinanceStream {
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(format!("binance-stream-{}", self.symbol.to_lowercase()))
            .spawn(move || self.run_loop())
            .expect("failed to spawn stream thread")
    }

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
                // Readers must never act on a book that stopped updating.
                self.shared.clear();
                thread::sleep(backoff.next_backoff());
            }
        }
    }

    async fn run_connection(&self, backoff: &mut Backoff) -> Result<()> {
        let http = reqwest::Client::new();
        let listen_key = self.create_listen_key(&http).await?;
        let sym = self.symbol.to_lowercase();
        let url = format!(
            "{}/stream?streams={}/{}@depth@100ms/{}@markPrice@1s",
            self.ws_url, listen_key, sym, sym
        );

        let (ws, _) = tokio::time::timeout(self.config.connect_timeout(), connect_async(&url))
            .await
            .context("connect timeout")?
            .context("websocket connect")?;
        info!(
            venue = VENUE,
            symbol = %self.symbol,
            state = %SessionState::Subscribed,
            "session_transition"
        );
        let (mut write, mut read) = ws.split();

        let mut renew = tokio::time::interval(Duration::from_secs(
            self.config.listen_key_refresh_secs,
        ));
        renew.tick().await; // the first tick fires immediately

        let mut sync = DepthSync::default();
        let mut streaming = false;

        loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_message(&text, &listen_key, &mut sync, &http).await?;
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
                _ = renew.tick() => {
                    // The key dies after ~30 minutes without renewal and the
                    // user-data stream dies with it.
                    if let Err(e) = self.keepalive_listen_key(&http, &listen_key).await {
                        warn!(venue = VENUE, symbol = %self.symbol, error = %e, "listen_key_renewal_failed");
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        text: &str,
        listen_key: &str,
        sync: &mut DepthSync,
        http: &reqwest::Client,
    ) -> Result<()> {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return Ok(());
        };
        let Some(stream) = frame.get("stream").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(data) = frame.get("data") else {
            return Ok(());
        };

        if stream == listen_key {
            self.handle_user_data(data);
            return Ok(());
        }

        match data.get("e").and_then(Value::as_str) {
            Some("markPriceUpdate") => {
                if let Some(raw) = data.get("r").and_then(Value::as_str) {
                    if let Ok(rate) = raw.parse::<Decimal>() {
                        self.shared.book.lock().funding_rate =
                            Some(rate * Decimal::ONE_HUNDRED);
                    }
                }
            }
            Some("depthUpdate") => self.handle_depth(data, sync, http).await?,
            _ => {}
        }
        Ok(())
    }

    fn handle_user_data(&self, data: &Value) {
        {
            let mut reports = self.shared.reports.lock();
            reports.user_events.push(data.clone());
            match data.get("e").and_then(Value::as_str) {
                Some("ACCOUNT_UPDATE") => {
                    if data.pointer("/a/m").and_then(Value::as_str) == Some("FUNDING_FEE") {
                        reports.funding_collected = true;
                    }
                }
                Some("MARGIN_CALL") => reports.liquidated = true,
                Some("ORDER_TRADE_UPDATE") => {
                    if let (Some(client_id), Some(status)) = (
                        data.pointer("/o/c").and_then(Value::as_str),
                        data.pointer("/o/X").and_then(Value::as_str),
                    ) {
                        reports
                            .order_statuses
                            .insert(client_id.to_string(), status.to_string());
                    }
                }
                _ => {}
            }
        }

        if let Some(rows) = data.pointer("/a/B").and_then(Value::as_array) {
            let mut balances = self.shared.balances.lock();
            for row in rows {
                let asset = row.get("a").and_then(Value::as_str);
                let wallet = row.get("wb").and_then(Value::as_str);
                let cross = row.get("cw").and_then(Value::as_str);
                if let (Some(asset), Some(wallet), Some(cross)) = (asset, wallet, cross) {
                    if let (Ok(balance), Ok(available)) =
                        (wallet.parse::<Decimal>(), cross.parse::<Decimal>())
                    {
                        balances.insert(asset.to_string(), AssetBalance { balance, available });
                    }
                }
            }
        }
    }

    async fn handle_depth(
        &self,
        data: &Value,
        sync: &mut DepthSync,
        http: &reqwest::Client,
    ) -> Result<()> {
        let replica_id = self.shared.book.lock().last_update_id;
        let replica_id = match replica_id {
            Some(id) => id,
            None => {
                // Snapshot fetch happens outside the book lock.
                let snapshot = self.fetch_snapshot(http).await?;
                let last_update_id = snapshot.last_update_id;
                let bids = parse_levels(&snapshot.bids)?;
                let asks = parse_levels(&snapshot.asks)?;
                let mut book = self.shared.book.lock();
                book.replace(bids, asks, Some(last_update_id), timestamp_ms());
                sync.reset();
                last_update_id
            }
        };

        let first = data
            .get("U")
            .and_then(Value::as_u64)
            .context("depth update without U")?;
        let last = data
            .get("u")
            .and_then(Value::as_u64)
            .context("depth update without u")?;
        let prev = data.get("pu").and_then(Value::as_u64).unwrap_or_default();

        match sync.assess(replica_id, first, last, prev) {
            DeltaOutcome::Apply => {
                let mut book = self.shared.book.lock();
                apply_delta_side(&mut book, BookSide::Bids, data.get("b"))?;
                apply_delta_side(&mut book, BookSide::Asks, data.get("a"))?;
                book.last_update_id = Some(last);
                book.timestamp_ms = timestamp_ms();
            }
            DeltaOutcome::Skip => {}
            DeltaOutcome::Resync => {
                debug!(venue = VENUE, symbol = %self.symbol, "book_resync");
                let mut book = self.shared.book.lock();
                book.bids.clear();
                book.asks.clear();
                book.last_update_id = None;
                sync.reset();
            }
        }
        Ok(())
    }

    async fn fetch_snapshot(&self, http: &reqwest::Client) -> Result<SnapshotPayload> {
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit=1000",
            self.base_url, self.symbol
        );
        http.get(&url)
            .send()
            .await
            .context("depth snapshot request")?
            .error_for_status()
            .context("depth snapshot status")?
            .json()
            .await
            .context("decode depth snapshot")
    }

    async fn create_listen_key(&self, http: &reqwest::Client) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let payload: ListenKeyPayload = http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("listen key request")?
            .error_for_status()
            .context("listen key status")?
            .json()
            .await
            .context("decode listen key")?;
        Ok(payload.listen_key)
    }

    async fn keepalive_listen_key(&self, http: &reqwest::Client, key: &str) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey?listenKey={key}", self.base_url);
        http.put(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("listen key renewal request")?
            .error_for_status()
            .context("listen key renewal status")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_then_chained_then_gap() {
        let mut sync = DepthSync::default();

        // Snapshot at 100; first delta straddles it.
        assert_eq!(sync.assess(100, 95, 110, 0), DeltaOutcome::Apply);
        // Chained delta.
        assert_eq!(sync.assess(110, 111, 120, 110), DeltaOutcome::Apply);
        // Gap: prev points at 115, replica saw 120.
        assert_eq!(sync.assess(120, 121, 125, 115), DeltaOutcome::Resync);
    }

    #[test]
    fn deltas_older_than_snapshot_are_dropped() {
        let mut sync = DepthSync::default();
        assert_eq!(sync.assess(100, 80, 90, 0), DeltaOutcome::Skip);
        // Still not bootstrapped; the straddling delta completes it.
        assert_eq!(sync.assess(100, 91, 105, 90), DeltaOutcome::Apply);
    }

    #[test]
    fn stale_snapshot_forces_resync() {
        let mut sync = DepthSync::default();
        // The whole delta is beyond the snapshot: nothing can ever chain.
        assert_eq!(sync.assess(100, 150, 160, 149), DeltaOutcome::Resync);
    }

    #[test]
    fn reset_restarts_bootstrap() {
        let mut sync = DepthSync::default();
        assert_eq!(sync.assess(100, 95, 110, 0), DeltaOutcome::Apply);
        sync.reset();
        assert_eq!(sync.assess(200, 150, 160, 110), DeltaOutcome::Skip);
    }

    #[test]
    fn snapshot_levels_parse() {
        let rows = vec![
            ["100.5".to_string(), "2".to_string()],
            ["100.0".to_string(), "1".to_string()],
        ];
        let levels = parse_levels(&rows).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].0.to_string(), "100.5");
    }
}

//! JSON configuration: the main config file plus the credentials file it
//! points at. Paths come from the process argument; there is no other CLI.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::exchanges::VenueName;

#[derive(Debug, Clone, Deserialize)]
pub struct MainConfig {
    /// Path of the credentials file.
    pub credentials_json: String,
    /// Notional per leg, USDT.
    pub usdt_amount: Decimal,
    /// Requested leverage; capped per venue by the enricher.
    pub leverage: Decimal,
    /// Estimated-PnL percent an opportunity must beat to trade.
    pub estimated_pnl: Decimal,
    /// Window for the wall-clock funding predicates.
    pub funding_timeout_secs: i64,
    pub chatid: i64,
    pub bot_token: String,
    pub db_connection_string: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueCredentials {
    pub api_key: String,
    pub api_sec: String,
    /// Request validity window, milliseconds.
    pub recv_window: u64,
    /// REST origin, scheme included.
    pub base_url: String,
    /// WebSocket origin, scheme included.
    pub websockets_base_url: String,
    /// Optional default symbol; the screener picks the traded symbol per
    /// opportunity.
    #[serde(default)]
    pub symbol: Option<String>,
}

/// Credentials file contents, keyed by venue name.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct Credentials(HashMap<String, VenueCredentials>);

impl Credentials {
    pub fn venue(&self, name: VenueName) -> Option<&VenueCredentials> {
        match name {
            VenueName::Binance => self.0.get("Binance"),
            VenueName::Bybit => self.0.get("ByBit").or_else(|| self.0.get("Bybit")),
        }
    }
}

pub fn load(path: &Path) -> Result<(MainConfig, Credentials)> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: MainConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;

    let raw = fs::read_to_string(&config.credentials_json)
        .with_context(|| format!("read credentials {}", config.credentials_json))?;
    let credentials: Credentials = serde_json::from_str(&raw)
        .with_context(|| format!("parse credentials {}", config.credentials_json))?;

    Ok((config, credentials))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn main_config_parses_decimal_fields() {
        let raw = r#"{
            "credentials_json": "credentials.json",
            "usdt_amount": "1000",
            "leverage": "5",
            "estimated_pnl": "0.5",
            "funding_timeout_secs": 240,
            "chatid": 1234,
            "bot_token": "token",
            "db_connection_string": "trades.db"
        }"#;
        let config: MainConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.usdt_amount, dec!(1000));
        assert_eq!(config.estimated_pnl, dec!(0.5));
        assert_eq!(config.funding_timeout_secs, 240);
    }

    #[test]
    fn credentials_lookup_by_venue() {
        let raw = r#"{
            "Binance": {
                "api_key": "k1", "api_sec": "s1", "recv_window": 59999,
                "base_url": "https://fapi.binance.com",
                "websockets_base_url": "wss://fstream.binance.com",
                "symbol": "BTCUSDT"
            },
            "ByBit": {
                "api_key": "k2", "api_sec": "s2", "recv_window": 5000,
                "base_url": "https://api.bybit.com",
                "websockets_base_url": "wss://stream.bybit.com"
            }
        }"#;
        let credentials: Credentials = serde_json::from_str(raw).unwrap();
        assert_eq!(
            credentials.venue(VenueName::Binance).unwrap().api_key,
            "k1"
        );
        let bybit = credentials.venue(VenueName::Bybit).unwrap();
        assert_eq!(bybit.recv_window, 5000);
        assert_eq!(bybit.symbol, None);
    }
}

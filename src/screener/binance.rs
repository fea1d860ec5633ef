//! Screener-side Binance client: public endpoints only.

use std::collections::HashMap;

use anyhow::{Context, Result};
use reqwest::blocking;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::exchanges::rest::{parse_decimal, response_error, send_with_retry};
use crate::exchanges::VenueName;

use super::{FundingQuote, MarketData};

const VENUE: &str = "Binance";
const BASE_URL: &str = "https://fapi.binance.com";

/// Tickers the venue lists but funding arbitrage must not touch
/// (halted or delisting contracts).
const BLACKLIST: [&str; 1] = ["HNTUSDT"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndexRow {
    symbol: String,
    last_funding_rate: String,
}

pub struct BinanceMarket {
    http: blocking::Client,
}

impl BinanceMarket {
    pub fn new() -> Result<BinanceMarket> {
        Ok(BinanceMarket {
            http: blocking::Client::builder()
                .build()
                .context("build http client")?,
        })
    }
}

impl MarketData for BinanceMarket {
    fn name(&self) -> VenueName {
        VenueName::Binance
    }

    fn maker_fee(&self) -> Decimal {
        Decimal::new(2, 2) // 0.02%
    }

    fn taker_fee(&self) -> Decimal {
        Decimal::new(4, 2) // 0.04%
    }

    fn funding_rates(&self, quote_asset: &str) -> Result<HashMap<String, FundingQuote>> {
        let url = format!("{BASE_URL}/fapi/v1/premiumIndex");
        let response = send_with_retry(VENUE, || Ok(self.http.get(url.clone())))?;
        if !response.status().is_success() {
            return Err(response_error(VENUE, response));
        }
        let rows: Vec<PremiumIndexRow> = response.json().context("decode premiumIndex")?;

        let mut rates = HashMap::new();
        for row in rows {
            if !row.symbol.ends_with(quote_asset) {
                continue;
            }
            if BLACKLIST.contains(&row.symbol.as_str()) {
                continue;
            }
            let rate = parse_decimal(&row.last_funding_rate)? * Decimal::ONE_HUNDRED;
            rates.insert(
                row.symbol.clone(),
                FundingQuote {
                    rate,
                    original_symbol: row.symbol,
                },
            );
        }
        Ok(rates)
    }
}

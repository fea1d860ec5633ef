//! Screener-side Bybit client: public endpoints only.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use reqwest::blocking;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::exchanges::rest::{parse_decimal, response_error, send_with_retry};
use crate::exchanges::VenueName;

use super::{FundingQuote, MarketData};

const VENUE: &str = "ByBit";
const BASE_URL: &str = "https://api.bybit.com";

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
struct TickerRow {
    symbol: String,
    #[serde(default)]
    funding_rate: String,
}

pub struct BybitMarket {
    http: blocking::Client,
}

impl BybitMarket {
    pub fn new() -> Result<BybitMarket> {
        Ok(BybitMarket {
            http: blocking::Client::builder()
                .build()
                .context("build http client")?,
        })
    }

    fn get_envelope<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        let response = send_with_retry(VENUE, || Ok(self.http.get(url.clone())))?;
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
            .context("envelope without result")
    }
}

impl MarketData for BybitMarket {
    fn name(&self) -> VenueName {
        VenueName::Bybit
    }

    fn maker_fee(&self) -> Decimal {
        Decimal::new(1, 2) // 0.01%
    }

    fn taker_fee(&self) -> Decimal {
        Decimal::new(6, 2) // 0.06%
    }

    fn funding_rates(&self, quote_asset: &str) -> Result<HashMap<String, FundingQuote>> {
        let result: ResultList<TickerRow> = self.get_envelope(format!(
            "{BASE_URL}/derivatives/v3/public/tickers?category=linear"
        ))?;

        let mut rates = HashMap::new();
        for row in result.list {
            if !row.symbol.ends_with(quote_asset) {
                continue;
            }
            // Spot-style or expiring listings report no funding rate.
            if row.funding_rate.is_empty() {
                continue;
            }
            let rate = parse_decimal(&row.funding_rate)? * Decimal::ONE_HUNDRED;
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

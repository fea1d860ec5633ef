//! Best-effort Telegram alerting. A failed alert is logged and swallowed;
//! alerting must never take a coordinator down.

use anyhow::{Context, Result};
use reqwest::blocking;
use tracing::warn;

#[derive(Clone)]
pub struct BotAlert {
    chat_id: i64,
    token: String,
    http: blocking::Client,
}

impl BotAlert {
    pub fn new(chat_id: i64, token: &str) -> Result<BotAlert> {
        Ok(BotAlert {
            chat_id,
            token: token.to_string(),
            http: blocking::Client::builder()
                .build()
                .context("build http client")?,
        })
    }

    pub fn send_text_message(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let result = self
            .http
            .post(&url)
            .query(&[
                ("chat_id", self.chat_id.to_string()),
                ("text", text.to_string()),
            ])
            .send();
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "alert_rejected");
            }
            Err(e) => warn!(error = %e, "alert_failed"),
            _ => {}
        }
    }
}

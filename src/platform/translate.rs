//! HTTP translation client.
//!
//! Talks to the public `translate_a/single` endpoint. The response is a
//! nested JSON array whose first element lists translated segments.

use async_trait::async_trait;
use tracing::debug;

use crate::error::TranslateError;
use crate::platform::Translator;

const DEFAULT_TRANSLATE_URL: &str = "https://translate.googleapis.com/translate_a/single";

pub struct HttpTranslator {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTranslator {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_TRANSLATE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, text: &str, to: &str, from: &str) -> Result<String, TranslateError> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("client", "gtx"),
                ("sl", from),
                ("tl", to),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .await
            .map_err(|e| TranslateError::RequestFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(TranslateError::RequestFailed(format!(
                "translate returned {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TranslateError::InvalidResponse(e.to_string()))?;

        let translated = parse_segments(&body)?;
        debug!(from, to, chars = translated.chars().count(), "Translated text");
        Ok(translated)
    }
}

/// Join the translated segments of a `translate_a/single` response.
fn parse_segments(body: &serde_json::Value) -> Result<String, TranslateError> {
    let segments = body
        .get(0)
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| TranslateError::InvalidResponse("missing segment list".into()))?;

    Ok(segments
        .iter()
        .filter_map(|seg| seg.get(0).and_then(serde_json::Value::as_str))
        .collect())
}

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;

use crate::error::CoreError;
use crate::resilience::CircuitBreaker;
use crate::resilience::RetryPolicy;

/// Output of one extraction pass; every field is individually
/// optional, reflecting that any single heuristic or the LLM call may fail to
/// produce a value without failing the whole extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub vendor_guess: Option<String>,
    pub invoice_amount: Option<String>,
    pub currency: Option<String>,
    pub due_date: Option<String>,
    pub payment_terms: Option<String>,
}

#[async_trait]
pub trait VendorExtractor: Send + Sync {
    async fn extract(
        &self,
        pdf_bytes: &[u8],
    ) -> Result<ExtractionResult, CoreError>;
}

/// Priority-ordered amount labels: the first match
/// wins, so more specific labels are listed before generic ones.
static AMOUNT_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("Total Due", Regex::new(r"(?i)total\s+due[:\s]*\$?\s*([0-9][0-9,]*\.?[0-9]*)").unwrap()),
        ("Amount Due", Regex::new(r"(?i)amount\s+due[:\s]*\$?\s*([0-9][0-9,]*\.?[0-9]*)").unwrap()),
        ("Balance", Regex::new(r"(?i)balance[:\s]*\$?\s*([0-9][0-9,]*\.?[0-9]*)").unwrap()),
        ("Total", Regex::new(r"(?i)\btotal\b[:\s]*\$?\s*([0-9][0-9,]*\.?[0-9]*)").unwrap()),
    ]
});

static CURRENCY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(USD|EUR|GBP|CAD|AUD)\b|\$").unwrap());

static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)due\s+date[:\s]*([0-9]{1,2}[/-][0-9]{1,2}[/-][0-9]{2,4}|[A-Za-z]+ [0-9]{1,2},? [0-9]{4})").unwrap()
});

static TERMS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(net\s*\d{1,3}|due\s+on\s+receipt)").unwrap());

/// Regex-heuristic field extraction plus an LLM vendor-name guess behind its
/// own `CircuitBreaker`. Text-layer extraction uses
/// `pdf-extract`; encrypted or unreadable PDFs and anything over
/// `max_pdf_bytes` degrade to an empty, all-`None` result rather than erroring
/// the caller, since extraction is always best-effort.
pub struct HeuristicVendorExtractor {
    http_client: Client,
    llm_base_url: String,
    llm_auth_token: Secret<String>,
    enabled: bool,
    max_pdf_bytes: u64,
    force_llm_on_empty_text: bool,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl HeuristicVendorExtractor {
    pub fn new(
        llm_base_url: String,
        llm_auth_token: Secret<String>,
        enabled: bool,
        max_pdf_bytes: u64,
        force_llm_on_empty_text: bool,
        timeout: std::time::Duration,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        let http_client = Client::builder().timeout(timeout).build().expect("failed to build reqwest client");
        Self {
            http_client,
            llm_base_url,
            llm_auth_token,
            enabled,
            max_pdf_bytes,
            force_llm_on_empty_text,
            breaker,
            retry,
        }
    }

    async fn guarded<F, Fut, T>(
        &self,
        op: F,
    ) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        self.breaker.call(move || self.retry.run(op)).await
    }

    fn apply_heuristics(text: &str) -> ExtractionResult {
        let mut result = ExtractionResult::default();

        for (_label, pattern) in AMOUNT_PATTERNS.iter() {
            if let Some(captures) = pattern.captures(text) {
                if let Some(amount) = captures.get(1) {
                    result.invoice_amount = Some(amount.as_str().replace(',', ""));
                    break;
                }
            }
        }

        result.currency = CURRENCY_RE.find(text).map(|m| normalize_currency(m.as_str()));

        if let Some(captures) = DATE_RE.captures(text) {
            if let Some(raw) = captures.get(1) {
                result.due_date = normalize_date(raw.as_str());
            }
        }

        result.payment_terms = TERMS_RE.find(text).map(|m| m.as_str().to_uppercase());

        result
    }

    #[tracing::instrument(skip(self, text_excerpt))]
    async fn ask_llm_for_vendor(
        &self,
        text_excerpt: &str,
    ) -> Result<Option<String>, CoreError> {
        #[derive(Serialize)]
        struct GuessRequest<'a> {
            text: &'a str,
        }
        #[derive(Deserialize)]
        struct GuessResponse {
            vendor_name: Option<String>,
        }

        let text_excerpt = text_excerpt.to_string();
        let result = self
            .guarded(|| {
                let text_excerpt = text_excerpt.clone();
                async move {
                    let response = self
                        .http_client
                        .post(format!("{}/extract", self.llm_base_url))
                        .bearer_auth(self.llm_auth_token.expose_secret())
                        .json(&GuessRequest { text: &text_excerpt })
                        .send()
                        .await
                        .map_err(|e| CoreError::Transient(e.into()))?;

                    if !response.status().is_success() {
                        return Err(CoreError::Transient(anyhow::anyhow!(
                            "extractor LLM returned {}",
                            response.status()
                        )));
                    }
                    response.json::<GuessResponse>().await.map_err(|e| CoreError::Transient(e.into()))
                }
            })
            .await?;
        Ok(result.vendor_name)
    }
}

#[async_trait]
impl VendorExtractor for HeuristicVendorExtractor {
    #[tracing::instrument(skip(self, pdf_bytes), fields(size = pdf_bytes.len()))]
    async fn extract(
        &self,
        pdf_bytes: &[u8],
    ) -> Result<ExtractionResult, CoreError> {
        if pdf_bytes.len() as u64 > self.max_pdf_bytes {
            tracing::info!("pdf exceeds max_pdf_bytes, skipping extraction");
            return Ok(ExtractionResult::default());
        }

        let owned = pdf_bytes.to_vec();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&owned))
            .await
            .map_err(|e| CoreError::Fatal(e.into()))?;

        let text = match text {
            Ok(t) => t,
            // Encrypted or otherwise unreadable PDF.
            Err(_) => return Ok(ExtractionResult::default()),
        };

        if text.trim().is_empty() && !self.force_llm_on_empty_text {
            return Ok(ExtractionResult::default());
        }

        let mut result = Self::apply_heuristics(&text);

        if self.enabled {
            let excerpt: String = text.chars().take(4000).collect();
            match self.ask_llm_for_vendor(&excerpt).await {
                Ok(guess) => result.vendor_guess = guess,
                Err(e) => tracing::warn!(error = %e, "vendor-extractor LLM call failed, continuing without a hint"),
            }
        }

        Ok(result)
    }
}

fn normalize_currency(raw: &str) -> String {
    match raw {
        "$" => "USD".to_string(),
        other => other.to_uppercase(),
    }
}

/// Best-effort normalization to `YYYY-MM-DD`. Returns
/// `None` rather than propagating a parse error, consistent with every field
/// here being individually optional.
fn normalize_date(raw: &str) -> Option<String> {
    for fmt in ["%m/%d/%Y", "%m-%d-%Y", "%m/%d/%y", "%B %d, %Y", "%B %d %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_due_outranks_generic_total() {
        let text = "Total: $500.00\nTotal Due: $450.00";
        let result = HeuristicVendorExtractor::apply_heuristics(text);
        assert_eq!(result.invoice_amount.as_deref(), Some("450.00"));
    }

    #[test]
    fn currency_symbol_normalizes_to_usd() {
        let result = HeuristicVendorExtractor::apply_heuristics("Amount Due: $100.00");
        assert_eq!(result.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn payment_terms_detects_net_terms() {
        let result = HeuristicVendorExtractor::apply_heuristics("Payment terms: Net 30");
        assert_eq!(result.payment_terms.as_deref(), Some("NET 30"));
    }

    #[test]
    fn normalizes_slash_date_to_iso() {
        assert_eq!(normalize_date("03/15/2024"), Some("2024-03-15".to_string()));
    }

    #[test]
    fn unparseable_date_yields_none() {
        assert_eq!(normalize_date("not a date"), None);
    }
}

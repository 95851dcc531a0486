//! Model-backed decision source using an OpenAI-compatible chat API
//!
//! The model receives a structured snapshot of the typed market context and must
//! answer with a single JSON object. Anything else degrades to a fallback HOLD.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{DecisionOutcome, DecisionSource};
use crate::error::Error;
use crate::models::{Action, Decision, MarketContext};
use crate::Result;

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Upper bound on a single backoff sleep between retries
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;

const SYSTEM_PROMPT: &str = "You are a disciplined trader on a backtesting team. \
Analyse the market snapshot and answer with valid JSON only, no markdown formatting.";

type LlmRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Connection and retry settings for [`LlmDecisionSource`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSourceConfig {
    pub id: String,
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub requests_per_minute: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for LlmSourceConfig {
    fn default() -> Self {
        Self {
            id: "llm_trader".to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 512,
            temperature: 0.0,
            requests_per_minute: 30,
            max_retries: 3,
            retry_delay_ms: 2500,
            request_timeout_secs: 25,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: String,
}

/// Shape the model is asked to return
#[derive(Debug, Deserialize)]
pub struct LlmDecisionResponse {
    pub action: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub strategy: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

pub struct LlmDecisionSource {
    config: LlmSourceConfig,
    client: reqwest::Client,
    rate_limiter: Arc<LlmRateLimiter>,
}

impl LlmDecisionSource {
    pub fn new(config: LlmSourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let rpm = NonZeroU32::new(config.requests_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            config,
            client,
            rate_limiter,
        })
    }

    /// Ask the model for a decision, retrying transient failures
    pub async fn request_decision(&self, ctx: &MarketContext) -> Result<Decision> {
        let prompt = create_prompt(ctx);
        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(self.config.retry_delay_ms, attempt)).await;
            }

            self.rate_limiter.until_ready().await;

            match self.call_once(&prompt).await {
                Ok(text) => match parse_decision(&self.config.id, &text, ctx) {
                    Ok(decision) => return Ok(decision),
                    Err(e) => last_error = e.to_string(),
                },
                Err(CallError::Fatal(e)) => return Err(e),
                Err(CallError::Retryable(e)) => last_error = e,
            }

            tracing::debug!(
                "LLM source {} attempt {}/{} failed: {}",
                self.config.id,
                attempt + 1,
                attempts,
                last_error
            );
        }

        Err(Error::Llm(format!(
            "failed after {} attempts: {}",
            attempts, last_error
        )))
    }

    async fn call_once(&self, prompt: &str) -> std::result::Result<String, CallError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| CallError::Retryable(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("API error {}: {}", status, body);
            // Only rate limiting and server errors are worth another attempt
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(CallError::Retryable(message))
            } else {
                Err(CallError::Fatal(Error::Llm(message)))
            };
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| CallError::Retryable(format!("JSON decode error: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CallError::Retryable("response had no choices".to_string()))
    }
}

/// Exponential backoff before retry `attempt` (1-based), capped at [`MAX_RETRY_DELAY_MS`]
fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor).min(MAX_RETRY_DELAY_MS))
}

enum CallError {
    Retryable(String),
    Fatal(Error),
}

#[async_trait]
impl DecisionSource for LlmDecisionSource {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn decide(&self, ctx: &MarketContext) -> DecisionOutcome {
        match self.request_decision(ctx).await {
            Ok(decision) => DecisionOutcome::Decided(decision),
            Err(e) => DecisionOutcome::fallback(&self.config.id, e.to_string()),
        }
    }
}

/// Strip optional markdown fences and parse the model's JSON answer
pub fn parse_decision(source_id: &str, text: &str, ctx: &MarketContext) -> Result<Decision> {
    let mut text = text.trim();
    if text.starts_with("```") {
        text = text
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
    }

    let parsed: LlmDecisionResponse = serde_json::from_str(text)
        .map_err(|e| Error::Llm(format!("malformed decision JSON: {} (text: {})", e, text)))?;

    let action = Action::parse(&parsed.action)
        .ok_or_else(|| Error::Llm(format!("unknown action: {}", parsed.action)))?;

    let amount = match action {
        Action::Hold => 0.0,
        // SELL amount is a share count; never ask for more than is held
        Action::Sell => parsed.amount.min(ctx.held_shares()),
        Action::Buy => parsed.amount,
    };

    Ok(Decision::new(
        source_id,
        action,
        amount,
        parsed.confidence,
        parsed.strategy,
        parsed.reason,
    ))
}

fn create_prompt(ctx: &MarketContext) -> String {
    let fmt_opt = |v: Option<f64>| match v {
        Some(v) => format!("{:.2}", v),
        None => "not available (insufficient history)".to_string(),
    };

    let trend = match ctx.ema {
        Some(ema) if ctx.price > ema => "price above EMA48 (bullish)",
        Some(_) => "price below EMA48 (bearish)",
        None => "unknown",
    };

    let position = match &ctx.position {
        Some(p) => format!(
            "{:.8} shares @ ${:.2} avg cost (unrealized {:+.2}%)",
            p.shares,
            p.avg_cost,
            p.unrealized_pnl_pct(ctx.price)
        ),
        None => "no open position".to_string(),
    };

    format!(
        r#"## Market Snapshot
- Ticker: {ticker}
- Timestamp: {ts}
- Close price: ${price:.2}
- Volume: {volume:.0}
- EMA48: {ema}
- EMA48 projection +1: {p1}
- EMA48 projection +2: {p2}
- Trend: {trend}

## Portfolio
- Cash available: ${cash:.2}
- Position: {position}

## Rules
- BUY "amount" is the USD notional to spend (never more than available cash).
- SELL "amount" is the number of shares to sell (never more than held).
- HOLD "amount" is 0.

Respond ONLY with valid JSON:
{{"action": "BUY|SELL|HOLD", "amount": 0, "reason": "1-2 sentences", "strategy": "short tag", "confidence": 0.0}}
"#,
        ticker = ctx.ticker,
        ts = ctx.timestamp.format("%Y-%m-%d %H:%M"),
        price = ctx.price,
        volume = ctx.volume,
        ema = fmt_opt(ctx.ema),
        p1 = fmt_opt(ctx.ema_proj_1),
        p2 = fmt_opt(ctx.ema_proj_2),
        trend = trend,
        cash = ctx.cash,
        position = position,
    )
}

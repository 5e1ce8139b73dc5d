//! Row types and closed vocabularies shared across the store.

use serde::{Deserialize, Serialize};

// ── Vocabularies ────────────────────────────────────────────────────

/// Event classification assigned by refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Token,
    Airdrop,
    Deploy,
    Topic,
    MarketUpdate,
    Misc,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Token => "token",
            EventType::Airdrop => "airdrop",
            EventType::Deploy => "deploy",
            EventType::Topic => "topic",
            EventType::MarketUpdate => "market-update",
            EventType::Misc => "misc",
        }
    }

    pub fn parse(s: &str) -> EventType {
        match s {
            "token" => EventType::Token,
            "airdrop" => EventType::Airdrop,
            "deploy" => EventType::Deploy,
            "topic" => EventType::Topic,
            "market-update" => EventType::MarketUpdate,
            _ => EventType::Misc,
        }
    }
}

/// Signal verification state. Transitions only originate from `Candidate`;
/// `Verified` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalState {
    Candidate,
    Verified,
    Rejected,
    Downgraded,
}

impl SignalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalState::Candidate => "candidate",
            SignalState::Verified => "verified",
            SignalState::Rejected => "rejected",
            SignalState::Downgraded => "downgraded",
        }
    }

    pub fn parse(s: &str) -> SignalState {
        match s {
            "verified" => SignalState::Verified,
            "rejected" => SignalState::Rejected,
            "downgraded" => SignalState::Downgraded,
            _ => SignalState::Candidate,
        }
    }
}

/// Security risk label from the security provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLabel {
    Red,
    Yellow,
    Green,
    Gray,
    Unknown,
}

impl RiskLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLabel::Red => "red",
            RiskLabel::Yellow => "yellow",
            RiskLabel::Green => "green",
            RiskLabel::Gray => "gray",
            RiskLabel::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> RiskLabel {
        match s {
            "red" => RiskLabel::Red,
            "yellow" => RiskLabel::Yellow,
            "green" => RiskLabel::Green,
            "gray" => RiskLabel::Gray,
            _ => RiskLabel::Unknown,
        }
    }
}

/// Outbox delivery state. Only `Pending` and `Retry` are dispatchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Retry,
    Done,
    Dlq,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Retry => "retry",
            OutboxStatus::Done => "done",
            OutboxStatus::Dlq => "dlq",
        }
    }

    pub fn parse(s: &str) -> OutboxStatus {
        match s {
            "retry" => OutboxStatus::Retry,
            "done" => OutboxStatus::Done,
            "dlq" => OutboxStatus::Dlq,
            _ => OutboxStatus::Pending,
        }
    }
}

// ── Rows ────────────────────────────────────────────────────────────

/// A normalized social post ready for insertion.
#[derive(Debug, Clone)]
pub struct NewRawPost {
    pub source: String,
    pub author: String,
    pub text: String,
    pub ts: String,
    pub urls: serde_json::Value,
    pub token_ca: Option<String>,
    pub symbol: Option<String>,
    pub is_candidate: bool,
    pub sentiment_label: Option<String>,
    pub sentiment_score: Option<f64>,
    pub keyphrases: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub event_key: String,
    pub event_type: EventType,
    pub summary: Option<String>,
    pub score: f64,
    pub evidence: serde_json::Value,
    pub impacted_assets: Vec<String>,
    pub start_ts: String,
    pub last_ts: String,
    pub heat_10m: i64,
    pub heat_30m: i64,
    pub topic_hash: Option<String>,
    pub topic_entities: Option<Vec<String>>,
    pub candidate_score: Option<f64>,
    pub token_ca: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignalRow {
    pub id: i64,
    pub event_key: String,
    pub signal_type: String,
    pub market_type: Option<String>,
    pub state: SignalState,
    pub goplus_risk: Option<RiskLabel>,
    pub buy_tax: Option<f64>,
    pub sell_tax: Option<f64>,
    pub lp_lock_days: Option<i64>,
    pub honeypot: Option<bool>,
    pub dex_liquidity: Option<f64>,
    pub dex_volume_1h: Option<f64>,
    pub heat_slope: Option<f64>,
    pub onchain_asof_ts: Option<String>,
    pub onchain_confidence: Option<f64>,
    pub updated_at: String,
    pub ts: String,
}

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub channel_id: i64,
    pub thread_id: Option<i64>,
    pub event_key: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempt: i64,
    pub next_try_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct DlqRow {
    pub id: i64,
    pub ref_id: i64,
    pub snapshot: serde_json::Value,
    pub failed_at: String,
}

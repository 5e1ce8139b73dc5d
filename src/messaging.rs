//! Messaging channel client (Telegram-shaped).
//!
//! The wire protocol is a black box behind `Messenger`; the real client
//! talks to the Bot API, the mock appends JSONL to a file for tests and
//! sandboxed runs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::envcfg;

pub const MAX_TEXT_LEN: usize = 4096;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SendOutcome {
    pub ok: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<i64>,
    /// HTTP status; `None` means the request never completed (network or
    /// timeout).
    pub status_code: Option<u16>,
    pub retry_after: Option<u64>,
}

impl SendOutcome {
    pub fn success(message_id: String) -> SendOutcome {
        SendOutcome {
            ok: true,
            message_id: Some(message_id),
            ..Default::default()
        }
    }

    pub fn failure(status_code: Option<u16>, error: impl Into<String>) -> SendOutcome {
        SendOutcome {
            ok: false,
            status_code,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub ok: bool,
    pub bot_username: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: &str,
        disable_notification: bool,
    ) -> SendOutcome;

    async fn test_connection(&self) -> ConnectionStatus;
}

// ── Telegram client ─────────────────────────────────────────────────

enum Mode {
    Real { token: String, base: String },
    Mock { path: PathBuf },
}

pub struct TelegramNotifier {
    mode: Mode,
    http: reqwest::Client,
}

impl TelegramNotifier {
    /// `TG_MODE=mock` (or a missing bot token) writes to the mock file
    /// instead of the network.
    pub fn from_env() -> TelegramNotifier {
        let timeout = envcfg::env_u64("TG_TIMEOUT_SECS", 10);
        let http = crate::providers::http_client(Duration::from_secs(timeout));

        let mode = match envcfg::env_str("TG_MODE", "real").as_str() {
            "mock" => Mode::Mock {
                path: PathBuf::from(envcfg::env_str(
                    "TG_MOCK_PATH",
                    "/tmp/telegram_sandbox.jsonl",
                )),
            },
            _ => match envcfg::env_opt("TG_BOT_TOKEN") {
                Some(token) => Mode::Real {
                    token,
                    base: envcfg::env_str("TG_API_BASE", "https://api.telegram.org"),
                },
                None => {
                    tracing::warn!(stage = "telegram.error", error = "TG_BOT_TOKEN not configured");
                    Mode::Mock {
                        path: PathBuf::from(envcfg::env_str(
                            "TG_MOCK_PATH",
                            "/tmp/telegram_sandbox.jsonl",
                        )),
                    }
                }
            },
        };

        TelegramNotifier { mode, http }
    }
}

#[async_trait]
impl Messenger for TelegramNotifier {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: &str,
        disable_notification: bool,
    ) -> SendOutcome {
        let text: String = text.chars().take(MAX_TEXT_LEN).collect();

        match &self.mode {
            Mode::Mock { path } => {
                let record = serde_json::json!({
                    "ok": true,
                    "mock": true,
                    "chat_id": chat_id,
                    "text": text,
                    "ts": crate::store::now_ts(),
                });
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let line = format!("{record}\n");
                if let Err(e) = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()))
                {
                    return SendOutcome::failure(None, format!("mock write failed: {e}"));
                }
                tracing::info!(stage = "telegram.mock", path = %path.display(), text_len = text.len());
                SendOutcome::success(format!("mock-{}", chrono::Utc::now().timestamp_millis()))
            }
            Mode::Real { token, base } => {
                let url = format!("{base}/bot{token}/sendMessage");
                let body = serde_json::json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": parse_mode,
                    "disable_notification": disable_notification,
                });

                let resp = match self.http.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) if e.is_timeout() => {
                        tracing::warn!(stage = "telegram.timeout", chat_id = %chat_id);
                        return SendOutcome::failure(None, "request timeout");
                    }
                    Err(e) => {
                        tracing::warn!(stage = "telegram.request_error", chat_id = %chat_id, error = %e);
                        return SendOutcome::failure(None, format!("request failed: {e}"));
                    }
                };

                let status = resp.status().as_u16();
                let data: Value = match resp.json().await {
                    Ok(v) => v,
                    Err(e) => return SendOutcome::failure(Some(status), format!("bad response: {e}")),
                };

                if data.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
                    let message_id = data
                        .pointer("/result/message_id")
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    tracing::info!(stage = "telegram.sent", chat_id = %chat_id, message_id = %message_id);
                    return SendOutcome::success(message_id);
                }

                let error = data
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                let error_code = data.get("error_code").and_then(|v| v.as_i64());
                let retry_after = data
                    .pointer("/parameters/retry_after")
                    .and_then(|v| v.as_u64());

                tracing::warn!(
                    stage = "telegram.api_error",
                    chat_id = %chat_id,
                    error = %error,
                    error_code = error_code,
                );
                SendOutcome {
                    ok: false,
                    message_id: None,
                    error: Some(error),
                    error_code,
                    status_code: Some(status),
                    retry_after,
                }
            }
        }
    }

    async fn test_connection(&self) -> ConnectionStatus {
        match &self.mode {
            Mode::Mock { .. } => ConnectionStatus {
                ok: true,
                bot_username: Some("mock-bot".to_string()),
                error: None,
            },
            Mode::Real { token, base } => {
                let url = format!("{base}/bot{token}/getMe");
                match self.http.get(&url).send().await {
                    Ok(resp) => match resp.json::<Value>().await {
                        Ok(data) if data.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) => {
                            let username = data
                                .pointer("/result/username")
                                .and_then(|v| v.as_str())
                                .map(String::from);
                            tracing::info!(stage = "telegram.connected", bot_username = username.as_deref());
                            ConnectionStatus {
                                ok: true,
                                bot_username: username,
                                error: None,
                            }
                        }
                        Ok(data) => ConnectionStatus {
                            ok: false,
                            bot_username: None,
                            error: data
                                .get("description")
                                .and_then(|v| v.as_str())
                                .map(String::from),
                        },
                        Err(e) => ConnectionStatus {
                            ok: false,
                            bot_username: None,
                            error: Some(e.to_string()),
                        },
                    },
                    Err(e) => ConnectionStatus {
                        ok: false,
                        bot_username: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        }
    }
}

/// Effective target channel: the sandbox channel when `TG_SANDBOX` is set.
pub fn effective_channel_id() -> i64 {
    if envcfg::env_bool("TG_SANDBOX", false) {
        return envcfg::env_i64("TG_SANDBOX_CHANNEL_ID", -1);
    }
    envcfg::env_i64("TG_CHANNEL_ID", -1)
}

pub fn effective_thread_id() -> Option<i64> {
    if envcfg::env_bool("TG_SANDBOX", false) {
        return envcfg::env_opt("TG_SANDBOX_THREAD_ID").and_then(|v| v.parse().ok());
    }
    envcfg::env_opt("TG_THREAD_ID").and_then(|v| v.parse().ok())
}

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use rustis::resp;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{LimitError, Result},
    redis::RedisPool,
    runner::ScriptRunner,
    scripts::{Script, ScriptRegistry},
};

/// The three algorithms sharing the verdict envelope. The fixed-window
/// counter sits outside because its reply shape differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    TokenBucket,
    SlidingWindow,
    LeakyBucket,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::TokenBucket => "token_bucket",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = LimitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token_bucket" => Ok(Strategy::TokenBucket),
            "sliding_window" => Ok(Strategy::SlidingWindow),
            "leaky_bucket" => Ok(Strategy::LeakyBucket),
            other => Err(LimitError::Configuration(format!(
                "unknown strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Verdict {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: u64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct WindowUsage {
    pub current: u64,
    pub time_window: u64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct QuotaStatus {
    pub remaining: u64,
    pub total: u64,
}

/// The decision engine. Stateless per call; every bucket lives in the
/// shared store and is only ever mutated by its algorithm's script.
pub struct Limiter {
    runner: ScriptRunner,
    pool: RedisPool,
}

impl Limiter {
    pub fn new(pool: RedisPool, registry: ScriptRegistry, shutdown: CancellationToken) -> Self {
        Limiter {
            runner: ScriptRunner::new(pool.clone(), registry, shutdown),
            pool,
        }
    }

    pub async fn preload_scripts(&self) {
        self.runner.preload().await;
    }

    /// Single entry point for the three verdict-shaped algorithms.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
        strategy: Strategy,
    ) -> Result<Verdict> {
        if limit == 0 || window_seconds == 0 {
            return Err(LimitError::Configuration(format!(
                "limit and window must be positive, got limit={} window={}",
                limit, window_seconds
            )));
        }

        // one clock reading per decision; the script and any retry logging
        // downstream all reference the same instant
        let now = unix_ms();
        let data = match strategy {
            Strategy::TokenBucket => {
                self.runner
                    .eval(
                        Script::TokenBucket,
                        &[key],
                        &[
                            limit.to_string(),
                            window_seconds.to_string(),
                            now.to_string(),
                        ],
                    )
                    .await?
            }
            Strategy::SlidingWindow => {
                let window_ms = window_seconds * 1000;
                self.runner
                    .eval(
                        Script::SlidingWindow,
                        &[key],
                        &[
                            limit.to_string(),
                            now.saturating_sub(window_ms).to_string(),
                            now.to_string(),
                            window_ms.to_string(),
                        ],
                    )
                    .await?
            }
            Strategy::LeakyBucket => {
                self.runner
                    .eval(
                        Script::LeakyBucket,
                        &[key],
                        &[
                            limit.to_string(),
                            window_seconds.to_string(),
                            now.to_string(),
                        ],
                    )
                    .await?
            }
        };

        let (allowed, remaining, reset_at) = data.to::<(u64, u64, u64)>()?;
        Ok(Verdict {
            allowed: allowed == 1,
            remaining,
            reset_at,
        })
    }

    /// Fixed-window counter with optional punishment on overage: re-arm the
    /// base window every call (`continue_exceeding`) or extend it
    /// exponentially (`exponential_backoff`). The counter always increments;
    /// whether `current > max` blocks is the caller's decision.
    pub async fn fixed_window(
        &self,
        key: &str,
        time_window: u64,
        max: u64,
        continue_exceeding: bool,
        exponential_backoff: bool,
    ) -> Result<WindowUsage> {
        if time_window == 0 || max == 0 {
            return Err(LimitError::Configuration(format!(
                "time window and max must be positive, got window={} max={}",
                time_window, max
            )));
        }

        let data = self
            .runner
            .eval(
                Script::RateLimit,
                &[key],
                &[
                    time_window.to_string(),
                    max.to_string(),
                    u8::from(continue_exceeding).to_string(),
                    u8::from(exponential_backoff).to_string(),
                ],
            )
            .await?;

        let (current, time_window) = data.to::<(u64, u64)>()?;
        Ok(WindowUsage {
            current,
            time_window,
        })
    }

    /// Best-effort diagnostic; store failures are swallowed into zeros.
    pub async fn quota_status(&self, key: &str, strategy: Strategy) -> QuotaStatus {
        match self.try_quota_status(key, strategy).await {
            Ok(status) => status,
            Err(err) => {
                log::warn!("quota status for '{}' failed: {}", key, err);
                QuotaStatus {
                    remaining: 0,
                    total: 0,
                }
            }
        }
    }

    async fn try_quota_status(&self, key: &str, strategy: Strategy) -> Result<QuotaStatus> {
        match strategy {
            Strategy::SlidingWindow => {
                let data = self.send(resp::cmd("ZCARD").arg(key.to_string())).await?;
                let current = data.to::<u64>()?;
                Ok(QuotaStatus {
                    remaining: current,
                    total: current,
                })
            }
            _ => {
                let data = self
                    .send(resp::cmd("HMGET").arg(key.to_string()).arg("tokens"))
                    .await?;
                let fields = data.to::<Vec<String>>().unwrap_or_default();
                let tokens = fields
                    .first()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0)
                    .floor() as u64;
                Ok(QuotaStatus {
                    remaining: tokens,
                    total: tokens,
                })
            }
        }
    }

    pub async fn delete_rate_limit(&self, key: &str) -> Result<()> {
        let data = self.send(resp::cmd("DEL").arg(key.to_string())).await?;
        if data.is_error() {
            return Err(LimitError::Store(data.to_string()));
        }
        Ok(())
    }

    /// Iterative cursor scan, 100 keys per step, until the cursor wraps.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = "0".to_string();

        loop {
            let cmd = resp::cmd("SCAN")
                .arg(cursor.clone())
                .arg("MATCH")
                .arg(pattern.to_string())
                .arg("COUNT")
                .arg(100u64);

            let data = self.send(cmd).await?;
            let (next, batch) = data.to::<(String, Vec<String>)>()?;
            keys.extend(batch);

            if next == "0" {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn send(&self, cmd: resp::Command) -> Result<resp::RespBuf> {
        let mut cli = self.pool.get().await?;
        Ok(cli.send(cmd, None).await?)
    }
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as u64
}

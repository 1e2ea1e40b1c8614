use actix_web::{http::StatusCode, web, Error, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{timeout, Duration};

use crate::{
    context::ContextExt,
    error::LimitError,
    events::{Broadcast, QuotaViolation},
    limiter::{Limiter, QuotaStatus, Strategy},
    redis::RedisPool,
};

/// Upper bound on a single decision round-trip.
const DECISION_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

pub async fn version(
    req: HttpRequest,
    info: web::Data<AppInfo>,
    pool: web::Data<RedisPool>,
) -> Result<HttpResponse, Error> {
    let state = pool.state();
    let mut ctx = req.context_mut()?;
    ctx.set("connections", state.connections);
    ctx.set("idle_connections", state.idle_connections);
    respond_result(info.get_ref())
}

#[derive(Deserialize)]
pub struct CheckRequest {
    key: String,
    limit: u64,
    window_seconds: u64,
    strategy: String,
}

pub async fn post_check(
    req: HttpRequest,
    limiter: web::Data<Limiter>,
    bus: web::Data<Broadcast>,
    input: web::Json<CheckRequest>,
) -> Result<HttpResponse, Error> {
    let input = input.into_inner();
    let ts = req.context()?.unix_ms;

    let strategy = match input.strategy.parse::<Strategy>() {
        Ok(strategy) => strategy,
        Err(err) => return respond_error(400, err.to_string()),
    };

    let rt = match timeout(
        DECISION_TIMEOUT,
        limiter.check_rate_limit(&input.key, input.limit, input.window_seconds, strategy),
    )
    .await
    {
        Ok(rt) => rt,
        Err(_) => Err(LimitError::Store("decision timeout".to_string())),
    };

    // no synthetic verdict on failure: fail-open vs fail-closed is the
    // caller's policy
    let verdict = match rt {
        Ok(verdict) => verdict,
        Err(err) => {
            log::error!("post_check error: {}", err);
            return respond_limit_error(err);
        }
    };

    {
        let mut ctx = req.context_mut()?;
        ctx.set("key", input.key.clone());
        ctx.set("strategy", strategy.as_str());
        ctx.set("allowed", verdict.allowed);
        ctx.set("remaining", verdict.remaining);
    }

    if !verdict.allowed {
        let event = QuotaViolation {
            key: input.key,
            strategy,
            reset_at: verdict.reset_at,
            timestamp: ts,
        };
        if let Err(err) = bus.publish(&event).await {
            log::warn!("violation publish failed: {}", err);
        }
    }

    respond_result(verdict)
}

#[derive(Deserialize)]
pub struct FixedWindowRequest {
    key: String,
    time_window: u64,
    max: u64,
    #[serde(default)]
    continue_exceeding: bool,
    #[serde(default)]
    exponential_backoff: bool,
}

pub async fn post_fixed_window(
    req: HttpRequest,
    limiter: web::Data<Limiter>,
    input: web::Json<FixedWindowRequest>,
) -> Result<HttpResponse, Error> {
    let input = input.into_inner();

    let rt = match timeout(
        DECISION_TIMEOUT,
        limiter.fixed_window(
            &input.key,
            input.time_window,
            input.max,
            input.continue_exceeding,
            input.exponential_backoff,
        ),
    )
    .await
    {
        Ok(rt) => rt,
        Err(_) => Err(LimitError::Store("decision timeout".to_string())),
    };

    let usage = match rt {
        Ok(usage) => usage,
        Err(err) => {
            log::error!("post_fixed_window error: {}", err);
            return respond_limit_error(err);
        }
    };

    let mut ctx = req.context_mut()?;
    ctx.set("key", input.key);
    ctx.set("current", usage.current);
    ctx.set("time_window", usage.time_window);
    drop(ctx);

    respond_result(usage)
}

#[derive(Deserialize)]
pub struct QuotaQuery {
    key: String,
    strategy: String,
}

pub async fn get_quota(
    req: HttpRequest,
    limiter: web::Data<Limiter>,
    query: web::Query<QuotaQuery>,
) -> Result<HttpResponse, Error> {
    let query = query.into_inner();

    // best-effort diagnostic: an unparseable strategy reads as empty, the
    // same as a store failure
    let status = match query.strategy.parse::<Strategy>() {
        Ok(strategy) => limiter.quota_status(&query.key, strategy).await,
        Err(err) => {
            log::warn!("get_quota error: {}", err);
            QuotaStatus {
                remaining: 0,
                total: 0,
            }
        }
    };

    let mut ctx = req.context_mut()?;
    ctx.set("key", query.key);
    ctx.set("remaining", status.remaining);
    drop(ctx);

    respond_result(status)
}

#[derive(Deserialize)]
pub struct DeleteRequest {
    key: String,
}

pub async fn delete_bucket(
    req: HttpRequest,
    limiter: web::Data<Limiter>,
    input: web::Json<DeleteRequest>,
) -> Result<HttpResponse, Error> {
    let input = input.into_inner();

    if let Err(err) = limiter.delete_rate_limit(&input.key).await {
        log::error!("delete_bucket error: {}", err);
        return respond_limit_error(err);
    }

    let mut ctx = req.context_mut()?;
    ctx.set("key", input.key);
    drop(ctx);

    respond_result("ok")
}

#[derive(Deserialize)]
pub struct ScanQuery {
    pattern: String,
}

pub async fn get_keys(
    limiter: web::Data<Limiter>,
    query: web::Query<ScanQuery>,
) -> Result<HttpResponse, Error> {
    match limiter.scan_keys(&query.pattern).await {
        Ok(keys) => respond_result(keys),
        Err(err) => {
            log::error!("get_keys error: {}", err);
            respond_limit_error(err)
        }
    }
}

fn respond_limit_error(err: LimitError) -> Result<HttpResponse, Error> {
    let code = match err {
        LimitError::Configuration(_) => 400,
        LimitError::Store(_) => 503,
        LimitError::Cancelled => 503,
    };
    respond_error(code, err.to_string())
}

fn respond_result(result: impl serde::ser::Serialize) -> Result<HttpResponse, Error> {
    match serde_json::to_value(result) {
        Ok(result) => Ok(HttpResponse::Ok()
            .content_type("application/json")
            .json(json!({ "result": result }))),
        Err(err) => respond_error(500, err.to_string()),
    }
}

fn respond_error(code: u16, err_msg: String) -> Result<HttpResponse, Error> {
    let err_json = json!({ "error": {"code": code, "message": err_msg }});
    Ok(HttpResponse::build(StatusCode::from_u16(code).unwrap())
        .content_type("application/json")
        .json(err_json))
}

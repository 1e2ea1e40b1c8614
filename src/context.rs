use std::{
    cell::{Ref, RefMut},
    collections::HashMap,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use actix_utils::future::{ready, Ready};
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    error::ErrorInternalServerError,
    Error, HttpMessage, HttpRequest,
};
use futures_core::future::LocalBoxFuture;
use serde_json::Value;

pub struct ContextTransform;

/// Per-request context: the single clock reading handlers pass downstream,
/// plus the fields of the request's structured log record.
pub struct Context {
    pub unix_ms: u64,
    pub start: Instant,
    log: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch");
        Context {
            unix_ms: ts.as_millis() as u64,
            start: Instant::now(),
            log: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.log.insert(key.to_string(), value.into());
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

pub trait ContextExt {
    fn context(&self) -> Result<Ref<'_, Context>, Error>;
    fn context_mut(&self) -> Result<RefMut<'_, Context>, Error>;
}

impl ContextExt for HttpRequest {
    fn context(&self) -> Result<Ref<'_, Context>, Error> {
        if self.extensions().get::<Context>().is_none() {
            return Err(ErrorInternalServerError(
                "no context in http request extensions",
            ));
        }

        Ok(Ref::map(self.extensions(), |ext| ext.get().unwrap()))
    }

    fn context_mut(&self) -> Result<RefMut<'_, Context>, Error> {
        if self.extensions().get::<Context>().is_none() {
            return Err(ErrorInternalServerError(
                "no context in http request extensions",
            ));
        }

        Ok(RefMut::map(self.extensions_mut(), |ext| {
            ext.get_mut().unwrap()
        }))
    }
}

impl<S, B> Transform<S, ServiceRequest> for ContextTransform
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = ContextMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ContextMiddleware { service }))
    }
}

pub struct ContextMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for ContextMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let mut ctx = Context::new();
        ctx.set("timestamp", ctx.unix_ms);
        ctx.set("method", req.method().as_str());
        ctx.set("path", req.path());

        if let Some(header) = req.headers().get("x-request-id") {
            if let Ok(id) = header.to_str() {
                ctx.set("x-request-id", id);
            }
        }

        req.request().extensions_mut().insert(ctx);

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            {
                let status = res.response().status();
                let mut ctx = res.request().context_mut()?;
                let elapsed = ctx.start.elapsed().as_millis() as u64;

                ctx.set("duration", elapsed);
                ctx.set("status", status.as_u16());
                match serde_json::to_string(&ctx.log) {
                    Ok(record) => {
                        log::info!(target: "api", "{}", record);
                    }
                    Err(err) => {
                        log::error!("request log serialization failed: {}", err);
                    }
                }
            }
            Ok(res)
        })
    }
}

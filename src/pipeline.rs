//! The request pipeline: rate limiter, then authenticator, then
//! dispatcher, with every error mapped into a typed envelope at the
//! outer boundary.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::error::{Result, ScoutError};
use crate::limit::RateLimiter;
use crate::scout::{Scout, ScoutParams};

/// The envelope the transport adapter hands in: an already-parsed
/// method name, named parameters, and caller context.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub context: RequestContext,
    /// Opaque correlation id, echoed back by the adapter.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestContext {
    pub client_id: Option<String>,
    pub api_key: Option<String>,
    pub client_address: Option<String>,
}

pub struct Pipeline {
    cfg: Arc<Config>,
    limiter: RateLimiter,
    auth: Authenticator,
    scout: Scout,
}

impl Pipeline {
    pub fn new(cfg: Arc<Config>, scout: Scout) -> Self {
        Self {
            limiter: RateLimiter::new(cfg.rate_limit_per_minute, cfg.rate_limit_burst),
            auth: Authenticator::new(&cfg.api_keys),
            cfg,
            scout,
        }
    }

    /// Run one request through limiter, authenticator and dispatcher.
    /// The health method bypasses the first two. Cancellation abandons
    /// the in-flight remote work without closing its session.
    pub async fn handle(&self, req: &Request, cancel: &CancellationToken) -> Result<Value> {
        if req.method == self.cfg.health_method_name {
            return Ok(json!({"status": "ok"}));
        }

        let key = self.client_key(&req.context);
        self.limiter.check(&key)?;
        self.auth.check(req.context.api_key.as_deref())?;
        debug!(method = %req.method, client = %key, "dispatching");

        tokio::select! {
            _ = cancel.cancelled() => Err(ScoutError::Cancelled),
            result = self.dispatch(req) => result,
        }
    }

    /// Bucket key: the authenticated principal when there is one, then
    /// the caller-supplied id, then the transport address.
    fn client_key(&self, ctx: &RequestContext) -> String {
        if self.auth.enabled() {
            if let Some(key) = ctx.api_key.as_deref() {
                return format!("key:{}", Authenticator::fingerprint(key));
            }
        }
        if let Some(id) = &ctx.client_id {
            return format!("id:{id}");
        }
        if let Some(addr) = &ctx.client_address {
            return format!("addr:{addr}");
        }
        "anonymous".to_string()
    }

    async fn dispatch(&self, req: &Request) -> Result<Value> {
        match req.method.as_str() {
            "scout" => {
                let params: ScoutParams = parse_params(&req.params)?;
                Ok(Value::String(self.scout.scout(params).await))
            }
            "read_resource" => {
                #[derive(Deserialize)]
                struct Params {
                    uri: String,
                }
                let params: Params = parse_params(&req.params)?;
                Ok(Value::String(self.scout.read_resource(&params.uri).await?))
            }
            "transfer" => {
                #[derive(Deserialize)]
                struct Params {
                    source: String,
                    target: String,
                }
                let params: Params = parse_params(&req.params)?;
                let report = self.scout.transfer(&params.source, &params.target).await?;
                serde_json::to_value(report)
                    .map_err(|e| ScoutError::validation(format!("unencodable result: {e}")))
            }
            other => Err(ScoutError::validation(format!("unknown method '{other}'"))),
        }
    }

    /// Map an error into the wire envelope. Stack traces and credential
    /// material never appear here.
    pub fn error_envelope(err: &ScoutError) -> Value {
        if !matches!(err, ScoutError::Cancelled) {
            warn!(kind = err.kind(), "request failed: {err}");
        }
        let mut body = json!({
            "kind": err.kind(),
            "status": err.status(),
            "message": err.to_string(),
        });
        if let ScoutError::RateLimited { retry_after } = err {
            body["retry_after_seconds"] = json!(retry_after);
        }
        json!({ "error": body })
    }
}

fn parse_params<T: DeserializeOwned>(value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| ScoutError::validation(format!("invalid parameters: {e}")))
}

//! Middleware implementation for reqwest.

use crate::config::ProxyPoolConfig;
use crate::executor::{FailureReason, RequestExecutor};
use crate::pool::ProxyPool;
use crate::transport::RequestTemplate;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;

/// Middleware that sends every request through the rotating proxy pool.
///
/// The inner `next` chain is not called: the request is replayed through a
/// proxied client per attempt instead.
#[derive(Clone)]
pub struct ProxyPoolMiddleware {
    executor: Arc<RequestExecutor>,
}

impl ProxyPoolMiddleware {
    /// Create the pool from `config`, load its sources and wrap it.
    pub async fn new(config: ProxyPoolConfig) -> Result<Self> {
        let pool = ProxyPool::new(config)
            .await
            .map_err(|e| Error::Middleware(anyhow!(e)))?;

        let (total, eligible) = pool.get_stats();
        info!("Proxy pool initialized with {}/{} eligible proxies", eligible, total);
        if eligible == 0 {
            warn!("No eligible proxies available in pool");
        }

        Ok(Self::from_pool(pool))
    }

    /// Middleware over an existing pool, using the pool's transport.
    pub fn from_pool(pool: Arc<ProxyPool>) -> Self {
        Self::from_executor(RequestExecutor::new(pool))
    }

    /// Middleware over a configured executor.
    pub fn from_executor(executor: RequestExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    /// The pool behind this middleware.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        self.executor.pool()
    }
}

#[async_trait]
impl Middleware for ProxyPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let template = RequestTemplate::from_reqwest(&req).ok_or_else(|| {
            Error::Middleware(anyhow!(
                "Request object is not cloneable. Are you passing a streaming body?".to_string()
            ))
        })?;

        let outcome = self.executor.execute(&template).await;
        match (outcome.response, outcome.failure) {
            (Some(response), None) | (Some(response), Some(FailureReason::Terminal { .. })) => {
                Ok(response.into_reqwest())
            }
            (_, Some(reason)) => Err(Error::Middleware(anyhow!(reason))),
            (None, None) => Err(Error::Middleware(anyhow!("proxy rotation returned no response"))),
        }
    }
}

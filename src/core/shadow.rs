//! Traffic mirroring.
//!
//! The shadow proxy receives a copy of every request on a detached context.
//! Its outcome is dropped and it never delays or cancels the primary call.
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{
    context::Context,
    error::ConfigError,
    proxy::{BoxProxy, Middleware, Proxy, ProxyResult, Request},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct ShadowMiddleware;

impl Middleware for ShadowMiddleware {
    /// Expects `[primary, shadow]`. A lone proxy is returned unchanged.
    fn wrap(&self, mut next: Vec<BoxProxy>) -> Result<BoxProxy, ConfigError> {
        match next.len() {
            0 => Err(ConfigError::NotEnoughProxies {
                middleware: "shadow",
                got: 0,
            }),
            1 => Ok(next.remove(0)),
            2 => {
                let shadow = next.remove(1);
                let primary = next.remove(0);
                Ok(Arc::new(ShadowProxy { primary, shadow }))
            }
            got => Err(ConfigError::TooManyProxies {
                middleware: "shadow",
                got,
            }),
        }
    }
}

struct ShadowProxy {
    primary: BoxProxy,
    shadow: BoxProxy,
}

#[async_trait]
impl Proxy for ShadowProxy {
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult {
        let shadow = self.shadow.clone();
        let shadow_ctx = ctx.detached();
        let shadow_req = req.clone();
        tokio::spawn(async move {
            if let Err(e) = shadow.call(shadow_ctx, shadow_req).await {
                tracing::debug!("Shadow call failed: {}", e);
            }
        });

        self.primary.call(ctx, req).await
    }
}

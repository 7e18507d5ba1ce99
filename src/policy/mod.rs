//! Access-control hooks capabilities may attach to their methods.
//!
//! The host pairs an [`Authorizer`] with an expression and a method name and
//! offers it to a capability through `Capability::add_authorizer`. Capabilities
//! without per-method authorization accept the call and ignore it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

/// Decides whether a call may proceed.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Evaluate `expression` for a call to `method` carrying `metadata`.
    async fn is_authorized(
        &self,
        expression: &str,
        method: &str,
        metadata: &HashMap<String, String>,
    ) -> bool;
}

/// An authorizer bound to one method.
#[derive(Clone)]
pub struct AuthorizerBinding {
    pub authorizer: Arc<dyn Authorizer>,
    pub expression: String,
    pub method: String,
}

impl std::fmt::Debug for AuthorizerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizerBinding")
            .field("expression", &self.expression)
            .field("method", &self.method)
            .finish()
    }
}

/// Authorizer that admits every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn is_authorized(&self, _: &str, _: &str, _: &HashMap<String, String>) -> bool {
        true
    }
}

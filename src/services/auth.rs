//! Capability checks against namespace paths.
//!
//! Request authentication happens upstream; by the time a request reaches a
//! handler its caller is already known. This module only decides whether that
//! caller may act on a path.

use crate::{
    errors::{MpuError, MpuResult},
    models::path::NamespacePath,
};
use async_trait::async_trait;

/// The already-authenticated principal behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub account: String,
}

impl Caller {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Ok(())` to allow, `Err(AuthorizationFailed)` to deny.
    async fn check_access(
        &self,
        caller: &Caller,
        path: &NamespacePath,
        capability: Capability,
    ) -> MpuResult<()>;
}

/// Accounts own everything beneath `/{account}`; `/{account}/public` is
/// world-readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerAuthorizer;

#[async_trait]
impl Authorizer for OwnerAuthorizer {
    async fn check_access(
        &self,
        caller: &Caller,
        path: &NamespacePath,
        capability: Capability,
    ) -> MpuResult<()> {
        let owner = path.account();
        if owner == Some(caller.account.as_str()) {
            return Ok(());
        }
        if capability == Capability::Read && path.top() == Some("public") {
            return Ok(());
        }
        Err(MpuError::AuthorizationFailed {
            login: caller.account.clone(),
            path: path.to_string(),
        })
    }
}

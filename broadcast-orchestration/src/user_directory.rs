//! # User Directory Stub
//!
//! `UserService` is an opaque interface returning user IDs for a role or
//! product; the user-directory lookup itself lives outside this workspace.
//! This module supplies the default wiring for the orchestrator binary: a
//! `RoleResolver`/`UserService` pair backed by a static directory table, so
//! the binary runs end-to-end without requiring a real external directory
//! service. A deployment swaps this for its own implementation of the two
//! traits; nothing else in `broadcast-orchestration` depends on the
//! concrete type.

use std::collections::HashMap;

use broadcast_shared::error::BroadcastResult;

use crate::lifecycle::RoleResolver;
use crate::targeting::UserService;

/// Resolves roles and products from an in-memory table, loaded once at
/// startup. Intended as the out-of-the-box collaborator for local runs and
/// integration tests; production deployments inject a real directory
/// client implementing the same two traits.
#[derive(Debug, Clone, Default)]
pub struct StaticUserDirectory {
    roles: HashMap<String, Vec<String>>,
    products: HashMap<String, Vec<String>>,
}

impl StaticUserDirectory {
    pub fn new(roles: HashMap<String, Vec<String>>, products: HashMap<String, Vec<String>>) -> Self {
        Self { roles, products }
    }

    /// Empty directory: every role/product resolves to zero members. Safe
    /// default for a binary started without directory fixtures.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RoleResolver for StaticUserDirectory {
    async fn resolve_role_members(&self, role: &str) -> BroadcastResult<Vec<String>> {
        Ok(self.roles.get(role).cloned().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl UserService for StaticUserDirectory {
    async fn resolve_product_members(&self, product_key: &str) -> BroadcastResult<Vec<String>> {
        Ok(self.products.get(product_key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_role_resolves_to_empty() {
        let directory = StaticUserDirectory::empty();
        assert_eq!(directory.resolve_role_members("admins").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn known_product_resolves_its_members() {
        let mut products = HashMap::new();
        products.insert("prodX".to_string(), vec!["u1".to_string(), "u2".to_string()]);
        let directory = StaticUserDirectory::new(HashMap::new(), products);
        assert_eq!(
            directory.resolve_product_members("prodX").await.unwrap(),
            vec!["u1".to_string(), "u2".to_string()]
        );
    }
}

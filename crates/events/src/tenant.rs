//! Tenant resolution for publishers and dispatchers.

use rentaldesk_core::TenantId;

/// Supplies the tenant of the current execution context.
///
/// The publisher falls back to it when a draft names no tenant, and the
/// dispatcher only claims events belonging to it.
pub trait TenantContext: Send + Sync + 'static {
    fn current_tenant(&self) -> Option<TenantId>;
}

/// A context pinned to one tenant (one bus per tenant process).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FixedTenant(pub TenantId);

impl TenantContext for FixedTenant {
    fn current_tenant(&self) -> Option<TenantId> {
        Some(self.0)
    }
}

impl TenantContext for Option<TenantId> {
    fn current_tenant(&self) -> Option<TenantId> {
        *self
    }
}

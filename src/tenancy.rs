//! # Tenant Resolution
//!
//! The cache layer never decides which tenant is active; it asks a
//! [`TenantResolver`] on every tenant-aware operation. Hosts plug in their own
//! resolver (request extension, task-local, ...) or use one of the resolvers
//! below.

use std::cell::RefCell;
use std::fmt;

use crate::constants::DEFAULT_TENANT_ID;

/// Supplies the tenant id for the calling thread
pub trait TenantResolver: Send + Sync + fmt::Debug + 'static {
    /// Stable identifier of the active tenant
    fn current_tenant(&self) -> String;

    /// Whether multi-tenancy is active process-wide. Tenant-aware builders
    /// only partition when this returns `true`.
    fn is_multi_tenant(&self) -> bool;
}

/// Multi-tenancy off; every caller is the default tenant
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTenant;

impl TenantResolver for SingleTenant {
    fn current_tenant(&self) -> String {
        DEFAULT_TENANT_ID.to_string()
    }

    fn is_multi_tenant(&self) -> bool {
        false
    }
}

/// Multi-tenancy on, with one fixed tenant for every caller
#[derive(Debug, Clone)]
pub struct FixedTenant {
    tenant_id: String,
}

impl FixedTenant {
    pub fn new<S: Into<String>>(tenant_id: S) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}

impl TenantResolver for FixedTenant {
    fn current_tenant(&self) -> String {
        self.tenant_id.clone()
    }

    fn is_multi_tenant(&self) -> bool {
        true
    }
}

thread_local! {
    static CURRENT_TENANT: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Multi-tenancy on, tenant taken from a thread-local scope set with
/// [`ThreadTenantResolver::with_tenant`]
#[derive(Debug, Clone)]
pub struct ThreadTenantResolver {
    fallback: String,
}

impl Default for ThreadTenantResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT_ID)
    }
}

impl ThreadTenantResolver {
    /// `fallback` is reported outside any `with_tenant` scope
    pub fn new<S: Into<String>>(fallback: S) -> Self {
        Self {
            fallback: fallback.into(),
        }
    }

    /// Run `f` with `tenant_id` as the current tenant of this thread.
    /// Scopes nest; the previous tenant is restored afterwards, also on panic.
    pub fn with_tenant<T, F: FnOnce() -> T>(tenant_id: &str, f: F) -> T {
        struct Restore(Option<String>);

        impl Drop for Restore {
            fn drop(&mut self) {
                let previous = self.0.take();
                CURRENT_TENANT.with(|cell| *cell.borrow_mut() = previous);
            }
        }

        let previous =
            CURRENT_TENANT.with(|cell| cell.borrow_mut().replace(tenant_id.to_string()));
        let _restore = Restore(previous);
        f()
    }

    /// Tenant of the enclosing `with_tenant` scope, if any
    pub fn scoped_tenant() -> Option<String> {
        CURRENT_TENANT.with(|cell| cell.borrow().clone())
    }
}

impl TenantResolver for ThreadTenantResolver {
    fn current_tenant(&self) -> String {
        Self::scoped_tenant().unwrap_or_else(|| self.fallback.clone())
    }

    fn is_multi_tenant(&self) -> bool {
        true
    }
}

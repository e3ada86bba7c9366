//! Tenant-to-storage routing.
//!
//! Dedicated tenants get their own table (`{prefix}-{tenant}`) and their own
//! index alias (`{index_prefix}-{tenant}`); rows are keyed by record id.
//! Shared tenants, marked with a leading space on the tenant id, live in the
//! configured shared table and shared index; their row keys are prefixed with
//! the trimmed tenant name and every row carries `appid` for partitioning.

use crate::config::StoreConfig;
use crate::types::is_shared_tenant;

/// Name of the secondary index on shared tables, partitioned by `appid` and
/// sorted by `id`.
pub const SHARED_PARTITION_INDEX: &str = "appid-id-index";

/// Separator between tenant name and id in shared row keys.
pub const SHARED_KEY_SEPARATOR: char = '_';

/// Where a tenant's rows or documents physically live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Table name, or index alias / shared index name.
    pub unit: String,
    /// Logical tenant name (trimmed), the partition value in shared storage.
    pub partition: String,
    pub shared: bool,
}

impl Route {
    /// Physical row key for a record id under this route.
    ///
    /// Shared keys are `{tenant}_{id}` with no escaping, so they are not
    /// unique when the separator occurs in a name: tenant `a_b` with id `c`
    /// and tenant `a` with id `b_c` both map to `a_b_c` and overwrite each
    /// other in the shared table. Tenant names that may contain `_` should
    /// be given dedicated storage.
    pub fn row_key(&self, id: &str) -> String {
        if self.shared {
            format!("{}{}{}", self.partition, SHARED_KEY_SEPARATOR, id)
        } else {
            id.to_string()
        }
    }

    /// Inverse of [`Route::row_key`].
    pub fn id_from_key<'a>(&self, key: &'a str) -> &'a str {
        if self.shared {
            key.strip_prefix(self.partition.as_str())
                .and_then(|rest| rest.strip_prefix(SHARED_KEY_SEPARATOR))
                .unwrap_or(key)
        } else {
            key
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenancyRouter {
    table_prefix: String,
    shared_table: String,
    index_prefix: String,
    shared_index: String,
}

impl TenancyRouter {
    pub fn new(
        table_prefix: impl Into<String>,
        shared_table: impl Into<String>,
        index_prefix: impl Into<String>,
        shared_index: impl Into<String>,
    ) -> Self {
        TenancyRouter {
            table_prefix: table_prefix.into(),
            shared_table: shared_table.into(),
            index_prefix: index_prefix.into(),
            shared_index: shared_index.into(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        TenancyRouter::new(
            config.table_prefix.clone(),
            config.shared_table.clone(),
            config.index_prefix.clone(),
            config.shared_index.clone(),
        )
    }

    pub fn is_shared(&self, tenant_id: &str) -> bool {
        is_shared_tenant(tenant_id)
    }

    pub fn table_route(&self, tenant_id: &str) -> Route {
        self.route(tenant_id, &self.table_prefix, &self.shared_table)
    }

    pub fn index_route(&self, tenant_id: &str) -> Route {
        self.route(tenant_id, &self.index_prefix, &self.shared_index)
    }

    pub fn shared_table(&self) -> &str {
        &self.shared_table
    }

    pub fn shared_index(&self) -> &str {
        &self.shared_index
    }

    fn route(&self, tenant_id: &str, prefix: &str, shared_unit: &str) -> Route {
        let partition = tenant_id.trim().to_string();
        if self.is_shared(tenant_id) {
            Route {
                unit: shared_unit.to_string(),
                partition,
                shared: true,
            }
        } else {
            Route {
                unit: dedicated_name(prefix, &partition),
                partition,
                shared: false,
            }
        }
    }
}

fn dedicated_name(prefix: &str, tenant: &str) -> String {
    if prefix.is_empty() {
        tenant.to_string()
    } else {
        format!("{}-{}", prefix, tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> TenancyRouter {
        TenancyRouter::new("tbl", "tbl-shared", "idx", "idx-shared")
    }

    #[test]
    fn test_dedicated_route() {
        let r = router().table_route("acme");
        assert_eq!(r.unit, "tbl-acme");
        assert!(!r.shared);
        assert_eq!(r.row_key("42"), "42");
        assert_eq!(router().index_route("acme").unit, "idx-acme");
    }

    #[test]
    fn test_shared_route() {
        let r = router().table_route(" acme");
        assert_eq!(r.unit, "tbl-shared");
        assert_eq!(r.partition, "acme");
        assert_eq!(r.row_key("42"), "acme_42");
        assert_eq!(r.id_from_key("acme_42"), "42");

        let joined = router().table_route(" a_b");
        let plain = router().table_route(" a");
        assert_eq!(joined.row_key("c"), plain.row_key("b_c"));
        assert_eq!(router().index_route(" acme").unit, "idx-shared");
    }

    #[test]
    fn test_shared_keys_do_not_collide_across_tenants() {
        let a = router().table_route(" a");
        let b = router().table_route(" b");
        assert_ne!(a.row_key("1"), b.row_key("1"));
        assert_eq!(a.unit, b.unit);
    }

    #[test]
    fn test_empty_prefix() {
        let r = TenancyRouter::new("", "s", "", "s").table_route("acme");
        assert_eq!(r.unit, "acme");
    }
}

//! # Shortstack
//!
//! A multi-tenant object store with a companion search index. Records are
//! persisted through one of several interchangeable backends (a wide-column
//! table service, embedded SQLite, the search index itself, or in-process
//! maps) and searched through a tantivy index kept per tenant.
//!
//! Tenants either get dedicated storage or share one table and one index with
//! other tenants; a leading space on the tenant id selects shared storage.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use shortstack::{BackendKind, ObjectStore, Record, Shortstack, StoreConfig, Tenant};
//! use shortstack::search::SearchEngine;
//! use shortstack::Pager;
//!
//! # async fn run() -> shortstack::Result<()> {
//! let config = StoreConfig::default()
//!     .with_backend(BackendKind::Sqlite)
//!     .with_data_dir("./data");
//! let app = Shortstack::open(config)?;
//! app.create_tenant(&Tenant::new("acme")).await?;
//!
//! let mut car = Record::new("car").with_name("Red Sedan");
//! let id = app.put("acme", &mut car).await?;
//!
//! let stored = app.store().read("acme", id.as_deref().unwrap_or_default()).await?;
//! let hits = app.search().find_query("acme", Some("car"), "sedan", &mut Pager::new(10)).await;
//! # let _ = (stored, hits);
//! app.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! | Feature | Dependencies | Use case |
//! |---------|-------------|----------|
//! | `sqlite` | rusqlite | Embedded SQLite backend |
//!
//! `sqlite` is enabled by default.

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod search;
pub mod store;
pub mod tenancy;
pub mod types;

pub use client::{CancelSignal, ClientHandle};
pub use config::{BackendKind, StoreConfig};
pub use error::{Result, ShortstackError};
pub use lifecycle::{BackgroundJob, TenantLifecycle, TenantListener};
pub use manager::Shortstack;
pub use search::{IndexLifecycle, SearchEngine, TantivySearch};
pub use store::{Backend, ObjectStore};
pub use tenancy::{Route, TenancyRouter};
pub use types::*;

// SPDX-License-Identifier: PMPL-1.0-or-later
//! PlanScope Service
//!
//! Source-aware query performance data for PlanScope.
//!
//! Reads top-query statistics and plan documents from either the historical
//! query store or the live diagnostic views, with retry, one-step fallback,
//! row sanitation, sensitive-data masking and layered result caches.

pub mod cache;
pub mod capability;
pub mod config;
pub mod error;
pub mod model;
pub mod observability;
pub mod refresher;
pub mod retry;
pub mod sanitize;
pub mod service;
pub mod templates;
pub mod transport;

pub use capability::{CapabilityProfile, Feature, SourceCapabilityResolver};
pub use config::{RetryPolicy, ServiceConfig};
pub use error::{classify, ErrorKind, ServiceError, TransportError};
pub use model::{
    DataSource, PermissionStatus, Priority, QueryStats, SortField, SourceState, SourceStatus,
    TopQueriesFilter, TopQueriesPage,
};
pub use observability::{Observability, ObservabilitySnapshot, RequestOutcome};
pub use refresher::BackgroundRefresher;
pub use retry::{AttemptOutcome, CancelCheck, FetchAttemptResult, RetryError, RetryExecutor};
pub use service::QueryPerformanceDataService;
pub use templates::{QueryTemplates, StaticTemplates};
pub use transport::{ParamValue, Params, QueryTransport, Row};

pub mod audit;
pub mod broker;
pub mod config;
pub mod http;
pub mod labels;

pub use audit::AuditMetricsImpl;
pub use broker::BrokerMetricsImpl;
pub use config::MetricsConfig;
pub use http::MetricsServer;
pub use labels::{BoundedLabel, LabelPolicy};

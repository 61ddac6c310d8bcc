pub mod commission;
pub mod coupon;
pub mod database;
pub mod events;
pub mod gateway;
pub mod metrics;
pub mod tax;

pub use database::Database;
pub use events::{AuditSink, EventSink, TracingSink};
pub use gateway::{PaymentGateway, WebhookVerifier};
pub use metrics::{get_metrics, init_metrics};
pub use tax::{compute_tax, TaxBreakdown};

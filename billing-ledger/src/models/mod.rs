pub mod coupon;
pub mod invoice;
pub mod partner;
pub mod payment;
pub mod plan;
pub mod subscription;
pub mod usage;

pub use coupon::{Coupon, CouponRedemption, CouponValidation, CreateCoupon, DiscountType};
pub use invoice::{
    GenerateInvoiceRequest, GenerateUsageInvoiceRequest, Invoice, InvoiceStatus, InvoiceWithLines,
    LineItem, ListInvoicesFilter, MarkPaidRequest,
};
pub use partner::{
    Commission, CommissionStatus, CommissionType, ComputeCommissionRequest, CreatePartner,
    Partner, UpdateCommissionRequest,
};
pub use payment::{ListPaymentsFilter, Payment, PaymentStatus, RecordPaymentRequest};
pub use plan::{BillingCycle, CreatePlan, ListPlansFilter, Plan, UpdatePlan};
pub use subscription::{
    transition, CancelSubscriptionRequest, CreateSubscriptionRequest, ListSubscriptionsFilter,
    Subscription, SubscriptionEvent, SubscriptionStatus,
};
pub use usage::{ListUsageFilter, RecordUsage, RecordUsageBatch, UsageRecord, UsageSummary};

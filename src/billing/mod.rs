pub mod domain;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod store;
pub mod types;
pub mod verifier;

pub use error::{BillingError, BillingResult};
pub use runtime::{BillingDriver, BillingHandle, BillingListener, BillingSession};
pub use types::{
    FlowContext, ProductDetails, ProductId, ProductKind, PurchaseRecord, PurchaseState,
    PurchaseToken, ResponseCode,
};

use thiserror::Error;

use crate::billing::types::{ProductId, ProductKind, PurchaseToken, ResponseCode};

/// Errors surfaced by the billing core.
///
/// None of these is fatal to the process: every one degrades to either
/// "skip this record" or "retry on the next refresh cycle".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    #[error("unknown product {0}")]
    UnknownProduct(ProductId),

    #[error("product {id} already registered as {existing}")]
    DuplicateProduct { id: ProductId, existing: ProductKind },

    #[error("invalid signature on purchase {token}")]
    InvalidSignature { token: PurchaseToken },

    #[error("purchase {token} mixes consumable and non-consumable products: {products:?}")]
    MixedConsumabilityBundle {
        token: PurchaseToken,
        products: Vec<ProductId>,
    },

    #[error("store returned {code} for {operation}")]
    Provider {
        code: ResponseCode,
        operation: &'static str,
    },

    #[error("connection to the store service was lost")]
    ConnectionLost,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BillingError {
    /// Whether the next natural refresh cycle (or a reconnect) may clear this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Provider { .. } | BillingError::ConnectionLost
        )
    }
}

pub type BillingResult<T> = std::result::Result<T, BillingError>;

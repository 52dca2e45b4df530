use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a product known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Opaque provider-issued purchase token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseToken(String);

impl PurchaseToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PurchaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PurchaseToken {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Catalog partition a product belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Regular,
    Subscription,
}

impl ProductKind {
    pub const ALL: [ProductKind; 2] = [ProductKind::Regular, ProductKind::Subscription];
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductKind::Regular => f.write_str("regular"),
            ProductKind::Subscription => f.write_str("subscription"),
        }
    }
}

/// Per-product purchase state, ordered by trust.
///
/// Only `PurchasedAndAcknowledged` grants entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub enum PurchaseState {
    #[default]
    Unpurchased,
    Pending,
    Purchased,
    PurchasedAndAcknowledged,
}

/// Status as reported by the provider (or recovered from its raw payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPurchaseState {
    #[default]
    Unspecified,
    Purchased,
    Pending,
}

/// A purchase as returned by the store service.
///
/// May cover several products at once (a bundle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub token: PurchaseToken,
    pub products: Vec<ProductId>,
    /// Raw provider payload; the signature is computed over these bytes.
    pub original_json: String,
    pub signature: String,
    pub provider_state: ProviderPurchaseState,
    pub acknowledged: bool,
    pub purchase_time_ms: i64,
    pub order_id: Option<String>,
}

impl PurchaseRecord {
    pub fn covers(&self, id: &ProductId) -> bool {
        self.products.iter().any(|p| p == id)
    }
}

/// Descriptive details for a product, as returned by a details query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDetails {
    pub product_id: ProductId,
    pub kind: ProductKind,
    pub title: String,
    pub price: String,
    pub description: String,
}

/// Opaque host handle (window, activity, ...) the purchase flow is launched from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowContext(pub String);

/// Provider response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    UserCanceled,
    ServiceUnavailable,
    BillingUnavailable,
    ItemUnavailable,
    DeveloperError,
    Error,
    ItemAlreadyOwned,
    ItemNotOwned,
    ServiceDisconnected,
    ServiceTimeout,
    FeatureNotSupported,
    Unknown(i32),
}

impl ResponseCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ResponseCode::Ok,
            1 => ResponseCode::UserCanceled,
            2 => ResponseCode::ServiceUnavailable,
            3 => ResponseCode::BillingUnavailable,
            4 => ResponseCode::ItemUnavailable,
            5 => ResponseCode::DeveloperError,
            6 => ResponseCode::Error,
            7 => ResponseCode::ItemAlreadyOwned,
            8 => ResponseCode::ItemNotOwned,
            -1 => ResponseCode::ServiceDisconnected,
            -3 => ResponseCode::ServiceTimeout,
            -2 => ResponseCode::FeatureNotSupported,
            other => ResponseCode::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ResponseCode::Ok => 0,
            ResponseCode::UserCanceled => 1,
            ResponseCode::ServiceUnavailable => 2,
            ResponseCode::BillingUnavailable => 3,
            ResponseCode::ItemUnavailable => 4,
            ResponseCode::DeveloperError => 5,
            ResponseCode::Error => 6,
            ResponseCode::ItemAlreadyOwned => 7,
            ResponseCode::ItemNotOwned => 8,
            ResponseCode::ServiceDisconnected => -1,
            ResponseCode::ServiceTimeout => -3,
            ResponseCode::FeatureNotSupported => -2,
            ResponseCode::Unknown(c) => c,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }

    /// Codes a details or purchase query is not expected to ever return.
    pub fn is_unexpected_for_query(self) -> bool {
        matches!(
            self,
            ResponseCode::FeatureNotSupported
                | ResponseCode::ItemAlreadyOwned
                | ResponseCode::ItemNotOwned
                | ResponseCode::Unknown(_)
        )
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

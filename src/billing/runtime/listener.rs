use crate::billing::types::{ProductDetails, ProductKind, PurchaseRecord, ResponseCode};

/// Optional host hooks, called with the raw store answers after the session
/// has processed them.
pub trait BillingListener: Send {
    fn on_details_response(&mut self, _code: ResponseCode, _details: &[ProductDetails]) {}

    fn on_refresh_purchases(&mut self, _kind: ProductKind, _purchases: &[PurchaseRecord]) {}

    /// Also called with `None` when a plain purchase flow fails to launch.
    fn on_purchases_updated(&mut self, _code: ResponseCode, _purchases: Option<&[PurchaseRecord]>) {}
}

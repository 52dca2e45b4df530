use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::billing::types::{
    FlowContext, ProductDetails, ProductId, ProductKind, PurchaseRecord, PurchaseToken,
    ResponseCode,
};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Correlates a store response with the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Generates a unique, monotonically increasing request id.
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Identity of one connection attempt. Setup and disconnect events name the
/// attempt they belong to, so events of a superseded attempt can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// What to buy, and which held subscription it replaces (upgrade flow).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowParams {
    pub details: ProductDetails,
    pub replaces: Option<PurchaseToken>,
}

/// Everything the store service can report back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    SetupFinished {
        connection: ConnectionId,
        code: ResponseCode,
    },
    Disconnected {
        connection: ConnectionId,
    },
    DetailsResponse {
        request: RequestId,
        code: ResponseCode,
        details: Vec<ProductDetails>,
    },
    PurchasesResponse {
        request: RequestId,
        code: ResponseCode,
        purchases: Vec<PurchaseRecord>,
    },
    AcknowledgeResponse {
        request: RequestId,
        code: ResponseCode,
    },
    ConsumeResponse {
        request: RequestId,
        code: ResponseCode,
    },
    /// Unsolicited push, typically the outcome of a purchase flow.
    PurchasesUpdated {
        code: ResponseCode,
        purchases: Option<Vec<PurchaseRecord>>,
    },
}

/// Minimal store-service interface used by the session.
///
/// Requests are fire-and-forget; their answers come back through
/// [`StoreApi::poll_event`], on the session's own thread.
pub trait StoreApi {
    fn start_connection(&mut self, connection: ConnectionId);

    fn end_connection(&mut self);

    fn query_details(&mut self, request: RequestId, kind: ProductKind, ids: &[ProductId]);

    fn query_purchases(&mut self, request: RequestId, kind: ProductKind);

    fn acknowledge(&mut self, request: RequestId, token: &PurchaseToken);

    fn consume(&mut self, request: RequestId, token: &PurchaseToken);

    /// Starts the provider's purchase UI. Only the launch itself is reported
    /// here; the purchase outcome arrives later as `PurchasesUpdated`.
    fn launch_flow(&mut self, context: &FlowContext, params: &FlowParams) -> ResponseCode;

    /// Non-blocking poll: returns the next pending event (if any).
    fn poll_event(&mut self) -> Option<StoreEvent>;
}

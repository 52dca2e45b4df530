use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::api::{ConnectionId, FlowParams, RequestId, StoreApi, StoreEvent};
use crate::billing::types::{
    FlowContext, ProductDetails, ProductId, ProductKind, PurchaseRecord, PurchaseToken,
    ResponseCode,
};

/// A request the mock received, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    StartConnection(ConnectionId),
    EndConnection,
    QueryDetails {
        request: RequestId,
        kind: ProductKind,
        ids: Vec<ProductId>,
    },
    QueryPurchases {
        request: RequestId,
        kind: ProductKind,
    },
    Acknowledge {
        request: RequestId,
        token: PurchaseToken,
    },
    Consume {
        request: RequestId,
        token: PurchaseToken,
    },
    LaunchFlow {
        product: ProductId,
        replaces: Option<PurchaseToken>,
    },
}

/// Scripted store state behind a [`MockStoreClient`].
///
/// With `auto_respond` set, every request is answered immediately from the
/// catalog/purchase fixtures below (consumed purchases disappear, acknowledged
/// ones get their flag set, like the real service). Without it, tests push
/// events by hand.
#[derive(Debug)]
pub struct MockStore {
    pub auto_respond: bool,
    pub calls: Vec<StoreCall>,
    pub events: VecDeque<StoreEvent>,

    pub details: Vec<ProductDetails>,
    pub purchases: HashMap<ProductKind, Vec<PurchaseRecord>>,

    /// Setup results for successive connection attempts; `Ok` once drained.
    pub setup_codes: VecDeque<ResponseCode>,
    pub details_code: ResponseCode,
    pub purchases_code: ResponseCode,
    pub acknowledge_code: ResponseCode,
    pub consume_code: ResponseCode,
    pub launch_code: ResponseCode,

    /// Outcomes delivered (as `PurchasesUpdated`) after successful launches.
    pub flow_results: VecDeque<(ResponseCode, Option<Vec<PurchaseRecord>>)>,

    pub connection: Option<ConnectionId>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self {
            auto_respond: true,
            calls: Vec::new(),
            events: VecDeque::new(),
            details: Vec::new(),
            purchases: HashMap::new(),
            setup_codes: VecDeque::new(),
            details_code: ResponseCode::Ok,
            purchases_code: ResponseCode::Ok,
            acknowledge_code: ResponseCode::Ok,
            consume_code: ResponseCode::Ok,
            launch_code: ResponseCode::Ok,
            flow_results: VecDeque::new(),
            connection: None,
        }
    }
}

impl MockStore {
    fn find_purchase_mut(&mut self, token: &PurchaseToken) -> Option<&mut PurchaseRecord> {
        self.purchases
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|p| &p.token == token)
    }

    /// Simulates the service dropping the current connection.
    pub fn drop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.events.push_back(StoreEvent::Disconnected { connection });
        }
    }

    pub fn add_purchase(&mut self, kind: ProductKind, purchase: PurchaseRecord) {
        self.purchases.entry(kind).or_default().push(purchase);
    }

    pub fn count_calls(&self, pred: impl Fn(&StoreCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(*c)).count()
    }

    /// Id of the most recent request matching `pred`.
    pub fn last_request(&self, pred: impl Fn(&StoreCall) -> bool) -> Option<RequestId> {
        self.calls.iter().rev().filter(|c| pred(*c)).find_map(|c| match c {
            StoreCall::QueryDetails { request, .. }
            | StoreCall::QueryPurchases { request, .. }
            | StoreCall::Acknowledge { request, .. }
            | StoreCall::Consume { request, .. } => Some(*request),
            _ => None,
        })
    }
}

/// Pure in-memory store for tests and demos. Cloning shares the same store.
#[derive(Debug, Clone, Default)]
pub struct MockStoreClient {
    inner: Arc<Mutex<MockStore>>,
}

impl MockStoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that only records calls; responses are pushed by the test.
    pub fn manual() -> Self {
        let client = Self::default();
        client.store().auto_respond = false;
        client
    }

    pub fn store(&self) -> MutexGuard<'_, MockStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_event(&self, event: StoreEvent) {
        self.store().events.push_back(event);
    }
}

impl StoreApi for MockStoreClient {
    fn start_connection(&mut self, connection: ConnectionId) {
        let mut s = self.store();
        s.calls.push(StoreCall::StartConnection(connection));
        if !s.auto_respond {
            return;
        }
        let code = s.setup_codes.pop_front().unwrap_or(ResponseCode::Ok);
        if code.is_ok() {
            s.connection = Some(connection);
        }
        s.events.push_back(StoreEvent::SetupFinished { connection, code });
    }

    fn end_connection(&mut self) {
        let mut s = self.store();
        s.calls.push(StoreCall::EndConnection);
        s.connection = None;
    }

    fn query_details(&mut self, request: RequestId, kind: ProductKind, ids: &[ProductId]) {
        let mut s = self.store();
        s.calls.push(StoreCall::QueryDetails {
            request,
            kind,
            ids: ids.to_vec(),
        });
        if !s.auto_respond {
            return;
        }
        let code = s.details_code;
        let details = if code.is_ok() {
            s.details
                .iter()
                .filter(|d| d.kind == kind && ids.contains(&d.product_id))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        s.events.push_back(StoreEvent::DetailsResponse {
            request,
            code,
            details,
        });
    }

    fn query_purchases(&mut self, request: RequestId, kind: ProductKind) {
        let mut s = self.store();
        s.calls.push(StoreCall::QueryPurchases { request, kind });
        if !s.auto_respond {
            return;
        }
        let code = s.purchases_code;
        let purchases = if code.is_ok() {
            s.purchases.get(&kind).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };
        s.events.push_back(StoreEvent::PurchasesResponse {
            request,
            code,
            purchases,
        });
    }

    fn acknowledge(&mut self, request: RequestId, token: &PurchaseToken) {
        let mut s = self.store();
        s.calls.push(StoreCall::Acknowledge {
            request,
            token: token.clone(),
        });
        if !s.auto_respond {
            return;
        }
        let code = s.acknowledge_code;
        if code.is_ok() {
            if let Some(p) = s.find_purchase_mut(token) {
                p.acknowledged = true;
            }
        }
        s.events
            .push_back(StoreEvent::AcknowledgeResponse { request, code });
    }

    fn consume(&mut self, request: RequestId, token: &PurchaseToken) {
        let mut s = self.store();
        s.calls.push(StoreCall::Consume {
            request,
            token: token.clone(),
        });
        if !s.auto_respond {
            return;
        }
        let code = s.consume_code;
        if code.is_ok() {
            for list in s.purchases.values_mut() {
                list.retain(|p| &p.token != token);
            }
        }
        s.events.push_back(StoreEvent::ConsumeResponse { request, code });
    }

    fn launch_flow(&mut self, _context: &FlowContext, params: &FlowParams) -> ResponseCode {
        let mut s = self.store();
        s.calls.push(StoreCall::LaunchFlow {
            product: params.details.product_id.clone(),
            replaces: params.replaces.clone(),
        });
        let code = s.launch_code;
        if code.is_ok() && s.auto_respond {
            if let Some((code, purchases)) = s.flow_results.pop_front() {
                if let Some(list) = &purchases {
                    let kind = params.details.kind;
                    for p in list {
                        s.add_purchase(kind, p.clone());
                    }
                }
                s.events
                    .push_back(StoreEvent::PurchasesUpdated { code, purchases });
            }
        }
        code
    }

    fn poll_event(&mut self) -> Option<StoreEvent> {
        self.store().events.pop_front()
    }
}

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::billing::domain::{EventNotifier, ProductCatalog, ReconnectBackoff};
use crate::billing::engine::{PurchaseReconciler, ReconcileCommand, ReconcileOutcome};
use crate::billing::error::{BillingError, BillingResult};
use crate::billing::runtime::listener::BillingListener;
use crate::billing::store::{ConnectionId, FlowParams, RequestId, StoreApi, StoreEvent};
use crate::billing::types::{
    FlowContext, ProductDetails, ProductId, ProductKind, PurchaseRecord, PurchaseToken,
    ResponseCode,
};

/// Details older than this are re-queried when someone starts observing them.
pub const DEFAULT_DETAILS_STALE_AFTER: Duration = Duration::from_secs(4 * 60 * 60);

/// Where the session stands with the store service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting(ConnectionId),
    Connected(ConnectionId),
}

/// Why a request was sent; decides what its answer means.
#[derive(Debug, Clone)]
enum PendingRequest {
    Details {
        kind: ProductKind,
    },
    Refresh {
        kind: ProductKind,
    },
    ConsumeLookup {
        product: ProductId,
    },
    UpgradeLookup {
        context: FlowContext,
        product: ProductId,
        upgrade_from: Vec<ProductId>,
    },
    Acknowledge {
        token: PurchaseToken,
    },
    Consume {
        token: PurchaseToken,
    },
}

impl PendingRequest {
    fn runs_to_completion(&self) -> bool {
        matches!(
            self,
            PendingRequest::Acknowledge { .. } | PendingRequest::Consume { .. }
        )
    }
}

/// **BillingSession**
///
/// The imperative shell around the [`PurchaseReconciler`]. It:
/// 1. **Owns the connection** to the store service and keeps it alive with a
///    backoff reconnect loop that never gives up.
/// 2. **Correlates** every store answer with the request that caused it, and
///    drops answers belonging to a connection that is gone.
/// 3. **Executes** the acknowledge/consume commands the reconciler emits.
///
/// It is single-owner: all store callbacks are drained on the caller's thread
/// through [`BillingSession::tick_at`], so shared state needs no locking.
pub struct BillingSession<C> {
    client: C,
    reconciler: PurchaseReconciler,
    backoff: ReconnectBackoff,

    connection: ConnectionState,
    reconnect_at: Option<Instant>,
    shut_down: bool,

    /// Requests sent on the current connection and not yet answered.
    inflight: HashMap<RequestId, PendingRequest>,

    /// When the last successful details response arrived.
    details_fetched_at: Option<Instant>,
    details_stale_after: Duration,

    listener: Option<Box<dyn BillingListener>>,

    /// Start time for logging relative timestamps.
    t0: Instant,
}

impl<C: StoreApi> BillingSession<C> {
    pub fn new(client: C, reconciler: PurchaseReconciler, backoff: ReconnectBackoff) -> Self {
        Self {
            client,
            reconciler,
            backoff,
            connection: ConnectionState::Disconnected,
            reconnect_at: None,
            shut_down: false,
            inflight: HashMap::new(),
            details_fetched_at: None,
            details_stale_after: DEFAULT_DETAILS_STALE_AFTER,
            listener: None,
            t0: Instant::now(),
        }
    }

    pub fn with_details_stale_after(mut self, stale_after: Duration) -> Self {
        self.details_stale_after = stale_after;
        self
    }

    /// Register host callbacks for raw store responses.
    pub fn with_listener<L: BillingListener + 'static>(mut self, listener: L) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    fn t(&self) -> u128 {
        self.t0.elapsed().as_micros()
    }

    fn info(&self, msg: &str) {
        log::info!("[SESSION] {:>8}us: {}", self.t(), msg);
    }

    fn debug(&self, msg: &str) {
        log::debug!("[SESSION] {:>8}us: {}", self.t(), msg);
    }

    fn error(&self, msg: &str) {
        log::error!("[SESSION] {:>8}us: {}", self.t(), msg);
    }

    // ================================
    // Connection lifecycle
    // ================================

    /// Opens the first connection. Later reconnects are driven by the backoff loop.
    pub fn start(&mut self) {
        if self.shut_down {
            return;
        }
        if self.connection == ConnectionState::Disconnected && self.reconnect_at.is_none() {
            self.connect();
        }
    }

    fn connect(&mut self) {
        let id = ConnectionId::next();
        self.info(&format!("connecting ({})", id));
        self.connection = ConnectionState::Connecting(id);
        self.client.start_connection(id);
    }

    /// Tears the session down: no reconnects, no new requests, late answers ignored.
    pub fn end_connection(&mut self) {
        self.info("ending connection");
        self.shut_down = true;
        self.reconnect_at = None;
        if !self.inflight.is_empty() {
            self.debug(&format!("dropping {} unanswered requests", self.inflight.len()));
        }
        self.inflight.clear();
        self.reconciler.abandon_in_flight();
        self.connection = ConnectionState::Disconnected;
        self.client.end_connection();
    }

    /// Forgets queries sent on a lost connection. Acknowledge and consume
    /// requests run to completion, so their entries stay until answered.
    fn drop_pending_queries(&mut self) {
        let before = self.inflight.len();
        self.inflight.retain(|_, pending| pending.runs_to_completion());
        if before != self.inflight.len() {
            self.debug(&format!("dropping {} unanswered queries", before - self.inflight.len()));
        }
    }

    fn on_setup_finished(&mut self, connection: ConnectionId, code: ResponseCode, now: Instant) {
        if self.connection != ConnectionState::Connecting(connection) {
            self.debug(&format!("ignoring setup result for stale {}", connection));
            return;
        }

        if code.is_ok() {
            self.info(&format!("connected ({})", connection));
            self.connection = ConnectionState::Connected(connection);
            self.backoff.reset();
            self.query_details();
            self.refresh_purchases();
            return;
        }

        if code == ResponseCode::DeveloperError {
            self.error(&format!("setup rejected as misconfigured: {}", code));
        } else {
            self.error(&format!("setup failed: {}", code));
        }
        self.enter_disconnected(now);
    }

    fn on_disconnected(&mut self, connection: ConnectionId, now: Instant) {
        let current = match self.connection {
            ConnectionState::Connected(id) | ConnectionState::Connecting(id) => id,
            ConnectionState::Disconnected => {
                self.debug(&format!("ignoring disconnect of {} while disconnected", connection));
                return;
            }
        };
        if current != connection {
            self.debug(&format!("ignoring disconnect of stale {}", connection));
            return;
        }
        self.info(&format!("{} lost: {}", connection, BillingError::ConnectionLost));
        self.enter_disconnected(now);
    }

    fn enter_disconnected(&mut self, now: Instant) {
        self.connection = ConnectionState::Disconnected;
        self.drop_pending_queries();
        if self.shut_down {
            return;
        }
        let delay = self.backoff.next_delay();
        self.info(&format!("reconnecting in {:?}", delay));
        self.reconnect_at = Some(now + delay);
    }

    // ================================
    // Event loop
    // ================================

    /// Drains every pending store event, then fires the reconnect timer if due.
    ///
    /// Returns the number of store events processed.
    pub fn tick_at(&mut self, now: Instant) -> usize {
        let mut processed = 0;
        while let Some(event) = self.client.poll_event() {
            self.handle_store_event(event, now);
            processed += 1;
        }

        if let Some(at) = self.reconnect_at {
            if at <= now && !self.shut_down {
                self.reconnect_at = None;
                self.connect();
            }
        }
        processed
    }

    pub fn tick(&mut self) -> usize {
        self.tick_at(Instant::now())
    }

    /// Ticks until the store has nothing more to say.
    /// Mostly useful with an auto-responding mock store.
    pub fn run_until_idle(&mut self, now: Instant) {
        let mut sanity = 0;
        while self.tick_at(now) > 0 {
            sanity += 1;
            if sanity > 100 {
                log::warn!("[SESSION] run_until_idle exceeded 100 iterations, breaking");
                break;
            }
        }
    }

    pub fn handle_store_event(&mut self, event: StoreEvent, now: Instant) {
        log::trace!("[SESSION] {:>8}us: event {:?}", self.t(), event);
        match event {
            StoreEvent::SetupFinished { connection, code } => {
                self.on_setup_finished(connection, code, now)
            }
            StoreEvent::Disconnected { connection } => self.on_disconnected(connection, now),
            StoreEvent::PurchasesUpdated { code, purchases } => {
                self.on_purchases_updated(code, purchases)
            }
            StoreEvent::DetailsResponse {
                request,
                code,
                details,
            } => match self.take_request(request) {
                Some(PendingRequest::Details { kind }) => {
                    self.on_details_response(kind, code, details, now)
                }
                other => self.unexpected(request, other),
            },
            StoreEvent::PurchasesResponse {
                request,
                code,
                purchases,
            } => match self.take_request(request) {
                Some(PendingRequest::Refresh { kind }) => self.on_refresh(kind, code, purchases),
                Some(PendingRequest::ConsumeLookup { product }) => {
                    self.on_consume_lookup(product, code, purchases)
                }
                Some(PendingRequest::UpgradeLookup {
                    context,
                    product,
                    upgrade_from,
                }) => self.on_upgrade_lookup(context, product, upgrade_from, code, purchases),
                other => self.unexpected(request, other),
            },
            StoreEvent::AcknowledgeResponse { request, code } => match self.take_request(request) {
                Some(PendingRequest::Acknowledge { token }) => {
                    self.reconciler.on_acknowledge_result(&token, code)
                }
                other => self.unexpected(request, other),
            },
            StoreEvent::ConsumeResponse { request, code } => match self.take_request(request) {
                Some(PendingRequest::Consume { token }) => {
                    self.reconciler.on_consume_result(&token, code)
                }
                other => self.unexpected(request, other),
            },
        }
    }

    fn take_request(&mut self, request: RequestId) -> Option<PendingRequest> {
        self.inflight.remove(&request)
    }

    fn unexpected(&self, request: RequestId, pending: Option<PendingRequest>) {
        match pending {
            None => self.debug(&format!("ignoring answer to unknown or stale {}", request)),
            Some(p) => self.error(&format!("answer to {} does not match request {:?}", request, p)),
        }
    }

    /// Sends a request on the current connection and remembers why.
    fn send(&mut self, pending: PendingRequest, ids: &[ProductId]) {
        let request = RequestId::next();
        log::trace!("[SESSION] {:>8}us: send {} {:?}", self.t(), request, pending);
        match &pending {
            PendingRequest::Details { kind } => self.client.query_details(request, *kind, ids),
            PendingRequest::Refresh { kind } => self.client.query_purchases(request, *kind),
            PendingRequest::ConsumeLookup { .. } => {
                self.client.query_purchases(request, ProductKind::Regular)
            }
            PendingRequest::UpgradeLookup { .. } => {
                self.client.query_purchases(request, ProductKind::Subscription)
            }
            PendingRequest::Acknowledge { token } => self.client.acknowledge(request, token),
            PendingRequest::Consume { token } => self.client.consume(request, token),
        }
        self.inflight.insert(request, pending);
    }

    fn execute(&mut self, outcome: ReconcileOutcome) {
        for cmd in outcome.commands {
            self.execute_command(cmd);
        }
    }

    fn execute_command(&mut self, cmd: ReconcileCommand) {
        match cmd {
            ReconcileCommand::Acknowledge(token) => {
                self.send(PendingRequest::Acknowledge { token }, &[])
            }
            ReconcileCommand::Consume(token) => self.send(PendingRequest::Consume { token }, &[]),
        }
    }

    // ================================
    // Host commands
    // ================================

    pub fn is_connected(&self) -> bool {
        matches!(self.connection, ConnectionState::Connected(_))
    }

    fn require_connection(&self, what: &str) -> bool {
        if self.is_connected() {
            return true;
        }
        self.debug(&format!("{} deferred: not connected", what));
        false
    }

    /// Queries details for every known product, one request per kind.
    pub fn query_details(&mut self) {
        if !self.require_connection("details query") {
            return;
        }
        for kind in ProductKind::ALL {
            let ids = self.reconciler.catalog().ids_of_kind(kind);
            if !ids.is_empty() {
                self.send(PendingRequest::Details { kind }, &ids);
            }
        }
    }

    /// Re-reads the active purchases of every kind and reconciles them.
    pub fn refresh_purchases(&mut self) {
        if !self.require_connection("purchase refresh") {
            return;
        }
        self.debug("refreshing purchases");
        for kind in ProductKind::ALL {
            self.send(PendingRequest::Refresh { kind }, &[]);
        }
    }

    /// Host came back to the foreground.
    ///
    /// Skipped while a purchase flow is open: its own update will follow.
    pub fn resume(&mut self) {
        if self.is_connected() && !self.reconciler.notifier().flow_in_progress() {
            self.refresh_purchases();
        }
    }

    /// Starts observing a product's details, re-querying them if stale.
    pub fn observe_details(
        &mut self,
        id: &ProductId,
        now: Instant,
    ) -> BillingResult<watch::Receiver<Option<ProductDetails>>> {
        let rx = self.reconciler.catalog().watch_details(id)?;
        self.check_details_freshness(now);
        Ok(rx)
    }

    pub fn check_details_freshness(&mut self, now: Instant) {
        let fresh = self
            .details_fetched_at
            .is_some_and(|at| now.saturating_duration_since(at) <= self.details_stale_after);
        if !fresh {
            self.debug("product details not fresh, requerying");
            self.details_fetched_at = Some(now);
            self.query_details();
        }
    }

    /// Consumes the held purchase covering `product`.
    pub fn consume_product(&mut self, product: &ProductId) -> BillingResult<()> {
        if !self.reconciler.catalog().contains(product) {
            return Err(BillingError::UnknownProduct(product.clone()));
        }
        if self.require_connection("consume") {
            self.send(
                PendingRequest::ConsumeLookup {
                    product: product.clone(),
                },
                &[],
            );
        }
        Ok(())
    }

    /// Launches the provider purchase flow for `product`.
    ///
    /// With `upgrade_from` set, the held subscription among those ids is
    /// replaced by the new one. Nothing is launched unless exactly one of
    /// them is held.
    pub fn launch_purchase(
        &mut self,
        context: FlowContext,
        product: &ProductId,
        upgrade_from: &[ProductId],
    ) -> BillingResult<()> {
        let Some(details) = self.reconciler.catalog().details(product)? else {
            self.error(&format!("details not found for {}", product));
            return Ok(());
        };

        if upgrade_from.is_empty() {
            self.launch(&context, details, None);
            return Ok(());
        }

        if self.require_connection("upgrade lookup") {
            self.send(
                PendingRequest::UpgradeLookup {
                    context,
                    product: product.clone(),
                    upgrade_from: upgrade_from.to_vec(),
                },
                &[],
            );
        }
        Ok(())
    }

    fn launch(&mut self, context: &FlowContext, details: ProductDetails, replaces: Option<PurchaseToken>) {
        let upgrade = replaces.is_some();
        let params = FlowParams { details, replaces };
        let code = self.client.launch_flow(context, &params);
        if code.is_ok() {
            self.info(&format!("purchase flow launched for {}", params.details.product_id));
            self.reconciler.notifier().set_flow_in_progress(true);
            return;
        }

        self.error(&format!("billing failed: {}", code));
        if !upgrade {
            if let Some(l) = self.listener.as_mut() {
                l.on_purchases_updated(code, None);
            }
        }
    }

    // ================================
    // Store answers
    // ================================

    fn on_details_response(
        &mut self,
        kind: ProductKind,
        code: ResponseCode,
        details: Vec<ProductDetails>,
        now: Instant,
    ) {
        if code.is_ok() {
            self.info(&format!("{} details response: {} items", kind, details.len()));
            if details.is_empty() {
                self.error(
                    "found no product details; check the products are published in the store console",
                );
            }
            for d in &details {
                log::debug!("[SESSION] received details for {}", d.product_id);
                if let Err(e) = self.reconciler.catalog().set_details(&d.product_id, d.clone()) {
                    self.error(&e.to_string());
                }
            }
            self.details_fetched_at = Some(now);
        } else {
            if code == ResponseCode::UserCanceled {
                self.info(&format!("details query: {}", code));
            } else if code.is_unexpected_for_query() {
                self.error(&format!("details query, unexpected code: {}", code));
            } else {
                self.error(&format!("details query: {}", code));
            }
            self.details_fetched_at = None;
        }

        if let Some(l) = self.listener.as_mut() {
            l.on_details_response(code, &details);
        }
    }

    fn on_refresh(&mut self, kind: ProductKind, code: ResponseCode, purchases: Vec<PurchaseRecord>) {
        if !code.is_ok() {
            self.error(&format!("problem getting {} purchases: {}", kind, code));
            return;
        }

        let expected = self.reconciler.catalog().ids_of_kind(kind);
        let outcome = self.reconciler.reconcile(&purchases, Some(&expected));
        self.execute(outcome);

        if let Some(l) = self.listener.as_mut() {
            l.on_refresh_purchases(kind, &purchases);
        }
    }

    fn on_consume_lookup(&mut self, product: ProductId, code: ResponseCode, purchases: Vec<PurchaseRecord>) {
        if !code.is_ok() {
            self.error(&format!("problem getting purchases: {}", code));
            return;
        }

        let Some(purchase) = purchases.iter().find(|p| p.covers(&product)) else {
            self.error(&format!("unable to consume {}: no purchase found", product));
            return;
        };

        match self.reconciler.consume(purchase) {
            Ok(Some(cmd)) => self.execute_command(cmd),
            Ok(None) => {}
            Err(e) => self.error(&format!("unable to consume {}: {}", product, e)),
        }
    }

    fn on_upgrade_lookup(
        &mut self,
        context: FlowContext,
        product: ProductId,
        upgrade_from: Vec<ProductId>,
        code: ResponseCode,
        purchases: Vec<PurchaseRecord>,
    ) {
        let candidates: BTreeSet<&ProductId> = upgrade_from.iter().collect();
        let held: Vec<&PurchaseRecord> = if code.is_ok() {
            purchases
                .iter()
                .filter(|p| p.products.iter().any(|id| candidates.contains(id)))
                .collect()
        } else {
            self.error(&format!("problem getting subscriptions: {}", code));
            Vec::new()
        };

        let details = match self.reconciler.catalog().details(&product) {
            Ok(Some(d)) => d,
            Ok(None) | Err(_) => {
                self.error(&format!("details not found for {}", product));
                return;
            }
        };

        match held.as_slice() {
            [old] => {
                let token = old.token.clone();
                self.launch(&context, details, Some(token));
            }
            [] => self.error(&format!(
                "no subscription among {:?} held, upgrade to {} not launched",
                upgrade_from, product
            )),
            many => self.error(&format!(
                "{} subscriptions held, upgrade to {} not possible",
                many.len(),
                product
            )),
        }
    }

    fn on_purchases_updated(&mut self, code: ResponseCode, purchases: Option<Vec<PurchaseRecord>>) {
        match code {
            ResponseCode::Ok => match &purchases {
                Some(_) if !self.is_connected() => {
                    self.debug("purchases updated while disconnected, left to the next refresh")
                }
                Some(list) => {
                    let outcome = self.reconciler.reconcile(list, None);
                    self.execute(outcome);
                }
                None => self.debug("null purchase list returned from OK response"),
            },
            ResponseCode::UserCanceled => self.info("purchases updated: user canceled the purchase"),
            ResponseCode::ItemAlreadyOwned => {
                self.info("purchases updated: the user already owns this item")
            }
            ResponseCode::DeveloperError => self.error(
                "purchases updated: developer error, the store does not recognize this configuration",
            ),
            other => self.debug(&format!("purchases updated: {}", other)),
        }

        self.reconciler.notifier().set_flow_in_progress(false);

        if let Some(l) = self.listener.as_mut() {
            l.on_purchases_updated(code, purchases.as_deref());
        }
    }

    // ================================
    // Introspection
    // ================================

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn backoff(&self) -> &ReconnectBackoff {
        &self.backoff
    }

    pub fn catalog(&self) -> &ProductCatalog {
        self.reconciler.catalog()
    }

    pub fn notifier(&self) -> &EventNotifier {
        self.reconciler.notifier()
    }

    pub fn reconciler(&self) -> &PurchaseReconciler {
        &self.reconciler
    }

    pub fn pending_requests(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

// Helper methods for testing interaction
#[cfg(test)]
impl<C> BillingSession<C> {
    pub fn client_ref(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }
}

#![cfg(test)]
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::billing::domain::{EventNotifier, ProductCatalog, ReconnectBackoff};
use crate::billing::engine::PurchaseReconciler;
use crate::billing::error::BillingError;
use crate::billing::runtime::{BillingDriver, BillingListener, BillingSession, ConnectionState};
use crate::billing::store::{ConnectionId, MockStoreClient, StoreCall, StoreEvent};
use crate::billing::types::{
    FlowContext, ProductDetails, ProductId, ProductKind, ProviderPurchaseState, PurchaseRecord,
    PurchaseState, PurchaseToken, ResponseCode,
};
use crate::billing::verifier::SignatureVerifier;

// --- Fixtures ---

struct FakeVerifier;

impl SignatureVerifier for FakeVerifier {
    fn verify(&self, public_key: &str, _payload: &str, signature: &str) -> bool {
        public_key == "test-key" && signature == "good"
    }
}

fn session_with(client: MockStoreClient) -> BillingSession<MockStoreClient> {
    let mut catalog = ProductCatalog::new();
    catalog.register("gem_pack".into(), ProductKind::Regular, true).unwrap();
    catalog.register("remove_ads".into(), ProductKind::Regular, false).unwrap();
    catalog.register("gold_monthly".into(), ProductKind::Subscription, false).unwrap();
    catalog.register("gold_yearly".into(), ProductKind::Subscription, false).unwrap();

    let reconciler = PurchaseReconciler::new(
        catalog,
        EventNotifier::new(),
        "test-key",
        Box::new(FakeVerifier),
    );
    BillingSession::new(
        client,
        reconciler,
        ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(8)),
    )
}

fn purchase(token: &str, products: &[&str], purchase_state: i32, signature: &str) -> PurchaseRecord {
    PurchaseRecord {
        token: PurchaseToken::new(token),
        products: products.iter().map(|p| ProductId::new(*p)).collect(),
        original_json: format!(r#"{{"purchaseToken":"{token}","purchaseState":{purchase_state}}}"#),
        signature: signature.to_string(),
        provider_state: ProviderPurchaseState::Unspecified,
        acknowledged: false,
        purchase_time_ms: 1_700_000_000_000,
        order_id: None,
    }
}

fn details(id: &str, kind: ProductKind) -> ProductDetails {
    ProductDetails {
        product_id: ProductId::new(id),
        kind,
        title: format!("{id} title"),
        price: "$0.99".to_string(),
        description: String::new(),
    }
}

fn state_of(s: &BillingSession<MockStoreClient>, id: &str) -> PurchaseState {
    s.catalog().state(&ProductId::new(id)).unwrap()
}

fn last_connection(client: &MockStoreClient) -> ConnectionId {
    client
        .store()
        .calls
        .iter()
        .rev()
        .find_map(|c| match c {
            StoreCall::StartConnection(id) => Some(*id),
            _ => None,
        })
        .unwrap()
}

/// Starts a session on a manual mock and completes its setup.
fn connect_manual(s: &mut BillingSession<MockStoreClient>, client: &MockStoreClient, now: Instant) -> ConnectionId {
    s.start();
    let connection = last_connection(client);
    client.push_event(StoreEvent::SetupFinished {
        connection,
        code: ResponseCode::Ok,
    });
    s.tick_at(now);
    connection
}

fn count(client: &MockStoreClient, pred: impl Fn(&StoreCall) -> bool) -> usize {
    client.store().count_calls(pred)
}

fn is_start(c: &StoreCall) -> bool {
    matches!(c, StoreCall::StartConnection(_))
}

fn is_purchase_query(c: &StoreCall) -> bool {
    matches!(c, StoreCall::QueryPurchases { .. })
}

fn is_details_query(c: &StoreCall) -> bool {
    matches!(c, StoreCall::QueryDetails { .. })
}

#[derive(Clone, Default)]
struct Recorder {
    updates: Arc<Mutex<Vec<(ResponseCode, bool)>>>,
}

impl BillingListener for Recorder {
    fn on_purchases_updated(&mut self, code: ResponseCode, purchases: Option<&[PurchaseRecord]>) {
        self.updates.lock().unwrap().push((code, purchases.is_some()));
    }
}

// --- Connection lifecycle ---

#[test]
fn connect_queries_details_and_purchases_per_kind() {
    let client = MockStoreClient::new();
    let mut s = session_with(client.clone());

    s.start();
    s.run_until_idle(Instant::now());

    assert!(s.is_connected());
    assert_eq!(count(&client, is_details_query), 2);
    assert_eq!(count(&client, is_purchase_query), 2);
    assert_eq!(s.pending_requests(), 0);
}

#[test]
fn setup_failure_backs_off_then_connects() {
    let client = MockStoreClient::new();
    client
        .store()
        .setup_codes
        .extend([ResponseCode::ServiceUnavailable, ResponseCode::BillingUnavailable]);
    let mut s = session_with(client.clone());
    let t0 = Instant::now();

    s.start();
    s.tick_at(t0);
    assert_eq!(s.connection_state(), ConnectionState::Disconnected);
    assert_eq!(s.reconnect_deadline(), Some(t0 + Duration::from_secs(1)));

    // not due yet
    s.tick_at(t0 + Duration::from_millis(500));
    assert_eq!(count(&client, is_start), 1);

    let t1 = t0 + Duration::from_secs(1);
    s.tick_at(t1);
    s.tick_at(t1);
    assert_eq!(count(&client, is_start), 2);
    assert_eq!(s.reconnect_deadline(), Some(t1 + Duration::from_secs(2)));

    let t2 = t1 + Duration::from_secs(2);
    s.tick_at(t2);
    s.run_until_idle(t2);
    assert!(s.is_connected());
    assert_eq!(count(&client, is_start), 3);
    assert_eq!(s.backoff().peek(), Duration::from_secs(1));
}

#[test]
fn stale_disconnect_is_ignored() {
    let client = MockStoreClient::manual();
    let mut s = session_with(client.clone());
    let now = Instant::now();
    connect_manual(&mut s, &client, now);

    client.push_event(StoreEvent::Disconnected {
        connection: ConnectionId(u64::MAX),
    });
    s.tick_at(now);

    assert!(s.is_connected());
    assert_eq!(s.reconnect_deadline(), None);
}

fn answer_regular_refresh(client: &MockStoreClient, purchases: Vec<PurchaseRecord>) {
    let request = client
        .store()
        .last_request(|c| matches!(c, StoreCall::QueryPurchases { kind: ProductKind::Regular, .. }))
        .unwrap();
    client.push_event(StoreEvent::PurchasesResponse {
        request,
        code: ResponseCode::Ok,
        purchases,
    });
}

fn is_consume(c: &StoreCall) -> bool {
    matches!(c, StoreCall::Consume { .. })
}

#[test]
fn consume_answer_after_reconnect_is_delivered_once() {
    let client = MockStoreClient::manual();
    let mut s = session_with(client.clone());
    let mut consumed = s.notifier().subscribe_consumed();
    let mut new_purchases = s.notifier().subscribe_new_purchases();
    let t0 = Instant::now();
    let connection = connect_manual(&mut s, &client, t0);

    answer_regular_refresh(&client, vec![purchase("gem-1", &["gem_pack"], 0, "good")]);
    s.tick_at(t0);
    let consume = client.store().last_request(is_consume).unwrap();
    assert_eq!(state_of(&s, "gem_pack"), PurchaseState::Purchased);

    client.push_event(StoreEvent::Disconnected { connection });
    s.tick_at(t0);
    assert_eq!(s.connection_state(), ConnectionState::Disconnected);
    // the consume keeps running; only the queries are forgotten
    assert_eq!(s.reconciler().in_flight_count(), 1);
    assert_eq!(s.pending_requests(), 1);

    let t1 = t0 + Duration::from_secs(1);
    s.tick_at(t1);
    client.push_event(StoreEvent::SetupFinished {
        connection: last_connection(&client),
        code: ResponseCode::Ok,
    });
    s.tick_at(t1);
    assert!(s.is_connected());

    // the store still lists the purchase while its consumption is pending
    answer_regular_refresh(&client, vec![purchase("gem-1", &["gem_pack"], 0, "good")]);
    s.tick_at(t1);
    assert_eq!(count(&client, is_consume), 1);

    client.push_event(StoreEvent::ConsumeResponse {
        request: consume,
        code: ResponseCode::Ok,
    });
    s.tick_at(t1);

    assert_eq!(state_of(&s, "gem_pack"), PurchaseState::Unpurchased);
    assert_eq!(consumed.try_recv().unwrap().token, PurchaseToken::new("gem-1"));
    assert_eq!(new_purchases.try_recv().unwrap().token, PurchaseToken::new("gem-1"));
    assert_eq!(s.reconciler().in_flight_count(), 0);
}

#[test]
fn teardown_ignores_late_answers() {
    let client = MockStoreClient::manual();
    let mut s = session_with(client.clone());
    let now = Instant::now();
    connect_manual(&mut s, &client, now);

    answer_regular_refresh(&client, vec![purchase("ads-1", &["remove_ads"], 0, "good")]);
    s.tick_at(now);
    let ack = client
        .store()
        .last_request(|c| matches!(c, StoreCall::Acknowledge { .. }))
        .unwrap();

    s.end_connection();
    assert_eq!(s.reconciler().in_flight_count(), 0);
    assert_eq!(s.pending_requests(), 0);

    client.push_event(StoreEvent::AcknowledgeResponse {
        request: ack,
        code: ResponseCode::Ok,
    });
    s.tick_at(now);
    assert_eq!(state_of(&s, "remove_ads"), PurchaseState::Purchased);
}

#[test]
fn purchases_update_while_disconnected_waits_for_refresh() {
    let client = MockStoreClient::manual();
    let mut s = session_with(client.clone());
    let t0 = Instant::now();
    let connection = connect_manual(&mut s, &client, t0);
    client.push_event(StoreEvent::Disconnected { connection });
    s.tick_at(t0);

    s.notifier().set_flow_in_progress(true);
    client.push_event(StoreEvent::PurchasesUpdated {
        code: ResponseCode::Ok,
        purchases: Some(vec![purchase("gem-1", &["gem_pack"], 0, "good")]),
    });
    s.tick_at(t0);

    assert!(!s.notifier().flow_in_progress());
    assert_eq!(count(&client, is_consume), 0);
    assert_eq!(s.reconciler().in_flight_count(), 0);
    assert_eq!(state_of(&s, "gem_pack"), PurchaseState::Unpurchased);

    let t1 = t0 + Duration::from_secs(1);
    s.tick_at(t1);
    client.push_event(StoreEvent::SetupFinished {
        connection: last_connection(&client),
        code: ResponseCode::Ok,
    });
    s.tick_at(t1);
    answer_regular_refresh(&client, vec![purchase("gem-1", &["gem_pack"], 0, "good")]);
    s.tick_at(t1);

    assert_eq!(count(&client, is_consume), 1);
}

#[test]
fn end_connection_stops_reconnects_and_requests() {
    let client = MockStoreClient::new();
    let mut s = session_with(client.clone());
    let now = Instant::now();
    s.start();
    s.run_until_idle(now);
    let connection = last_connection(&client);

    s.end_connection();
    assert!(s.is_shut_down());
    assert_eq!(count(&client, |c| matches!(c, StoreCall::EndConnection)), 1);

    client.push_event(StoreEvent::Disconnected { connection });
    s.tick_at(now);
    assert_eq!(s.reconnect_deadline(), None);

    s.start();
    s.refresh_purchases();
    assert_eq!(count(&client, is_start), 1);
    assert_eq!(count(&client, is_purchase_query), 2);
}

#[test]
fn requests_are_deferred_while_disconnected() {
    let client = MockStoreClient::manual();
    let mut s = session_with(client.clone());

    s.refresh_purchases();
    s.query_details();
    assert_eq!(s.consume_product(&"gem_pack".into()), Ok(()));

    assert!(client.store().calls.is_empty());
}

// --- Purchases ---

#[test]
fn refresh_acknowledges_and_notifies() {
    let client = MockStoreClient::new();
    client
        .store()
        .add_purchase(ProductKind::Regular, purchase("ads-1", &["remove_ads"], 0, "good"));
    let mut s = session_with(client.clone());
    let mut new_purchases = s.notifier().subscribe_new_purchases();

    s.start();
    s.run_until_idle(Instant::now());

    assert_eq!(state_of(&s, "remove_ads"), PurchaseState::PurchasedAndAcknowledged);
    assert_eq!(new_purchases.try_recv().unwrap().token, PurchaseToken::new("ads-1"));
    assert!(client.store().purchases[&ProductKind::Regular][0].acknowledged);
    assert_eq!(count(&client, |c| matches!(c, StoreCall::Acknowledge { .. })), 1);
}

#[test]
fn launched_consumable_is_consumed_and_delivered() {
    let client = MockStoreClient::new();
    {
        let mut store = client.store();
        store.details.push(details("gem_pack", ProductKind::Regular));
        store.flow_results.push_back((
            ResponseCode::Ok,
            Some(vec![purchase("gem-1", &["gem_pack"], 0, "good")]),
        ));
    }
    let mut s = session_with(client.clone());
    let mut consumed = s.notifier().subscribe_consumed();
    let now = Instant::now();

    s.start();
    s.run_until_idle(now);
    assert!(s.catalog().can_purchase(&"gem_pack".into()).unwrap());

    s.launch_purchase(FlowContext::default(), &"gem_pack".into(), &[]).unwrap();
    assert!(s.notifier().flow_in_progress());

    s.run_until_idle(now);
    assert!(!s.notifier().flow_in_progress());
    assert_eq!(state_of(&s, "gem_pack"), PurchaseState::Unpurchased);
    assert_eq!(consumed.try_recv().unwrap().token, PurchaseToken::new("gem-1"));
    assert!(client.store().purchases[&ProductKind::Regular].is_empty());
}

#[test]
fn launch_without_details_does_nothing() {
    let client = MockStoreClient::manual();
    let mut s = session_with(client.clone());
    connect_manual(&mut s, &client, Instant::now());

    assert_eq!(
        s.launch_purchase(FlowContext::default(), &"gem_pack".into(), &[]),
        Ok(())
    );
    assert_eq!(count(&client, |c| matches!(c, StoreCall::LaunchFlow { .. })), 0);
    assert!(!s.notifier().flow_in_progress());
}

#[test]
fn failed_launch_is_reported_to_listener() {
    let client = MockStoreClient::new();
    {
        let mut store = client.store();
        store.details.push(details("remove_ads", ProductKind::Regular));
        store.launch_code = ResponseCode::BillingUnavailable;
    }
    let recorder = Recorder::default();
    let mut s = session_with(client.clone()).with_listener(recorder.clone());
    let now = Instant::now();
    s.start();
    s.run_until_idle(now);

    s.launch_purchase(FlowContext::default(), &"remove_ads".into(), &[]).unwrap();

    assert!(!s.notifier().flow_in_progress());
    assert_eq!(
        *recorder.updates.lock().unwrap(),
        vec![(ResponseCode::BillingUnavailable, false)]
    );
}

#[test]
fn user_cancel_clears_flow_flag() {
    let client = MockStoreClient::manual();
    let mut s = session_with(client.clone());
    let now = Instant::now();
    connect_manual(&mut s, &client, now);

    s.notifier().set_flow_in_progress(true);
    client.push_event(StoreEvent::PurchasesUpdated {
        code: ResponseCode::UserCanceled,
        purchases: None,
    });
    s.tick_at(now);

    assert!(!s.notifier().flow_in_progress());
}

#[test]
fn resume_skips_refresh_during_flow() {
    let client = MockStoreClient::manual();
    let mut s = session_with(client.clone());
    connect_manual(&mut s, &client, Instant::now());
    assert_eq!(count(&client, is_purchase_query), 2);

    s.notifier().set_flow_in_progress(true);
    s.resume();
    assert_eq!(count(&client, is_purchase_query), 2);

    s.notifier().set_flow_in_progress(false);
    s.resume();
    assert_eq!(count(&client, is_purchase_query), 4);
}

// --- Upgrades ---

#[test]
fn upgrade_replaces_held_subscription() {
    let client = MockStoreClient::new();
    {
        let mut store = client.store();
        store.details.push(details("gold_yearly", ProductKind::Subscription));
        let mut monthly = purchase("monthly-1", &["gold_monthly"], 0, "good");
        monthly.acknowledged = true;
        store.add_purchase(ProductKind::Subscription, monthly);
        store.flow_results.push_back((
            ResponseCode::Ok,
            Some(vec![purchase("yearly-1", &["gold_yearly"], 0, "good")]),
        ));
    }
    let mut s = session_with(client.clone());
    let now = Instant::now();
    s.start();
    s.run_until_idle(now);

    s.launch_purchase(FlowContext::default(), &"gold_yearly".into(), &["gold_monthly".into()])
        .unwrap();
    s.run_until_idle(now);

    let launched = client.store().count_calls(|c| {
        *c == StoreCall::LaunchFlow {
            product: "gold_yearly".into(),
            replaces: Some(PurchaseToken::new("monthly-1")),
        }
    });
    assert_eq!(launched, 1);
    assert_eq!(state_of(&s, "gold_yearly"), PurchaseState::PurchasedAndAcknowledged);
}

#[test]
fn upgrade_with_nothing_held_does_not_launch() {
    let client = MockStoreClient::new();
    client
        .store()
        .details
        .push(details("gold_yearly", ProductKind::Subscription));
    let mut s = session_with(client.clone());
    let now = Instant::now();
    s.start();
    s.run_until_idle(now);

    s.launch_purchase(FlowContext::default(), &"gold_yearly".into(), &["gold_monthly".into()])
        .unwrap();
    s.run_until_idle(now);

    assert_eq!(
        count(&client, |c| matches!(c, StoreCall::QueryPurchases { kind: ProductKind::Subscription, .. })),
        2
    );
    assert_eq!(count(&client, |c| matches!(c, StoreCall::LaunchFlow { .. })), 0);
    assert!(!s.notifier().flow_in_progress());
}

#[test]
fn upgrade_with_several_held_does_not_launch() {
    let client = MockStoreClient::new();
    {
        let mut store = client.store();
        store.details.push(details("gold_yearly", ProductKind::Subscription));
        store.add_purchase(ProductKind::Subscription, purchase("m-1", &["gold_monthly"], 0, "good"));
        store.add_purchase(ProductKind::Subscription, purchase("y-1", &["gold_yearly"], 0, "good"));
    }
    let mut s = session_with(client.clone());
    let now = Instant::now();
    s.start();
    s.run_until_idle(now);

    s.launch_purchase(
        FlowContext::default(),
        &"gold_yearly".into(),
        &["gold_monthly".into(), "gold_yearly".into()],
    )
    .unwrap();
    s.run_until_idle(now);

    assert_eq!(count(&client, |c| matches!(c, StoreCall::LaunchFlow { .. })), 0);
}

// --- Details and consumption ---

#[test]
fn observe_details_requeries_only_when_stale() {
    let client = MockStoreClient::manual();
    let mut s = session_with(client.clone()).with_details_stale_after(Duration::from_secs(60));
    let t0 = Instant::now();
    connect_manual(&mut s, &client, t0);
    assert_eq!(count(&client, is_details_query), 2);

    let request = client
        .store()
        .last_request(|c| matches!(c, StoreCall::QueryDetails { kind: ProductKind::Regular, .. }))
        .unwrap();
    client.push_event(StoreEvent::DetailsResponse {
        request,
        code: ResponseCode::Ok,
        details: vec![details("remove_ads", ProductKind::Regular)],
    });
    s.tick_at(t0);

    let rx = s
        .observe_details(&"remove_ads".into(), t0 + Duration::from_secs(30))
        .unwrap();
    assert_eq!(
        rx.borrow().as_ref().map(|d| d.title.clone()),
        Some("remove_ads title".to_string())
    );
    assert_eq!(count(&client, is_details_query), 2);

    s.observe_details(&"remove_ads".into(), t0 + Duration::from_secs(61))
        .unwrap();
    assert_eq!(count(&client, is_details_query), 4);

    assert_eq!(
        s.observe_details(&"nope".into(), t0).err(),
        Some(BillingError::UnknownProduct("nope".into()))
    );
}

#[test]
fn consume_by_id_frees_held_product() {
    let client = MockStoreClient::new();
    let mut held = purchase("ads-1", &["remove_ads"], 0, "good");
    held.acknowledged = true;
    client.store().add_purchase(ProductKind::Regular, held);
    let mut s = session_with(client.clone());
    let mut consumed = s.notifier().subscribe_consumed();
    let now = Instant::now();
    s.start();
    s.run_until_idle(now);
    assert_eq!(state_of(&s, "remove_ads"), PurchaseState::PurchasedAndAcknowledged);

    assert_eq!(
        s.consume_product(&"nope".into()),
        Err(BillingError::UnknownProduct("nope".into()))
    );

    s.consume_product(&"remove_ads".into()).unwrap();
    s.run_until_idle(now);

    assert_eq!(state_of(&s, "remove_ads"), PurchaseState::Unpurchased);
    assert_eq!(consumed.try_recv().unwrap().token, PurchaseToken::new("ads-1"));
    assert_eq!(count(&client, |c| matches!(c, StoreCall::Consume { .. })), 1);
}

#[test]
fn consume_by_id_without_purchase_sends_nothing() {
    let client = MockStoreClient::new();
    let mut s = session_with(client.clone());
    let now = Instant::now();
    s.start();
    s.run_until_idle(now);

    s.consume_product(&"gem_pack".into()).unwrap();
    s.run_until_idle(now);

    assert_eq!(count(&client, |c| matches!(c, StoreCall::Consume { .. })), 0);
}

// --- Driver ---

#[tokio::test(start_paused = true)]
async fn driver_reconnects_on_its_own() {
    let client = MockStoreClient::new();
    {
        let mut store = client.store();
        store.setup_codes.push_back(ResponseCode::ServiceUnavailable);
        store.add_purchase(ProductKind::Regular, purchase("ads-1", &["remove_ads"], 0, "good"));
    }
    let (driver, handle) = BillingDriver::new(session_with(client.clone()), Duration::from_millis(5));
    let mut ads = handle.watch_state(&"remove_ads".into()).unwrap();
    let task = driver.spawn();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(count(&client, is_start), 2);
    assert_eq!(*ads.borrow_and_update(), PurchaseState::PurchasedAndAcknowledged);

    handle.shutdown().unwrap();
    task.await.unwrap();
    assert_eq!(handle.refresh_purchases(), Err(BillingError::ConnectionLost));
}

#[tokio::test(start_paused = true)]
async fn driver_launch_delivers_new_purchase() {
    let client = MockStoreClient::new();
    {
        let mut store = client.store();
        store.details.push(details("remove_ads", ProductKind::Regular));
        store.flow_results.push_back((
            ResponseCode::Ok,
            Some(vec![purchase("ads-1", &["remove_ads"], 0, "good")]),
        ));
    }
    let (driver, handle) = BillingDriver::new(session_with(client.clone()), Duration::from_millis(5));
    let task = driver.spawn();
    let mut news = handle.notifier().subscribe_new_purchases();

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle
        .launch_purchase(FlowContext::default(), "remove_ads".into(), Vec::new())
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(1), news.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.token, PurchaseToken::new("ads-1"));
    assert_eq!(
        *handle.watch_state(&"remove_ads".into()).unwrap().borrow(),
        PurchaseState::PurchasedAndAcknowledged
    );

    assert_eq!(
        handle.consume("nope".into()).await,
        Err(BillingError::UnknownProduct("nope".into()))
    );

    handle.shutdown().unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn driver_stops_when_every_handle_is_dropped() {
    let client = MockStoreClient::new();
    let (driver, handle) = BillingDriver::new(session_with(client.clone()), Duration::from_millis(5));
    let task = driver.spawn();

    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(handle);
    task.await.unwrap();

    assert_eq!(count(&client, |c| matches!(c, StoreCall::EndConnection)), 1);
}

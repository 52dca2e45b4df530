use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use ed25519_dalek::{Signer, SigningKey};

use storefront_billing::billing::runtime::BillingDriver;
use storefront_billing::billing::store::MockStoreClient;
use storefront_billing::billing::types::{
    FlowContext, ProductDetails, ProductId, ProductKind, ProviderPurchaseState, PurchaseRecord,
    PurchaseToken, ResponseCode,
};
use storefront_billing::config::BillingConfig;
use storefront_billing::setup_session;

/// Fixed demo signing key, so the scripted store can sign its purchases.
const DEMO_KEY: [u8; 32] = [42u8; 32];

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Scenario {
    /// Buy a consumable: granted, consumed, delivered.
    GemPack,
    /// Buy a non-consumable: granted and acknowledged.
    RemoveAds,
    /// Store refuses the first connections; the held purchase shows up after reconnect.
    FlakyConnection,
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// JSON billing config. Defaults to a built-in demo catalog.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Scenario::GemPack)]
    scenario: Scenario,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let signing_key = SigningKey::from_bytes(&DEMO_KEY);
    let config = match &args.config {
        Some(path) => BillingConfig::load(path)?,
        None => demo_config(&signing_key),
    };

    println!("[MAIN] Scenario: {:?}", args.scenario);

    let client = MockStoreClient::new();
    script_store(&client, args.scenario, &signing_key);

    let session = setup_session(&config, client.clone())?;
    let (driver, handle) = BillingDriver::new(session, config.poll_interval());
    let mut new_purchases = handle.notifier().subscribe_new_purchases();
    let mut consumed = handle.notifier().subscribe_consumed();
    let task = driver.spawn();

    let settle = Duration::from_millis(200);
    tokio::time::sleep(settle).await;

    match args.scenario {
        Scenario::GemPack => {
            handle
                .launch_purchase(FlowContext::default(), "gem_pack".into(), Vec::new())
                .await?
        }
        Scenario::RemoveAds => {
            handle
                .launch_purchase(FlowContext::default(), "remove_ads".into(), Vec::new())
                .await?
        }
        Scenario::FlakyConnection => {
            // two refused setups: floor + 2 * floor
            tokio::time::sleep(config.backoff().floor() * 3).await
        }
    }
    tokio::time::sleep(settle).await;

    println!("-----------------------------------");
    for id in config.regular_ids.iter().chain(&config.subscription_ids) {
        let state = *handle.watch_state(id)?.borrow();
        println!("{:<15} {:?}", id.as_str(), state);
    }
    println!("-----------------------------------");
    while let Ok(p) = new_purchases.try_recv() {
        println!("Delivered:       {} {:?}", p.token, p.products);
    }
    while let Ok(p) = consumed.try_recv() {
        println!("Consumed:        {} {:?}", p.token, p.products);
    }
    println!(
        "Store calls:     {}",
        client.store().calls.len()
    );

    handle.shutdown()?;
    task.await?;
    Ok(())
}

fn demo_config(key: &SigningKey) -> BillingConfig {
    let mut config = BillingConfig::new(hex::encode(key.verifying_key().to_bytes()));
    config.regular_ids = vec!["gem_pack".into(), "remove_ads".into()];
    config.subscription_ids = vec!["gold_monthly".into()];
    config.auto_consume_ids = vec!["gem_pack".into()];
    config.reconnect_floor_ms = 100;
    config
}

fn signed_purchase(key: &SigningKey, token: &str, product: &str) -> PurchaseRecord {
    let original_json = serde_json::json!({
        "orderId": format!("DEMO.{token}"),
        "productId": product,
        "purchaseToken": token,
        "purchaseState": 0,
    })
    .to_string();
    let signature = hex::encode(key.sign(original_json.as_bytes()).to_bytes());

    PurchaseRecord {
        token: PurchaseToken::new(token),
        products: vec![ProductId::new(product)],
        original_json,
        signature,
        provider_state: ProviderPurchaseState::Purchased,
        acknowledged: false,
        purchase_time_ms: 0,
        order_id: Some(format!("DEMO.{token}")),
    }
}

fn script_store(client: &MockStoreClient, scenario: Scenario, key: &SigningKey) {
    let mut store = client.store();
    for (id, kind, price) in [
        ("gem_pack", ProductKind::Regular, "$0.99"),
        ("remove_ads", ProductKind::Regular, "$2.99"),
        ("gold_monthly", ProductKind::Subscription, "$4.99"),
    ] {
        store.details.push(ProductDetails {
            product_id: id.into(),
            kind,
            title: id.replace('_', " "),
            price: price.to_string(),
            description: String::new(),
        });
    }

    match scenario {
        Scenario::GemPack => store.flow_results.push_back((
            ResponseCode::Ok,
            Some(vec![signed_purchase(key, "gem-1", "gem_pack")]),
        )),
        Scenario::RemoveAds => store.flow_results.push_back((
            ResponseCode::Ok,
            Some(vec![signed_purchase(key, "ads-1", "remove_ads")]),
        )),
        Scenario::FlakyConnection => {
            store
                .setup_codes
                .extend([ResponseCode::ServiceUnavailable, ResponseCode::ServiceTimeout]);
            store.add_purchase(ProductKind::Regular, signed_purchase(key, "ads-1", "remove_ads"));
        }
    }
}

//! Harbor Sim - runs an offline edit and reconnect against the in-memory
//! gateway and prints what the UI would have shown.

use harbor_client::{Config, Fault, Gateway, MemoryGateway, MemoryStore, PersistentStore};
use harbor_client::{FileStore, SyncContext, SystemClock};
use harbor_engine::{detail_key, list_key, EntityKind, GatewayError, Mutation};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harbor_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let persistence: Arc<dyn PersistentStore> = match &config.state_path {
        Some(path) => {
            tracing::info!("Persisting to {}", path.display());
            Arc::new(FileStore::new(path))
        }
        None => Arc::new(MemoryStore::new()),
    };

    let gateway = MemoryGateway::new_shared();
    gateway.seed(
        EntityKind::Client,
        json!({"id": "c1", "name": "Jane", "email": "jane@example.com"}),
    );
    gateway.seed(EntityKind::Client, json!({"id": "c2", "name": "Omar"}));

    let context = SyncContext::open(
        config,
        gateway.clone() as Arc<dyn Gateway>,
        persistence,
        Arc::new(SystemClock),
    )
    .await;
    context.subscribe_realtime(&list_key(EntityKind::Client));
    context.set_online(true);

    let jane = detail_key(EntityKind::Client, "c1");
    let mut query = context.use_query(jane.clone());
    query.wait_for(|view| view.data.is_some()).await;
    tracing::info!("Loaded: {}", json!(query.view()));

    // Offline: two renames and a phone number, all shown immediately.
    context.set_online(false);
    let rename = context.use_mutation(|name: String| Mutation::Update {
        kind: EntityKind::Client,
        id: "c1".into(),
        base_version: 1,
        changes: json!({ "name": name }).as_object().cloned().unwrap_or_default(),
    });
    for name in ["Jane B", "Jane C"] {
        rename.mutate(name.to_string()).await?;
    }
    context
        .mutate(Mutation::Update {
            kind: EntityKind::Client,
            id: "c1".into(),
            base_version: 1,
            changes: json!({"phone": "555-0101"}).as_object().cloned().unwrap_or_default(),
        })
        .await?;
    tracing::info!("Offline view: {}", json!(query.view()));
    tracing::info!("Sync state: {}", json!(context.sync_state()));

    // Meanwhile another actor changes the email.
    gateway.external_update(EntityKind::Client, "c1", json!({"email": "jane@work.example"}));

    // Reconnect over a flaky link.
    gateway.push_fault(Fault::Fail(GatewayError::transient("connection reset")));
    context.set_online(true);
    context.sync_now().await?;
    while context.sync_state().pending_count > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        context.sync_now().await?;
    }

    tracing::info!("Server record: {}", json!(gateway.record(EntityKind::Client, "c1")));
    tracing::info!("Converged view: {}", json!(query.view()));
    for notice in context.notices() {
        tracing::warn!("Notice: {}", notice.message());
    }

    drop(query);
    context.shutdown().await?;
    Ok(())
}

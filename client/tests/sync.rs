//! End-to-end behaviour of the client against the in-memory gateway.
//!
//! Time is a manual clock so backoff deadlines only pass when a test says
//! so; network calls still run on the tokio runtime.

use harbor_client::{
    Config, Fault, Gateway, MemoryGateway, MemoryStore, MutationState, PushHandler, Subscription,
    SyncContext,
};
use harbor_engine::{
    detail_key, list_key, query_key, Clock, EntityKind, EntitySchema, FailureKind, FieldDef,
    FieldType, GatewayError, ManualClock, Mutation, MutationAck, MutationRecord, MutationStatus,
    NoticeKind, QueryKey, QueryStatus, Schema,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    ctx: SyncContext,
    gateway: Arc<MemoryGateway>,
    disk: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

fn config() -> Config {
    Config {
        request_timeout: Duration::from_millis(200),
        ..Config::default()
    }
}

async fn harness() -> Harness {
    harness_with(MemoryGateway::new_shared(), config()).await
}

async fn harness_with(gateway: Arc<MemoryGateway>, config: Config) -> Harness {
    let disk = MemoryStore::new_shared();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let ctx = SyncContext::open(config, gateway.clone(), disk.clone(), clock.clone()).await;
    Harness {
        ctx,
        gateway,
        disk,
        clock,
    }
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

fn update(kind: EntityKind, id: &str, base_version: u64, changes: Value) -> Mutation {
    Mutation::Update {
        kind,
        id: id.into(),
        base_version,
        changes: changes.as_object().cloned().unwrap(),
    }
}

fn rename(id: &str, name: &str) -> Mutation {
    update(EntityKind::Client, id, 1, json!({ "name": name }))
}

/// Forwards to a memory gateway, holding each call open for a moment and
/// recording how many overlap.
struct CountingGateway {
    inner: Arc<MemoryGateway>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    queries: AtomicUsize,
}

impl CountingGateway {
    fn new(inner: Arc<MemoryGateway>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    async fn track<T>(&self, call: impl Future<Output = T>) -> T {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = call.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait::async_trait]
impl Gateway for CountingGateway {
    async fn query(&self, key: &QueryKey) -> Result<Value, GatewayError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.track(self.inner.query(key)).await
    }

    async fn mutate(&self, record: &MutationRecord) -> Result<MutationAck, GatewayError> {
        self.track(self.inner.mutate(record)).await
    }

    fn subscribe(&self, prefix: &QueryKey, handler: PushHandler) -> Subscription {
        self.inner.subscribe(prefix, handler)
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn offline_renames_reach_the_server_in_order() {
    let h = harness().await;
    h.gateway
        .seed(EntityKind::Client, json!({"id": "c1", "name": "Jane"}));
    h.ctx.set_online(true);

    let mut jane = h.ctx.use_query(detail_key(EntityKind::Client, "c1"));
    within(jane.wait_for(|v| v.data.is_some())).await;

    h.ctx.set_online(false);
    h.ctx.mutate(rename("c1", "Jane B")).await.unwrap();
    h.ctx.mutate(rename("c1", "Jane C")).await.unwrap();
    assert_eq!(jane.data().unwrap()["name"], "Jane C");
    assert_eq!(h.ctx.sync_state().pending_count, 2);
    assert_eq!(h.gateway.applied_count(), 0);

    h.ctx.set_online(true);
    within(h.ctx.sync_now()).await.unwrap();

    assert_eq!(h.ctx.sync_state().pending_count, 0);
    assert_eq!(h.gateway.record(EntityKind::Client, "c1").unwrap()["name"], "Jane C");
    assert_eq!(h.gateway.applied_count(), 2);
    assert_eq!(jane.data().unwrap()["name"], "Jane C");
    assert!(h.ctx.sync_state().last_sync_at.is_some());
}

#[tokio::test]
async fn confirming_a_deleted_appointment_removes_it() {
    let h = harness().await;
    h.gateway.seed(
        EntityKind::Appointment,
        json!({
            "id": "a1", "clientId": "c1", "professionalId": "p1", "startsAt": 1_700_000_000_000u64,
            "status": "scheduled"
        }),
    );
    h.ctx.set_online(true);
    let key = detail_key(EntityKind::Appointment, "a1");
    let mut appointment = h.ctx.use_query(key.clone());
    within(appointment.wait_for(|v| v.data.is_some())).await;

    assert!(h.gateway.external_delete(EntityKind::Appointment, "a1"));
    let id = h
        .ctx
        .mutate(Mutation::ConfirmAppointment {
            id: "a1".into(),
            base_version: 1,
        })
        .await
        .unwrap();
    assert_eq!(appointment.data().unwrap()["status"], "confirmed");

    within(h.ctx.sync_now()).await.unwrap();

    assert!(appointment.data().is_none());
    assert!(h.ctx.mutation(id).is_none());
    assert!(h.ctx.failed_mutations().is_empty());
    let notices = h.ctx.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, NoticeKind::RecordRemoved);
    assert!(notices[0].message().contains("deleted"));
}

#[tokio::test]
async fn concurrent_edits_to_different_fields_merge() {
    let h = harness().await;
    h.gateway.seed(
        EntityKind::Client,
        json!({"id": "c1", "name": "Jane", "email": "jane@old.example", "phone": "555-0000"}),
    );
    h.ctx.set_online(true);
    let mut jane = h.ctx.use_query(detail_key(EntityKind::Client, "c1"));
    within(jane.wait_for(|v| v.data.is_some())).await;

    h.ctx.set_online(false);
    h.ctx
        .mutate(update(EntityKind::Client, "c1", 1, json!({"phone": "555-0101"})))
        .await
        .unwrap();
    h.gateway
        .external_update(EntityKind::Client, "c1", json!({"email": "jane@new.example"}));

    h.ctx.set_online(true);
    within(h.ctx.sync_now()).await.unwrap();

    let server = h.gateway.record(EntityKind::Client, "c1").unwrap();
    assert_eq!(server["phone"], "555-0101");
    assert_eq!(server["email"], "jane@new.example");
    let local = jane.data().unwrap();
    assert_eq!(local["phone"], "555-0101");
    assert_eq!(local["email"], "jane@new.example");
    assert!(h.ctx.notices().is_empty());
}

#[tokio::test]
async fn overlapping_edit_loses_to_the_server_and_names_the_field() {
    let h = harness().await;
    h.gateway
        .seed(EntityKind::Client, json!({"id": "c1", "name": "Jane", "phone": "1"}));
    h.ctx.set_online(true);
    let mut jane = h.ctx.use_query(detail_key(EntityKind::Client, "c1"));
    within(jane.wait_for(|v| v.data.is_some())).await;

    h.ctx.set_online(false);
    h.ctx
        .mutate(update(EntityKind::Client, "c1", 1, json!({"name": "Mine", "phone": "2"})))
        .await
        .unwrap();
    h.gateway
        .external_update(EntityKind::Client, "c1", json!({"name": "Theirs"}));

    h.ctx.set_online(true);
    within(h.ctx.sync_now()).await.unwrap();

    let server = h.gateway.record(EntityKind::Client, "c1").unwrap();
    assert_eq!(server["name"], "Theirs");
    assert_eq!(server["phone"], "2");
    assert_eq!(jane.data().unwrap()["name"], "Theirs");
    let notices = h.ctx.notices();
    assert_eq!(notices.len(), 1);
    match &notices[0].kind {
        NoticeKind::FieldsOverwritten { fields } => {
            assert_eq!(fields.iter().collect::<Vec<_>>(), vec!["name"]);
        }
        other => panic!("unexpected notice {other:?}"),
    }
    assert!(h.ctx.dismiss_notice(notices[0].id));
    assert!(h.ctx.notices().is_empty());
}

#[tokio::test]
async fn timed_out_delivery_stays_pending_with_backoff() {
    let h = harness().await;
    h.gateway
        .seed(EntityKind::Client, json!({"id": "c1", "name": "Jane"}));
    h.ctx.set_online(true);
    h.gateway.push_fault(Fault::Delay(Duration::from_secs(30)));

    let now = h.clock.now();
    let id = h.ctx.mutate(rename("c1", "Jane B")).await.unwrap();
    within(h.ctx.sync_now()).await.unwrap();

    let record = h.ctx.mutation(id).unwrap();
    assert_eq!(record.status, MutationStatus::Pending);
    assert_eq!(record.attempt_count, 1);
    let retry_at = record.next_attempt_at.unwrap();
    assert!(retry_at >= now + 1_000 && retry_at <= now + 60_000);
    assert!(h.ctx.notices().is_empty());
    assert_eq!(h.gateway.applied_count(), 0);

    // Not due yet.
    within(h.ctx.sync_now()).await.unwrap();
    assert_eq!(h.ctx.mutation(id).unwrap().attempt_count, 1);

    h.clock.advance(Duration::from_secs(60));
    within(h.ctx.sync_now()).await.unwrap();
    assert!(h.ctx.mutation(id).is_none());
    assert_eq!(h.gateway.record(EntityKind::Client, "c1").unwrap()["name"], "Jane B");
}

// =============================================================================
// Delivery guarantees
// =============================================================================

#[tokio::test]
async fn lost_acknowledgement_applies_once() {
    let h = harness().await;
    h.gateway
        .seed(EntityKind::Client, json!({"id": "c1", "name": "Jane"}));
    h.ctx.set_online(true);
    h.gateway
        .push_fault(Fault::LoseAck(GatewayError::transient("connection dropped")));

    let id = h.ctx.mutate(rename("c1", "Jane B")).await.unwrap();
    within(h.ctx.sync_now()).await.unwrap();
    assert_eq!(h.ctx.mutation(id).unwrap().status, MutationStatus::Pending);
    assert_eq!(h.gateway.applied_count(), 1);

    h.clock.advance(Duration::from_secs(2));
    within(h.ctx.sync_now()).await.unwrap();

    assert!(h.ctx.mutation(id).is_none());
    assert_eq!(h.gateway.applied_count(), 1);
    assert_eq!(h.gateway.log(), vec![id]);
    assert_eq!(h.gateway.record(EntityKind::Client, "c1").unwrap()["version"], 2);
}

#[tokio::test]
async fn converges_after_connectivity_toggles() {
    let h = harness().await;
    for (id, name) in [("c1", "Ada"), ("c2", "Bo"), ("c3", "Cy")] {
        h.gateway
            .seed(EntityKind::Client, json!({"id": id, "name": name}));
    }
    h.ctx.set_online(true);
    h.ctx.subscribe_realtime(&query_key![EntityKind::Client]);

    let mut handles = Vec::new();
    for key in [
        list_key(EntityKind::Client),
        detail_key(EntityKind::Client, "c1"),
        detail_key(EntityKind::Client, "c2"),
        detail_key(EntityKind::Client, "c3"),
    ] {
        let mut handle = h.ctx.use_query(key);
        within(handle.wait_for(|v| v.status == QueryStatus::Success)).await;
        handles.push(handle);
    }

    h.ctx.mutate(rename("c1", "Ada L")).await.unwrap();
    h.ctx.set_online(false);
    h.ctx.mutate(rename("c2", "Bo D")).await.unwrap();
    h.gateway
        .external_update(EntityKind::Client, "c1", json!({"email": "ada@example.com"}));
    h.ctx.set_online(true);
    h.gateway.set_reachable(false);
    within(h.ctx.sync_now()).await.unwrap();
    h.ctx
        .mutate(Mutation::Create {
            kind: EntityKind::Client,
            id: "c4".into(),
            fields: json!({"name": "Di"}).as_object().cloned().unwrap(),
        })
        .await
        .unwrap();
    h.ctx.set_online(false);
    h.ctx
        .mutate(Mutation::Delete {
            kind: EntityKind::Client,
            id: "c3".into(),
            base_version: 1,
        })
        .await
        .unwrap();
    h.gateway.set_reachable(true);
    h.ctx.set_online(true);

    for _ in 0..20 {
        within(h.ctx.sync_now()).await.unwrap();
        if h.ctx.sync_state().pending_count == 0 {
            break;
        }
        h.clock.advance(Duration::from_secs(60));
    }
    assert_eq!(h.ctx.sync_state().pending_count, 0);
    assert!(h.ctx.failed_mutations().is_empty());

    for handle in &handles {
        let server = h.gateway.query(handle.key()).await.unwrap();
        let server = if server.is_null() { None } else { Some(server) };
        assert_eq!(handle.data(), server, "{} diverged", handle.key());
    }
    assert!(h.gateway.record(EntityKind::Client, "c3").is_none());
    assert_eq!(h.gateway.record(EntityKind::Client, "c4").unwrap()["name"], "Di");
    let ada = h.gateway.record(EntityKind::Client, "c1").unwrap();
    assert_eq!(ada["name"], "Ada L");
    assert_eq!(ada["email"], "ada@example.com");
}

#[tokio::test]
async fn server_rejections_roll_back_and_stay_visible() {
    let server_schema = Schema::default().with_entity(EntitySchema::new(
        EntityKind::Client,
        vec![
            FieldDef::required("name", FieldType::String),
            FieldDef::required("email", FieldType::String),
            FieldDef::optional("phone", FieldType::String),
        ],
    ));
    let h = harness_with(Arc::new(MemoryGateway::new(server_schema)), config()).await;
    h.gateway.seed(EntityKind::Professional, json!({"id": "p1", "name": "Dr. Ray"}));
    h.gateway.deny(EntityKind::Professional);
    h.ctx.set_online(true);

    let mut ray = h.ctx.use_query(detail_key(EntityKind::Professional, "p1"));
    within(ray.wait_for(|v| v.data.is_some())).await;

    let denied = h
        .ctx
        .mutate(update(EntityKind::Professional, "p1", 1, json!({"name": "Dr. X"})))
        .await
        .unwrap();
    let invalid = h
        .ctx
        .mutate(Mutation::Create {
            kind: EntityKind::Client,
            id: "c9".into(),
            fields: json!({"name": "No Email"}).as_object().cloned().unwrap(),
        })
        .await
        .unwrap();
    within(h.ctx.sync_now()).await.unwrap();

    assert_eq!(ray.data().unwrap()["name"], "Dr. Ray");
    assert!(h.ctx.view(&detail_key(EntityKind::Client, "c9")).data.is_none());
    assert_eq!(h.ctx.failed_mutations().len(), 2);
    assert_eq!(h.ctx.sync_state().pending_count, 0);

    let kinds: Vec<NoticeKind> = h.ctx.notices().into_iter().map(|n| n.kind).collect();
    assert!(kinds
        .iter()
        .any(|k| matches!(k, NoticeKind::PermissionDenied { .. })));
    assert!(kinds.iter().any(|k| matches!(
        k,
        NoticeKind::ValidationFailed { field_errors } if field_errors[0].field == "email"
    )));

    h.ctx.discard_mutation(denied).await.unwrap();
    h.ctx.discard_mutation(invalid).await.unwrap();
    assert!(h.ctx.failed_mutations().is_empty());
    assert!(h.ctx.notices().is_empty());
    assert_eq!(ray.data().unwrap()["name"], "Dr. Ray");
}

#[tokio::test]
async fn manual_retry_after_terminal_failure() {
    let h = harness().await;
    h.gateway
        .seed(EntityKind::Client, json!({"id": "c1", "name": "Jane"}));
    h.ctx.set_online(true);
    let mut jane = h.ctx.use_query(detail_key(EntityKind::Client, "c1"));
    within(jane.wait_for(|v| v.data.is_some())).await;
    h.gateway
        .push_fault(Fault::Fail(GatewayError::permission("session expired")));

    let mutations = h.ctx.use_mutation(|name: String| rename("c1", &name));
    assert_eq!(mutations.status(), MutationState::Idle);
    let id = mutations.mutate("Jane B".to_string()).await.unwrap();
    within(h.ctx.sync_now()).await.unwrap();
    assert_eq!(h.ctx.failed_mutations().len(), 1);
    assert_eq!(
        mutations.status(),
        MutationState::Queued(MutationStatus::Failed(FailureKind::Terminal))
    );
    assert_eq!(jane.data().unwrap()["name"], "Jane");

    h.ctx.retry_mutation(id).await.unwrap();
    assert_eq!(jane.data().unwrap()["name"], "Jane B");
    within(h.ctx.sync_now()).await.unwrap();
    assert!(h.ctx.mutation(id).is_none());
    assert_eq!(mutations.status(), MutationState::Settled);
    assert_eq!(h.gateway.record(EntityKind::Client, "c1").unwrap()["name"], "Jane B");
}

#[tokio::test]
async fn invalid_mutation_is_refused_locally() {
    let h = harness().await;
    let err = h
        .ctx
        .mutate(Mutation::Create {
            kind: EntityKind::Client,
            id: "c1".into(),
            fields: json!({"email": "x@example.com"}).as_object().cloned().unwrap(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        harbor_client::ClientError::Engine(harbor_engine::Error::InvalidFields(_))
    ));
    assert_eq!(h.ctx.sync_state().pending_count, 0);
    assert_eq!(h.disk.save_count(), 0);
}

// =============================================================================
// Queries and pushes
// =============================================================================

#[tokio::test]
async fn refetch_keeps_old_data_visible() {
    let h = harness().await;
    h.gateway
        .seed(EntityKind::Client, json!({"id": "c1", "name": "Jane"}));
    h.ctx.set_online(true);
    let key = detail_key(EntityKind::Client, "c1");
    let mut jane = h.ctx.use_query(key.clone());
    within(jane.wait_for(|v| v.status == QueryStatus::Success)).await;

    h.gateway
        .external_update(EntityKind::Client, "c1", json!({"name": "Jane R"}));
    h.gateway.set_latency(Duration::from_millis(50));
    let coordinator = h.ctx.coordinator().clone();
    let refetch = {
        let key = key.clone();
        tokio::spawn(async move { coordinator.fetch(&key).await })
    };

    let during = within(jane.wait_for(|v| v.is_fetching)).await.unwrap();
    assert_eq!(during.status, QueryStatus::Success);
    assert_eq!(during.data.unwrap()["name"], "Jane");

    assert!(within(refetch).await.unwrap());
    assert_eq!(jane.data().unwrap()["name"], "Jane R");

    // A failed refetch keeps the data and flags the error.
    h.gateway.set_latency(Duration::ZERO);
    h.gateway.set_reachable(false);
    assert!(within(h.ctx.refetch(&key)).await);
    let view = jane.view();
    assert_eq!(view.data.unwrap()["name"], "Jane R");
    assert_eq!(view.status, QueryStatus::Success);
    assert!(view.error.is_some());
}

#[tokio::test]
async fn failed_first_fetch_is_an_error_without_data() {
    let h = harness().await;
    h.gateway.set_reachable(false);
    h.ctx.set_online(true);
    let mut missing = h.ctx.use_query(detail_key(EntityKind::Client, "c1"));
    let view = within(missing.wait_for(|v| v.status == QueryStatus::Error))
        .await
        .unwrap();
    assert!(view.data.is_none());
    assert!(view.error.unwrap().contains("unreachable"));
}

#[tokio::test]
async fn realtime_pushes_update_watched_queries() {
    let h = harness().await;
    h.gateway
        .seed(EntityKind::Client, json!({"id": "c1", "name": "Jane"}));
    h.ctx.set_online(true);
    h.ctx.subscribe_realtime(&query_key![EntityKind::Client]);
    assert_eq!(h.gateway.subscriber_count(), 1);

    let mut jane = h.ctx.use_query(detail_key(EntityKind::Client, "c1"));
    within(jane.wait_for(|v| v.data.is_some())).await;

    h.gateway
        .external_update(EntityKind::Client, "c1", json!({"name": "Jane P"}));
    assert_eq!(jane.data().unwrap()["name"], "Jane P");

    h.gateway.external_delete(EntityKind::Client, "c1");
    assert!(jane.data().is_none());

    drop(jane);
    h.ctx.shutdown().await.unwrap();
    assert_eq!(h.gateway.subscriber_count(), 0);
}

#[tokio::test]
async fn push_during_delivery_waits_for_the_mutation() {
    let h = harness().await;
    h.gateway
        .seed(EntityKind::Client, json!({"id": "c1", "name": "Jane", "email": "a@example.com"}));
    h.ctx.set_online(true);
    h.ctx.subscribe_realtime(&query_key![EntityKind::Client]);
    let mut jane = h.ctx.use_query(detail_key(EntityKind::Client, "c1"));
    within(jane.wait_for(|v| v.data.is_some())).await;

    h.gateway.push_fault(Fault::Delay(Duration::from_millis(100)));
    h.ctx.set_online(false);
    h.ctx.mutate(rename("c1", "Jane B")).await.unwrap();
    h.ctx.set_online(true);
    let coordinator = h.ctx.coordinator().clone();
    let sync = tokio::spawn(async move { coordinator.sync_now().await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    h.gateway
        .external_update(EntityKind::Client, "c1", json!({"email": "b@example.com"}));
    // The push carries the old name; it must not clobber the pending rename.
    assert_eq!(jane.data().unwrap()["name"], "Jane B");
    assert_eq!(jane.data().unwrap()["email"], "a@example.com");

    within(sync).await.unwrap().unwrap();
    let data = jane.data().unwrap();
    assert_eq!(data["name"], "Jane B");
    assert_eq!(data["email"], "b@example.com");
    assert_eq!(h.ctx.coordinator().buffered_pushes(), 0);
}

#[tokio::test]
async fn background_fetches_respect_the_concurrency_limit() {
    let gateway = MemoryGateway::new_shared();
    for i in 0..10 {
        gateway.seed(
            EntityKind::Client,
            json!({"id": format!("c{i}"), "name": format!("Client {i}")}),
        );
    }
    let counting = CountingGateway::new(gateway.clone());
    gateway.seed(EntityKind::Client, json!({"id": "c10", "name": "Ada"}));
    let config = Config {
        concurrency: 2,
        ..config()
    };
    let clock = Arc::new(ManualClock::new(1_000_000));
    let ctx = SyncContext::open(config, counting.clone(), MemoryStore::new_shared(), clock).await;

    let mut queries: Vec<_> = (0..10)
        .map(|i| ctx.use_query(detail_key(EntityKind::Client, &format!("c{i}"))))
        .collect();
    ctx.mutate(rename("c10", "Ada B")).await.unwrap();
    ctx.set_online(true);
    within(ctx.coordinator().refresh_stale()).await;
    for query in &mut queries {
        within(query.wait_for(|v| v.data.is_some())).await;
    }
    within(ctx.sync_now()).await.unwrap();

    assert!(counting.queries() >= 10);
    assert_eq!(counting.peak(), 2);
    assert_eq!(gateway.record(EntityKind::Client, "c10").unwrap()["name"], "Ada B");
    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn watched_query_refetches_once_it_turns_stale() {
    let gateway = MemoryGateway::new_shared();
    gateway.seed(EntityKind::Client, json!({"id": "c1", "name": "Jane"}));
    let counting = CountingGateway::new(gateway.clone());
    let config = Config {
        stale_time: Duration::from_secs(5),
        ..config()
    };
    let clock = Arc::new(ManualClock::new(1_000_000));
    let ctx = SyncContext::open(
        config,
        counting.clone(),
        MemoryStore::new_shared(),
        clock.clone(),
    )
    .await;
    ctx.set_online(true);

    let mut jane = ctx.use_query(detail_key(EntityKind::Client, "c1"));
    within(jane.wait_for(|v| v.data.is_some())).await;
    gateway.external_update(EntityKind::Client, "c1", json!({"email": "jane@work.example"}));
    let fetched = counting.queries();

    clock.advance(Duration::from_secs(4));
    ctx.coordinator().request_sync();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counting.queries(), fetched);
    assert!(jane.data().unwrap().get("email").is_none());

    clock.advance(Duration::from_secs(2));
    ctx.coordinator().request_sync();
    let view = within(jane.wait_for(|v| {
        v.data
            .as_ref()
            .is_some_and(|d| d["email"] == "jane@work.example")
    }))
    .await
    .unwrap();
    assert!(!view.is_stale);
    ctx.shutdown().await.unwrap();
}

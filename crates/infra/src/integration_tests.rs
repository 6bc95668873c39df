//! Integration tests for the full pipeline on the in-memory backends.
//!
//! append → EventStore → Snapshot/Reconstruct → ProjectionEngine
//!
//! Verifies:
//! - Optimistic concurrency and gapless versions
//! - Reconstruction is independent of which snapshots exist
//! - Snapshot retention and best-effort pruning
//! - Tenant isolation through the session context
//! - Projection lifecycle, idempotency, gap and ordering handling

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::json;

    use eventvault_core::{AggregateId, ExpectedVersion, SessionContext, SessionContextManager};
    use eventvault_events::{NewEvent, Watermarks};

    use crate::config::{ProjectionConfig, SnapshotPolicy, StoreConfig};
    use crate::error::StoreError;
    use crate::event_store::{EventStore, InMemoryEventStore, events_after};
    use crate::projections::{
        InMemoryProjectionStore, IncrementalOutcome, ProjectionEngine, ProjectionKey,
        ProjectionRecord, ProjectionStatus, ProjectionStore,
    };
    use crate::reconstruct::AggregateReconstructor;
    use crate::snapshot::{InMemorySnapshotStore, Snapshot, SnapshotManager, SnapshotStore};
    use crate::testing::{
        Arrivals, EventTypeCounts, SeatTotals, Subscription, SubscriptionEvent, ascending_ids,
        ctx, seats, started,
    };
    use crate::vault::EventVault;

    fn vault() -> EventVault {
        EventVault::in_memory(StoreConfig::default())
    }

    async fn seed(vault: &EventVault, ctx: &SessionContext, aggregate_id: AggregateId, n: u32) {
        vault
            .events()
            .append(ctx, aggregate_id, started(1), ExpectedVersion::Exact(0))
            .await
            .unwrap();
        for i in 2..=n {
            vault
                .events()
                .append(ctx, aggregate_id, seats(i), ExpectedVersion::Exact(u64::from(i) - 1))
                .await
                .unwrap();
        }
    }

    // ---- event store -------------------------------------------------------

    #[tokio::test]
    async fn n_appends_produce_versions_one_to_n() {
        let vault = vault();
        let agg = AggregateId::new();
        seed(&vault, &ctx(1), agg, 12).await;

        assert_eq!(vault.events().current_version(&ctx(1), agg).await.unwrap(), 12);
        let versions: Vec<u64> = events_after(vault.events(), &ctx(1), agg, 0)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_version)
            .collect();
        assert_eq!(versions, (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stale_writer_gets_a_conflict_and_writes_nothing() {
        let vault = vault();
        let agg = AggregateId::new();
        seed(&vault, &ctx(1), agg, 2).await;

        let err = vault
            .events()
            .append(&ctx(1), agg, seats(9), ExpectedVersion::Exact(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: ExpectedVersion::Exact(1),
                actual: Some(2),
                ..
            }
        ));
        assert_eq!(vault.events().current_version(&ctx(1), agg).await.unwrap(), 2);
    }

    // ---- session context ---------------------------------------------------

    #[tokio::test]
    async fn units_of_work_only_see_their_own_tenant() {
        let vault = vault();
        let manager = SessionContextManager::new();
        let agg = AggregateId::new();

        {
            let scope = manager.scope(None, Some(7)).unwrap();
            seed(&vault, scope.context(), agg, 3).await;
        }
        assert_eq!(manager.current_tenant(), None);

        {
            let scope = manager.scope(None, Some(8)).unwrap();
            let version = vault.events().current_version(scope.context(), agg).await.unwrap();
            assert_eq!(version, 0);
            assert!(vault.events().aggregate_ids(scope.context()).await.unwrap().is_empty());
            assert!(matches!(
                vault.snapshots().create_snapshot::<Subscription>(scope.context(), agg).await,
                Err(StoreError::NotFound(_))
            ));
        }

        // Nothing bound: every storage call fails closed.
        let unbound = manager.current();
        assert!(matches!(
            vault.events().append(&unbound, agg, seats(1), ExpectedVersion::Any).await,
            Err(StoreError::MissingTenantContext)
        ));
        assert!(matches!(
            vault.reconstructor().load::<Subscription>(&unbound, agg).await,
            Err(StoreError::MissingTenantContext)
        ));
        assert!(matches!(
            vault.projections().rebuild(&unbound, &SeatTotals, None).await,
            Err(StoreError::MissingTenantContext)
        ));
    }

    #[tokio::test]
    async fn invalid_binding_leaves_no_identity_behind() {
        let manager = SessionContextManager::new();
        manager.set(None, Some(3)).unwrap();

        assert!(manager.set(Some("not-a-uuid"), Some(4)).is_err());
        assert_eq!(manager.current_tenant(), None);
        assert!(matches!(
            InMemoryEventStore::new()
                .current_version(&manager.current(), AggregateId::new())
                .await,
            Err(StoreError::MissingTenantContext)
        ));
    }

    // ---- snapshots & reconstruction ----------------------------------------

    #[tokio::test]
    async fn snapshot_then_more_events_reconstructs_the_same_state() {
        let vault = vault();
        let agg = AggregateId::new();
        seed(&vault, &ctx(1), agg, 2).await;

        let snapshot = vault
            .snapshots()
            .create_snapshot::<Subscription>(&ctx(1), agg)
            .await
            .unwrap();
        assert_eq!(snapshot.snapshot_version, 2);

        for (expected, n) in [(2, 3), (3, 4), (4, 5)] {
            vault
                .events()
                .append(&ctx(1), agg, seats(n), ExpectedVersion::Exact(expected))
                .await
                .unwrap();
        }

        let loaded = vault.reconstructor().load::<Subscription>(&ctx(1), agg).await.unwrap();
        let scratch = vault
            .reconstructor()
            .load_from_scratch::<Subscription>(&ctx(1), agg)
            .await
            .unwrap();

        assert_eq!(loaded.version, 5);
        assert_eq!(loaded, scratch);
        assert_eq!(loaded.state.seats, 5);
        assert_eq!(loaded.state.changes, 5);
    }

    #[tokio::test]
    async fn unknown_aggregate_loads_as_default_at_version_zero() {
        let vault = vault();
        let loaded = vault
            .reconstructor()
            .load::<Subscription>(&ctx(1), AggregateId::new())
            .await
            .unwrap();
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.state, Subscription::default());
    }

    #[tokio::test]
    async fn retention_keeps_the_newest_k() {
        let config = StoreConfig::default().with_snapshots(SnapshotPolicy::new(3).unwrap());
        let vault = EventVault::in_memory(config);
        let agg = AggregateId::new();
        seed(&vault, &ctx(1), agg, 1).await;

        for v in 1..=6u64 {
            if v > 1 {
                vault
                    .events()
                    .append(&ctx(1), agg, seats(v as u32), ExpectedVersion::Exact(v - 1))
                    .await
                    .unwrap();
            }
            vault
                .snapshots()
                .create_snapshot::<Subscription>(&ctx(1), agg)
                .await
                .unwrap();
            assert!(vault.snapshots().snapshots(&ctx(1), agg).await.unwrap().len() <= 3);
        }

        let versions: Vec<u64> = vault
            .snapshots()
            .snapshots(&ctx(1), agg)
            .await
            .unwrap()
            .iter()
            .map(|s| s.snapshot_version)
            .collect();
        assert_eq!(versions, vec![6, 5, 4]);
    }

    #[tokio::test]
    async fn snapshotting_twice_at_one_version_keeps_one_row() {
        let vault = vault();
        let agg = AggregateId::new();
        seed(&vault, &ctx(1), agg, 3).await;

        vault.snapshots().create_snapshot::<Subscription>(&ctx(1), agg).await.unwrap();
        vault.snapshots().create_snapshot::<Subscription>(&ctx(1), agg).await.unwrap();

        let all = vault.snapshots().snapshots(&ctx(1), agg).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].snapshot_version, 3);
    }

    /// Snapshot store whose pruning always fails.
    struct FailingPrune(InMemorySnapshotStore);

    #[async_trait]
    impl SnapshotStore for FailingPrune {
        async fn insert(&self, ctx: &SessionContext, snapshot: Snapshot) -> Result<(), StoreError> {
            self.0.insert(ctx, snapshot).await
        }

        async fn latest(
            &self,
            ctx: &SessionContext,
            aggregate_id: AggregateId,
        ) -> Result<Option<Snapshot>, StoreError> {
            self.0.latest(ctx, aggregate_id).await
        }

        async fn list(
            &self,
            ctx: &SessionContext,
            aggregate_id: AggregateId,
        ) -> Result<Vec<Snapshot>, StoreError> {
            self.0.list(ctx, aggregate_id).await
        }

        async fn prune(
            &self,
            _ctx: &SessionContext,
            _aggregate_id: AggregateId,
            _keep: usize,
        ) -> Result<usize, StoreError> {
            Err(StoreError::StorageUnavailable("delete timed out".into()))
        }
    }

    #[tokio::test]
    async fn prune_failure_does_not_fail_snapshot_creation() {
        let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let store: Arc<dyn SnapshotStore> = Arc::new(FailingPrune(InMemorySnapshotStore::new()));
        let manager = SnapshotManager::new(
            events.clone(),
            store.clone(),
            SnapshotPolicy::new(1).unwrap(),
            10,
        );
        let agg = AggregateId::new();
        events
            .append(&ctx(1), agg, started(2), ExpectedVersion::Exact(0))
            .await
            .unwrap();
        manager.create_snapshot::<Subscription>(&ctx(1), agg).await.unwrap();
        events
            .append(&ctx(1), agg, seats(3), ExpectedVersion::Exact(1))
            .await
            .unwrap();

        let snapshot = manager.create_snapshot::<Subscription>(&ctx(1), agg).await.unwrap();
        assert_eq!(snapshot.snapshot_version, 2);
        // Both survive since pruning never succeeded.
        assert_eq!(manager.snapshots(&ctx(1), agg).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error_not_a_fallback() {
        let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let reconstructor = AggregateReconstructor::new(events.clone(), snapshots.clone(), 10);
        let agg = AggregateId::new();
        events
            .append(&ctx(1), agg, started(1), ExpectedVersion::Exact(0))
            .await
            .unwrap();

        snapshots
            .insert(
                &ctx(1),
                Snapshot {
                    snapshot_id: uuid::Uuid::now_v7(),
                    tenant_id: crate::testing::tenant(1),
                    aggregate_id: agg,
                    snapshot_version: 1,
                    state: json!({ "seats": "lots" }),
                    created_at: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            reconstructor.load::<Subscription>(&ctx(1), agg).await,
            Err(StoreError::Serialization(_))
        ));
        assert!(reconstructor.load_from_scratch::<Subscription>(&ctx(1), agg).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_event_type_fails_decoding() {
        let vault = vault();
        let agg = AggregateId::new();
        vault
            .events()
            .append(
                &ctx(1),
                agg,
                NewEvent::new("subscription.paused", json!({ "type": "paused" })),
                ExpectedVersion::Exact(0),
            )
            .await
            .unwrap();

        assert!(matches!(
            vault.reconstructor().load::<Subscription>(&ctx(1), agg).await,
            Err(StoreError::Serialization(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn snapshots_never_change_reconstructed_state(
            steps in prop::collection::vec((1u32..50, any::<bool>()), 1..40),
            retain in 1usize..4,
            page_size in 1usize..8,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let config = StoreConfig::default()
                    .with_snapshots(SnapshotPolicy::new(retain).unwrap())
                    .with_page_size(page_size)
                    .unwrap();
                let vault = EventVault::in_memory(config);
                let agg = AggregateId::new();

                vault
                    .events()
                    .append(&ctx(1), agg, started(1), ExpectedVersion::Exact(0))
                    .await
                    .unwrap();
                let mut version = 1u64;
                for (n, snapshot_here) in &steps {
                    vault
                        .events()
                        .append(&ctx(1), agg, seats(*n), ExpectedVersion::Exact(version))
                        .await
                        .unwrap();
                    version += 1;
                    if *snapshot_here {
                        vault
                            .snapshots()
                            .create_snapshot::<Subscription>(&ctx(1), agg)
                            .await
                            .unwrap();
                    }

                    let loaded = vault.reconstructor().load::<Subscription>(&ctx(1), agg).await.unwrap();
                    let scratch = vault
                        .reconstructor()
                        .load_from_scratch::<Subscription>(&ctx(1), agg)
                        .await
                        .unwrap();
                    assert_eq!(loaded, scratch);
                    assert_eq!(loaded.version, version);
                    assert!(vault.snapshots().snapshots(&ctx(1), agg).await.unwrap().len() <= retain);
                }
            });
        }
    }

    // ---- repository --------------------------------------------------------

    #[tokio::test]
    async fn repository_appends_decided_events_at_the_loaded_version() {
        let config = StoreConfig::default()
            .with_snapshots(SnapshotPolicy::new(3).unwrap().with_interval(2).unwrap());
        let vault = EventVault::in_memory(config);
        let agg = AggregateId::new();
        seed(&vault, &ctx(1), agg, 1).await;

        let committed = vault
            .repository()
            .execute::<Subscription, _>(&ctx(1), agg, |s| s.change_seats(4))
            .await
            .unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].event_version, 2);
        assert_eq!(committed[0].event_type, "subscription.seats_changed");

        // Interval of 2 reached at version 2.
        let latest = vault.snapshots().latest_snapshot(&ctx(1), agg).await.unwrap().unwrap();
        assert_eq!(latest.snapshot_version, 2);

        let unchanged = vault
            .repository()
            .execute::<Subscription, _>(&ctx(1), agg, |s| s.change_seats(4))
            .await
            .unwrap();
        assert!(unchanged.is_empty());

        let rejected = vault
            .repository()
            .execute::<Subscription, _>(&ctx(1), agg, |s| s.change_seats(0))
            .await
            .unwrap_err();
        assert!(matches!(rejected, StoreError::Domain(_)));
        assert_eq!(vault.events().current_version(&ctx(1), agg).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn repository_surfaces_conflicts_from_interleaved_writers() {
        let vault = vault();
        let agg = AggregateId::new();
        seed(&vault, &ctx(1), agg, 1).await;

        let racing = vault.clone();
        let err = vault
            .repository()
            .execute::<Subscription, _>(&ctx(1), agg, move |s| {
                // Another writer commits between load and append.
                let racing = racing.clone();
                std::thread::spawn(move || {
                    tokio::runtime::Builder::new_current_thread()
                        .build()
                        .unwrap()
                        .block_on(racing.events().append(
                            &ctx(1),
                            agg,
                            seats(9),
                            ExpectedVersion::Exact(1),
                        ))
                        .unwrap();
                })
                .join()
                .unwrap();
                s.change_seats(5)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
        let loaded = vault.reconstructor().load::<Subscription>(&ctx(1), agg).await.unwrap();
        assert_eq!(loaded.state.seats, 9);
    }

    // ---- projections -------------------------------------------------------

    fn projection_engine(config: ProjectionConfig) -> (Arc<InMemoryEventStore>, Arc<InMemoryProjectionStore>, ProjectionEngine) {
        let events = Arc::new(InMemoryEventStore::new());
        let store = Arc::new(InMemoryProjectionStore::new());
        let engine = ProjectionEngine::new(events.clone(), store.clone(), config, 4);
        (events, store, engine)
    }

    #[tokio::test]
    async fn projection_lifecycle_and_reads() {
        let (events, _, engine) = projection_engine(ProjectionConfig::default());
        let (a, b) = (AggregateId::new(), AggregateId::new());
        events.append(&ctx(1), a, started(2), ExpectedVersion::Exact(0)).await.unwrap();
        events.append(&ctx(1), b, started(5), ExpectedVersion::Exact(0)).await.unwrap();

        assert_eq!(
            engine.status(&ctx(1), "seat_totals", None).await.unwrap(),
            ProjectionStatus::Absent
        );
        assert!(matches!(
            engine.read(&ctx(1), &SeatTotals, None).await,
            Err(StoreError::NotFound(_))
        ));

        let view = engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();
        assert_eq!(view.status, ProjectionStatus::Ready);
        assert_eq!(view.state.get(&a), Some(&2));
        assert_eq!(view.state.get(&b), Some(&5));

        assert_eq!(
            engine.mark_stale(&ctx(1), "seat_totals", None).await.unwrap(),
            ProjectionStatus::Stale
        );
        let stale = engine.read(&ctx(1), &SeatTotals, None).await.unwrap();
        assert_eq!(stale.status, ProjectionStatus::Stale);
        assert_eq!(stale.state, view.state);

        let again = engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();
        assert_eq!(again.status, ProjectionStatus::Ready);
        assert!(again.generation > view.generation);

        // Other tenants see nothing.
        assert_eq!(
            engine.status(&ctx(2), "seat_totals", None).await.unwrap(),
            ProjectionStatus::Absent
        );
        let other = engine.rebuild(&ctx(2), &SeatTotals, None).await.unwrap();
        assert!(other.state.is_empty());
    }

    #[tokio::test]
    async fn rebuilding_twice_is_byte_identical() {
        let (events, _, engine) = projection_engine(ProjectionConfig::default());
        for n in 1..=5u32 {
            let agg = AggregateId::new();
            events.append(&ctx(1), agg, started(n), ExpectedVersion::Exact(0)).await.unwrap();
            events.append(&ctx(1), agg, seats(n * 10), ExpectedVersion::Exact(1)).await.unwrap();
        }

        let first = engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();
        let second = engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&first.state).unwrap(),
            serde_json::to_vec(&second.state).unwrap()
        );
        assert_eq!(first.watermarks, second.watermarks);

        let counts = engine.rebuild(&ctx(1), &EventTypeCounts, None).await.unwrap();
        assert_eq!(counts.state.get("subscription.started"), Some(&5));
        assert_eq!(counts.state.get("subscription.seats_changed"), Some(&5));
    }

    #[tokio::test]
    async fn readers_see_the_previous_state_while_building() {
        let (events, store, engine) = projection_engine(ProjectionConfig::default());
        let agg = AggregateId::new();
        events.append(&ctx(1), agg, started(3), ExpectedVersion::Exact(0)).await.unwrap();
        let built = engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();

        // Simulate another process having started a build.
        let key = ProjectionKey::new(crate::testing::tenant(1), "seat_totals", None);
        store.begin_build(&ctx(1), &key).await.unwrap();

        let view = engine.read(&ctx(1), &SeatTotals, None).await.unwrap();
        assert_eq!(view.status, ProjectionStatus::Building);
        assert_eq!(view.state, built.state);
    }

    #[tokio::test]
    async fn incremental_updates_fold_once_and_skip_duplicates() {
        let (events, _, engine) = projection_engine(ProjectionConfig::default());
        let agg = AggregateId::new();
        events.append(&ctx(1), agg, started(1), ExpectedVersion::Exact(0)).await.unwrap();
        engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();
        engine.rebuild(&ctx(1), &SeatTotals, Some(agg)).await.unwrap();

        let e2 = events.append(&ctx(1), agg, seats(6), ExpectedVersion::Exact(1)).await.unwrap();
        let outcomes = engine.apply_incremental(&ctx(1), &SeatTotals, &e2).await.unwrap();
        assert!(outcomes.iter().all(|(_, o)| *o == IncrementalOutcome::Applied));
        assert_eq!(outcomes.len(), 2);

        let replayed = engine.apply_incremental(&ctx(1), &SeatTotals, &e2).await.unwrap();
        assert!(replayed.iter().all(|(_, o)| *o == IncrementalOutcome::Duplicate));

        let view = engine.read(&ctx(1), &SeatTotals, None).await.unwrap();
        assert_eq!(view.state.get(&agg), Some(&6));
        assert_eq!(view.watermarks.get(&agg), Some(&2));

        let rebuilt = engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();
        assert_eq!(rebuilt.state, view.state);
    }

    #[tokio::test]
    async fn unmaterialized_projections_are_left_alone() {
        let (events, _, engine) = projection_engine(ProjectionConfig::default());
        let agg = AggregateId::new();
        let e1 = events.append(&ctx(1), agg, started(1), ExpectedVersion::Exact(0)).await.unwrap();

        let outcomes = engine.apply_incremental(&ctx(1), &SeatTotals, &e1).await.unwrap();
        assert!(outcomes.iter().all(|(_, o)| *o == IncrementalOutcome::NotMaterialized));
        assert_eq!(
            engine.status(&ctx(1), "seat_totals", None).await.unwrap(),
            ProjectionStatus::Absent
        );
    }

    #[tokio::test]
    async fn gaps_mark_stale_or_rebuild() {
        for rebuild_on_gap in [false, true] {
            let config = ProjectionConfig {
                incremental_updates: true,
                rebuild_on_gap,
            };
            let (events, _, engine) = projection_engine(config);
            let agg = AggregateId::new();
            events.append(&ctx(1), agg, started(1), ExpectedVersion::Exact(0)).await.unwrap();
            engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();

            events.append(&ctx(1), agg, seats(2), ExpectedVersion::Exact(1)).await.unwrap();
            let e3 = events.append(&ctx(1), agg, seats(3), ExpectedVersion::Exact(2)).await.unwrap();

            let outcomes = engine.apply_incremental(&ctx(1), &SeatTotals, &e3).await.unwrap();
            let tenant_wide = outcomes
                .iter()
                .find(|(key, _)| key.aggregate_id.is_none())
                .map(|(_, outcome)| *outcome)
                .unwrap();
            let status = engine.status(&ctx(1), "seat_totals", None).await.unwrap();

            if rebuild_on_gap {
                assert_eq!(tenant_wide, IncrementalOutcome::Rebuilt);
                assert_eq!(status, ProjectionStatus::Ready);
                let view = engine.read(&ctx(1), &SeatTotals, None).await.unwrap();
                assert_eq!(view.state.get(&agg), Some(&3));
            } else {
                assert_eq!(tenant_wide, IncrementalOutcome::MarkedStale);
                assert_eq!(status, ProjectionStatus::Stale);
                let view = engine.read(&ctx(1), &SeatTotals, None).await.unwrap();
                assert_eq!(view.state.get(&agg), Some(&1));
            }
        }
    }

    #[tokio::test]
    async fn non_incremental_projections_go_stale_on_new_events() {
        let (events, _, engine) = projection_engine(ProjectionConfig::default());
        let agg = AggregateId::new();
        events.append(&ctx(1), agg, started(1), ExpectedVersion::Exact(0)).await.unwrap();
        engine.rebuild(&ctx(1), &EventTypeCounts, None).await.unwrap();

        let e2 = events.append(&ctx(1), agg, seats(2), ExpectedVersion::Exact(1)).await.unwrap();
        let outcomes = engine.apply_incremental(&ctx(1), &EventTypeCounts, &e2).await.unwrap();
        assert!(outcomes.contains(&(
            ProjectionKey::new(crate::testing::tenant(1), "event_type_counts", None),
            IncrementalOutcome::MarkedStale
        )));
        assert_eq!(
            engine.status(&ctx(1), "event_type_counts", None).await.unwrap(),
            ProjectionStatus::Stale
        );

        // Same for any projection when incremental updates are switched off.
        let (events, _, engine) = engine_with_incremental_off();
        let agg = AggregateId::new();
        events.append(&ctx(1), agg, started(1), ExpectedVersion::Exact(0)).await.unwrap();
        engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();
        let e2 = events.append(&ctx(1), agg, seats(2), ExpectedVersion::Exact(1)).await.unwrap();
        engine.apply_incremental(&ctx(1), &SeatTotals, &e2).await.unwrap();
        assert_eq!(
            engine.status(&ctx(1), "seat_totals", None).await.unwrap(),
            ProjectionStatus::Stale
        );
    }

    fn engine_with_incremental_off()
    -> (Arc<InMemoryEventStore>, Arc<InMemoryProjectionStore>, ProjectionEngine) {
        projection_engine(ProjectionConfig {
            incremental_updates: false,
            rebuild_on_gap: false,
        })
    }

    #[tokio::test]
    async fn foreign_events_are_refused() {
        let (events, _, engine) = projection_engine(ProjectionConfig::default());
        let agg = AggregateId::new();
        let foreign = events.append(&ctx(2), agg, started(1), ExpectedVersion::Exact(0)).await.unwrap();

        assert!(matches!(
            engine.apply_incremental(&ctx(1), &SeatTotals, &foreign).await,
            Err(StoreError::TenantIsolation(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_rebuilds_and_updates_converge() {
        let (events, _, engine) = projection_engine(ProjectionConfig {
            incremental_updates: true,
            rebuild_on_gap: true,
        });
        let engine = Arc::new(engine);
        let agg = AggregateId::new();
        events.append(&ctx(1), agg, started(1), ExpectedVersion::Exact(0)).await.unwrap();
        engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();

        let mut handles = Vec::new();
        for n in 2..=9u32 {
            let e = events
                .append(&ctx(1), agg, seats(n), ExpectedVersion::Exact(u64::from(n) - 1))
                .await
                .unwrap();
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                if n % 3 == 0 {
                    engine.rebuild(&ctx(1), &SeatTotals, None).await.map(|_| ())
                } else {
                    engine.apply_incremental(&ctx(1), &SeatTotals, &e).await.map(|_| ())
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let published = engine.read(&ctx(1), &SeatTotals, None).await.unwrap();
        let final_view = engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();
        assert_eq!(published.status, ProjectionStatus::Ready);
        assert_eq!(published.state, final_view.state);
        assert_eq!(published.watermarks, final_view.watermarks);
        assert_eq!(final_view.state.get(&agg), Some(&9));
        assert_eq!(final_view.watermarks.get(&agg), Some(&9));
    }

    #[tokio::test]
    async fn incremental_and_rebuilt_tenant_views_agree_across_aggregates() {
        let (events, _, engine) = projection_engine(ProjectionConfig::default());
        let [low, mid, high] = ascending_ids();
        events.append(&ctx(1), low, started(1), ExpectedVersion::Exact(0)).await.unwrap();
        engine.rebuild(&ctx(1), &Arrivals, None).await.unwrap();

        // Committed in the opposite order of their ids.
        let from_high = events.append(&ctx(1), high, started(1), ExpectedVersion::Exact(0)).await.unwrap();
        engine.apply_incremental(&ctx(1), &Arrivals, &from_high).await.unwrap();
        let from_mid = events.append(&ctx(1), mid, started(1), ExpectedVersion::Exact(0)).await.unwrap();
        engine.apply_incremental(&ctx(1), &Arrivals, &from_mid).await.unwrap();

        let incremental = engine.read(&ctx(1), &Arrivals, None).await.unwrap();
        assert_eq!(incremental.status, ProjectionStatus::Ready);
        assert_eq!(incremental.state, vec![low, high, mid]);

        let rebuilt = engine.rebuild(&ctx(1), &Arrivals, None).await.unwrap();
        assert_eq!(rebuilt.state, incremental.state);
        assert_eq!(rebuilt.watermarks, incremental.watermarks);
    }

    #[tokio::test]
    async fn events_delivered_out_of_commit_order_are_not_folded_late() {
        for rebuild_on_gap in [false, true] {
            let (events, _, engine) = projection_engine(ProjectionConfig {
                incremental_updates: true,
                rebuild_on_gap,
            });
            let [low, mid, high] = ascending_ids();
            events.append(&ctx(1), low, started(1), ExpectedVersion::Exact(0)).await.unwrap();
            engine.rebuild(&ctx(1), &Arrivals, None).await.unwrap();

            let first = events.append(&ctx(1), mid, started(1), ExpectedVersion::Exact(0)).await.unwrap();
            let second = events.append(&ctx(1), high, started(1), ExpectedVersion::Exact(0)).await.unwrap();
            engine.apply_incremental(&ctx(1), &Arrivals, &second).await.unwrap();
            let outcomes = engine.apply_incremental(&ctx(1), &Arrivals, &first).await.unwrap();

            let tenant_wide = outcomes
                .iter()
                .find(|(key, _)| key.aggregate_id.is_none())
                .map(|(_, outcome)| *outcome)
                .unwrap();
            let view = engine.read(&ctx(1), &Arrivals, None).await.unwrap();
            if rebuild_on_gap {
                assert_eq!(tenant_wide, IncrementalOutcome::Rebuilt);
                assert_eq!(view.status, ProjectionStatus::Ready);
                assert_eq!(view.state, vec![low, mid, high]);
            } else {
                assert_eq!(tenant_wide, IncrementalOutcome::MarkedStale);
                assert_eq!(view.status, ProjectionStatus::Stale);
                assert_eq!(view.state, vec![low, high]);
                let rebuilt = engine.rebuild(&ctx(1), &Arrivals, None).await.unwrap();
                assert_eq!(rebuilt.state, vec![low, mid, high]);
            }
        }
    }

    /// Projection store whose publish can be switched to fail.
    struct FailingPublish {
        inner: InMemoryProjectionStore,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ProjectionStore for FailingPublish {
        async fn load(
            &self,
            ctx: &SessionContext,
            key: &ProjectionKey,
        ) -> Result<Option<ProjectionRecord>, StoreError> {
            self.inner.load(ctx, key).await
        }

        async fn begin_build(&self, ctx: &SessionContext, key: &ProjectionKey) -> Result<u64, StoreError> {
            self.inner.begin_build(ctx, key).await
        }

        async fn publish(
            &self,
            ctx: &SessionContext,
            key: &ProjectionKey,
            generation: u64,
            state: serde_json::Value,
            watermarks: Watermarks,
        ) -> Result<bool, StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::StorageUnavailable("projection table offline".into()));
            }
            self.inner.publish(ctx, key, generation, state, watermarks).await
        }

        async fn set_status(
            &self,
            ctx: &SessionContext,
            key: &ProjectionKey,
            status: ProjectionStatus,
        ) -> Result<(), StoreError> {
            self.inner.set_status(ctx, key, status).await
        }
    }

    #[tokio::test]
    async fn failed_publish_leaves_the_record_stale_not_building() {
        let events = Arc::new(InMemoryEventStore::new());
        let store = Arc::new(FailingPublish {
            inner: InMemoryProjectionStore::new(),
            fail: AtomicBool::new(false),
        });
        let engine = ProjectionEngine::new(events.clone(), store.clone(), ProjectionConfig::default(), 4);
        let agg = AggregateId::new();
        events.append(&ctx(1), agg, started(2), ExpectedVersion::Exact(0)).await.unwrap();
        let built = engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();

        store.fail.store(true, Ordering::SeqCst);
        events.append(&ctx(1), agg, seats(4), ExpectedVersion::Exact(1)).await.unwrap();
        assert!(matches!(
            engine.rebuild(&ctx(1), &SeatTotals, None).await,
            Err(StoreError::StorageUnavailable(_))
        ));

        assert_eq!(
            engine.status(&ctx(1), "seat_totals", None).await.unwrap(),
            ProjectionStatus::Stale
        );
        let view = engine.read(&ctx(1), &SeatTotals, None).await.unwrap();
        assert_eq!(view.state, built.state);
        assert_eq!(
            engine.mark_stale(&ctx(1), "seat_totals", None).await.unwrap(),
            ProjectionStatus::Stale
        );

        store.fail.store(false, Ordering::SeqCst);
        let recovered = engine.rebuild(&ctx(1), &SeatTotals, None).await.unwrap();
        assert_eq!(recovered.status, ProjectionStatus::Ready);
        assert_eq!(recovered.state.get(&agg), Some(&4));
    }

    #[test]
    fn decided_events_keep_their_type_names() {
        let event = crate::testing::new_event(&SubscriptionEvent::Cancelled);
        assert_eq!(event.event_type, "subscription.cancelled");
        assert_eq!(event.payload, json!({ "type": "cancelled" }));
    }
}

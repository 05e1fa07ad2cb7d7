//! Stress tests designed to break the lock, once and lease layers.
//!
//! These tests exercise contention, jittered interleavings and cleanup under
//! load.

#[cfg(test)]
mod stress_tests {
    use crate::cache::TtlCache;
    use crate::entity::EntityStore;
    use crate::error::CoreError;
    use crate::lease::{LeaseNotifier, LeaseSettings, TransactionalStore};
    use crate::mutex::{FlowId, MutexManager};
    use crate::once::OnceGuard;
    use crate::record::{Entity, RecordData};
    use crate::store::MemoryStore;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    impl RecordData for Counter {
        const NAMESPACE: &'static str = "counter";
    }

    async fn jitter(max_us: u64) {
        tokio::time::sleep(Duration::from_micros(fastrand::u64(0..max_us))).await;
    }

    fn counters() -> TransactionalStore<Counter> {
        counters_with(LeaseSettings {
            poll_interval: Duration::from_millis(5),
            wait_timeout: Duration::from_secs(30),
            ttl: None,
        })
    }

    fn counters_with(settings: LeaseSettings) -> TransactionalStore<Counter> {
        let entities = EntityStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(TtlCache::new()),
            Duration::from_secs(300),
        );
        TransactionalStore::new(entities, Arc::new(LeaseNotifier::new()), settings)
    }

    // ==========================================================================
    // Keyed Mutex
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn stress_mutex_exclusion_across_keys() {
        const KEYS: usize = 8;
        const TASKS: usize = 64;
        const ROUNDS: usize = 20;

        let mutexes = MutexManager::new();
        let inside: Arc<Vec<AtomicUsize>> =
            Arc::new((0..KEYS).map(|_| AtomicUsize::new(0)).collect());
        let violations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..TASKS {
            let mutexes = mutexes.clone();
            let inside = inside.clone();
            let violations = violations.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    let k = fastrand::usize(0..KEYS);
                    let key = format!("user:{}", k);
                    let _guard = mutexes.lock_guard(&key).await;
                    if inside[k].fetch_add(1, Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    jitter(200).await;
                    inside[k].fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert!(mutexes.is_empty(), "idle entries must be pruned");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn stress_soft_locks_nest_without_leaking() {
        const FLOWS: usize = 32;

        let mutexes = MutexManager::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..FLOWS {
            let mutexes = mutexes.clone();
            let inside = inside.clone();
            let violations = violations.clone();
            handles.push(tokio::spawn(async move {
                let flow = FlowId::new();
                let depth = fastrand::usize(1..5);
                for _ in 0..depth {
                    mutexes.lock_soft("faucet:x", flow).await;
                }
                if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                jitter(300).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                for _ in 0..depth {
                    mutexes.unlock_soft("faucet:x", flow);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert!(!mutexes.is_locked("faucet:x"));
        assert!(mutexes.is_empty());
    }

    // ==========================================================================
    // Once Guard
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn stress_once_admits_each_pair_exactly_once() {
        const OBJECTS: usize = 4;
        const ACTORS: usize = 10;
        const DELIVERIES: usize = 5;

        let guard = OnceGuard::new();
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for object in 0..OBJECTS {
            for actor in 0..ACTORS {
                for _ in 0..DELIVERIES {
                    let guard = guard.clone();
                    let admitted = admitted.clone();
                    handles.push(tokio::spawn(async move {
                        jitter(100).await;
                        match guard.once(&format!("faucet:{}", object), &format!("{}", actor)) {
                            Ok(()) => {
                                admitted.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(CoreError::AlreadyConsumed { .. }) => {}
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }));
                }
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), OBJECTS * ACTORS);
        for object in 0..OBJECTS {
            assert_eq!(guard.consumers(&format!("faucet:{}", object)), ACTORS);
        }
    }

    // ==========================================================================
    // Leases
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn stress_leased_increments_are_not_lost() {
        const TASKS: usize = 16;
        const ROUNDS: u64 = 10;

        let leases = counters();
        let mut seed = Entity::new("counter:1", Counter { value: 0 });
        leases.entities().set(&mut seed).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..TASKS {
            let leases = leases.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    leases
                        .with_lease("counter:1", |mut counter| async move {
                            let read = counter.data.value;
                            jitter(200).await;
                            counter.data.value = read + 1;
                            Ok((counter, ()))
                        })
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = leases.get("counter:1").await.unwrap();
        assert_eq!(stored.data.value, TASKS as u64 * ROUNDS);
        assert!(!stored.in_transaction);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn stress_reclaimed_leases_never_lose_updates() {
        const TASKS: usize = 8;
        const ROUNDS: usize = 10;

        // Holders regularly stall past the ttl and get reclaimed.
        let leases = counters_with(LeaseSettings {
            poll_interval: Duration::from_millis(2),
            wait_timeout: Duration::from_secs(30),
            ttl: Some(Duration::from_millis(15)),
        });
        let mut seed = Entity::new("counter:1", Counter { value: 0 });
        leases.entities().set(&mut seed).await.unwrap();

        let committed = Arc::new(AtomicUsize::new(0));
        let lost = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..TASKS {
            let leases = leases.clone();
            let committed = committed.clone();
            let lost = lost.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    let mut counter = leases.acquire("counter:1").await.unwrap();
                    let read = counter.data.value;
                    jitter(30_000).await;
                    counter.data.value = read + 1;
                    match leases.release(&mut counter).await {
                        Ok(()) => {
                            committed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(CoreError::LeaseLost { .. }) => {
                            lost.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Every committed increment is visible; every stale one wrote nothing.
        let stored = leases.get("counter:1").await.unwrap();
        let committed = committed.load(Ordering::SeqCst);
        assert_eq!(stored.data.value, committed as u64);
        assert_eq!(committed + lost.load(Ordering::SeqCst), TASKS * ROUNDS);
        assert!(!stored.in_transaction);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn stress_leases_on_distinct_records_proceed_independently() {
        const RECORDS: usize = 6;
        const TASKS: usize = 24;

        let leases = counters();
        for i in 0..RECORDS {
            let mut seed = Entity::new(format!("counter:{}", i), Counter { value: 0 });
            leases.entities().set(&mut seed).await.unwrap();
        }

        let mut expected: HashMap<usize, u64> = HashMap::new();
        let mut handles = Vec::new();
        for _ in 0..TASKS {
            let i = fastrand::usize(0..RECORDS);
            *expected.entry(i).or_default() += 1;
            let leases = leases.clone();
            handles.push(tokio::spawn(async move {
                let mut counter = leases.acquire(&format!("counter:{}", i)).await.unwrap();
                jitter(500).await;
                counter.data.value += 1;
                leases.release(&mut counter).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..RECORDS {
            let stored = leases.get(&format!("counter:{}", i)).await.unwrap();
            assert_eq!(stored.data.value, expected.get(&i).copied().unwrap_or(0));
        }
    }
}

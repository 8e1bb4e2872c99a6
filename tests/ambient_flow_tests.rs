/// Ambient context tests
///
/// Flow-local ambient scopes across tasks, suppression and the locators.
/// Run with: cargo test --test ambient_flow_tests

mod common;

use common::{Ledger, LedgerSession, scope_factory, seeded_store};
use dbscope::memory::MemoryStore;
use dbscope::{
    AmbientScopeLocator, AmbientSessionLocator, JoinMode, ScopeError, flow, flow_blocking,
    has_ambient_scope, inherit, suppressed,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_flow_starts_without_ambient_scope() {
    let store = MemoryStore::new();
    let factory = scope_factory(&store);

    flow(async move {
        let scope = factory.create(JoinMode::JoinExisting).unwrap();
        assert!(has_ambient_scope());

        let seen = tokio::spawn(flow(async { has_ambient_scope() }))
            .await
            .unwrap();
        assert!(!seen);
        assert!(has_ambient_scope());
        scope.commit().unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_runtime_code_outside_flow_cannot_open_scope() {
    let store = MemoryStore::new();
    let factory = scope_factory(&store);

    let err = factory.create(JoinMode::JoinExisting).unwrap_err();
    assert!(matches!(err, ScopeError::NoFlowContext));
    assert!(err.is_usage_error());
    assert!(!has_ambient_scope());
    assert!(AmbientScopeLocator.try_get().is_none());
}

#[tokio::test]
async fn test_plain_spawned_tasks_never_share_scope() {
    let store = MemoryStore::new();
    let factory = scope_factory(&store);

    // Opens a scope and holds it across a sleep, like a slow request handler.
    let slow = {
        let factory = factory.clone();
        tokio::spawn(flow(async move {
            let scope = factory.create(JoinMode::JoinExisting).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            let ambient_after_sleep = AmbientScopeLocator.get().unwrap().id();
            let id = scope.id();
            scope.commit().unwrap();
            (id, ambient_after_sleep, scope.dispose())
        }))
    };

    // Spawned without a flow on the same worker thread.
    let plain = {
        let factory = factory.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            (has_ambient_scope(), factory.create(JoinMode::JoinExisting).err())
        })
    };

    let (saw_scope, err) = plain.await.unwrap();
    assert!(!saw_scope);
    assert!(matches!(err, Some(ScopeError::NoFlowContext)));

    let (id, ambient_after_sleep, disposed) = slow.await.unwrap();
    assert_eq!(ambient_after_sleep, id);
    assert!(disposed.is_ok());
}

#[tokio::test]
async fn test_spawned_flows_open_independent_scopes() {
    let store = seeded_store(0);
    let factory = scope_factory(&store);

    let first = {
        let factory = factory.clone();
        tokio::spawn(flow(async move {
            let scope = factory.create(JoinMode::JoinExisting).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            let still_ambient = AmbientScopeLocator.get().unwrap().id() == scope.id();
            let independent = !scope.is_nested() && scope.parent_id().is_none();
            scope.commit().unwrap();
            (still_ambient, independent, scope.dispose())
        }))
    };
    let second = {
        let factory = factory.clone();
        tokio::spawn(flow(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let scope = factory.create(JoinMode::JoinExisting).unwrap();
            let independent = !scope.is_nested() && scope.parent_id().is_none();
            scope.commit().unwrap();
            (true, independent, scope.dispose())
        }))
    };

    for task in [first, second] {
        let (still_ambient, independent, disposed) = task.await.unwrap();
        assert!(still_ambient);
        assert!(independent);
        assert!(disposed.is_ok());
    }
    assert!(!has_ambient_scope());
}

#[test]
fn test_flow_blocking_gives_blocking_code_a_slot() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let store = seeded_store(3);
    let factory = scope_factory(&store);

    let balance = runtime.block_on(async move {
        tokio::task::spawn_blocking(move || {
            assert!(matches!(
                factory.create(JoinMode::JoinExisting),
                Err(ScopeError::NoFlowContext)
            ));
            flow_blocking(|| {
                let scope = factory.create_read_only(JoinMode::JoinExisting).unwrap();
                let balance = AmbientSessionLocator
                    .get::<LedgerSession>()
                    .unwrap()
                    .set::<Ledger>()
                    .find("1")
                    .unwrap()
                    .unwrap()
                    .read()
                    .unwrap()
                    .balance;
                scope.dispose().unwrap();
                balance
            })
        })
        .await
        .unwrap()
    });
    assert_eq!(balance, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_flows_are_isolated() {
    let store = seeded_store(0);
    let factory = scope_factory(&store);

    let tasks = (0..8u32).map(|n| {
        let factory = factory.clone();
        tokio::spawn(flow(async move {
            let scope = factory.create(JoinMode::JoinExisting).unwrap();
            let id = scope.id();
            tokio::task::yield_now().await;

            // Each flow only ever sees its own scope.
            assert_eq!(AmbientScopeLocator.get().unwrap().id(), id);
            let session = AmbientSessionLocator.get::<LedgerSession>().unwrap();
            session
                .set::<Ledger>()
                .add(Ledger {
                    id: 100 + n,
                    balance: n as i64,
                })
                .unwrap();
            tokio::task::yield_now().await;
            let affected = scope.commit().unwrap();
            scope.dispose().unwrap();
            affected
        }))
    });

    let results = futures::future::join_all(tasks).await;
    let affected: usize = results.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(affected, 8);
    assert_eq!(store.len().unwrap(), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scope_follows_flow_across_await() {
    let store = seeded_store(10);
    let factory = scope_factory(&store);

    let balance = flow(async move {
        let scope = factory.create(JoinMode::JoinExisting).unwrap();
        let before = AmbientScopeLocator.get().unwrap().id();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(AmbientScopeLocator.get().unwrap().id(), before);

        let ledger = AmbientSessionLocator
            .get::<LedgerSession>()
            .unwrap()
            .set::<Ledger>()
            .find("1")
            .unwrap()
            .unwrap();
        let balance = ledger.read().unwrap().balance;
        scope.commit().unwrap();
        balance
    })
    .await;

    assert_eq!(balance, 10);
}

#[tokio::test]
async fn test_inherit_shares_scope_with_child_flow() {
    let store = MemoryStore::new();
    let factory = scope_factory(&store);

    flow(async move {
        let scope = factory.create(JoinMode::JoinExisting).unwrap();
        let session = scope.get::<LedgerSession>().unwrap();

        let child = inherit(async {
            let located = AmbientSessionLocator.get::<LedgerSession>().unwrap();
            (AmbientScopeLocator.get().unwrap().id(), located)
        });
        let (child_scope, child_session) = tokio::spawn(child).await.unwrap();

        assert_eq!(child_scope, scope.id());
        assert!(Arc::ptr_eq(&session, &child_session));
        scope.commit().unwrap();
    })
    .await;
}

#[test]
fn test_suppressed_hides_and_restores_scope() {
    let store = MemoryStore::new();
    let factory = scope_factory(&store);
    let scope = factory.create(JoinMode::JoinExisting).unwrap();

    let nested_inside_suppression = suppressed(|| {
        assert!(!has_ambient_scope());
        let independent = factory.create(JoinMode::JoinExisting).unwrap();
        let nested = independent.is_nested();
        independent.commit().unwrap();
        independent.dispose().unwrap();
        nested
    });

    assert!(!nested_inside_suppression);
    assert_eq!(AmbientScopeLocator.get().unwrap().id(), scope.id());
    scope.commit().unwrap();
}

#[test]
fn test_locator_without_scope() {
    assert!(matches!(
        AmbientScopeLocator.get(),
        Err(ScopeError::NoAmbientScope)
    ));
    assert!(
        AmbientSessionLocator
            .try_get::<LedgerSession>()
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_ambient_scope_handle_commits_owner_scope() {
    let store = seeded_store(1);
    let factory = scope_factory(&store);
    let scope = factory.create(JoinMode::JoinExisting).unwrap();
    scope
        .get::<LedgerSession>()
        .unwrap()
        .set::<Ledger>()
        .find("1")
        .unwrap()
        .unwrap()
        .write()
        .unwrap()
        .balance = 2;

    let handle = AmbientScopeLocator.get().unwrap();
    assert_eq!(handle.commit().unwrap(), 1);
    assert!(scope.is_completed());
    drop(handle);
    assert!(!scope.is_disposed());

    scope.dispose().unwrap();
    assert_eq!(store.load::<Ledger>("1").unwrap().unwrap().balance, 2);
}

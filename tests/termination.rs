//! Integration tests for termination
//!
//! Covers explicit termination, termination through chained promises, races
//! with resolution, and release of the isolate when every handle is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use isoworker::{
    Context, Factory, HostKind, InvocationError, Phase, Program, TERMINATED_MESSAGE, WorkerConfig,
};

fn config(host: HostKind) -> WorkerConfig {
    WorkerConfig {
        host,
        ..WorkerConfig::default()
    }
}

/// A computation that never finishes on its own
fn forever(host: HostKind) -> Factory<(), ()> {
    let program = Program::from_async("forever", |_: (), _cx: Context| async move {
        futures::future::pending::<()>().await;
        Ok::<_, anyhow::Error>(())
    });
    Factory::new(program, config(host))
}

/// A blocking loop that exits once its controller lets go, raising `exited`
fn blocking_until_detached(started: Arc<AtomicBool>, exited: Arc<AtomicBool>) -> Factory<(), u64> {
    let program = Program::from_fn("spin", move |_: (), cx: &Context| {
        started.store(true, Ordering::SeqCst);
        let mut turns = 0u64;
        while !cx.is_detached() {
            turns += 1;
            std::thread::sleep(Duration::from_millis(1));
        }
        exited.store(true, Ordering::SeqCst);
        Ok(turns)
    });
    Factory::new(program, config(HostKind::Thread))
}

async fn wait_for(flag: &AtomicBool) {
    for _ in 0..500 {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("flag was never raised");
}

#[tokio::test]
async fn test_terminate_rejects_with_sentinel() {
    for host in [HostKind::Thread, HostKind::Task] {
        let promise = forever(host).invoke(());
        promise.start();
        promise.terminate();

        let err = promise.await.unwrap_err();
        assert_eq!(err, InvocationError::Terminated);
        assert_eq!(err.to_string(), TERMINATED_MESSAGE);
        assert!(err.is_terminated());
    }
}

#[tokio::test]
async fn test_terminate_before_start() {
    let promise = forever(HostKind::Thread).invoke(());
    promise.terminate();
    assert_eq!(promise.phase(), Phase::Settled);
    assert_eq!(promise.await, Err(InvocationError::Terminated));
}

#[tokio::test]
async fn test_terminate_while_awaiting() {
    let promise = forever(HostKind::Task).invoke(());
    let handle = promise.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.terminate();
    });
    assert_eq!(promise.await, Err(InvocationError::Terminated));
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let promise = forever(HostKind::Thread).invoke(());
    let handle = promise.handle();
    promise.terminate();
    promise.terminate();
    handle.terminate();
    assert_eq!(promise.await, Err(InvocationError::Terminated));
    handle.terminate();
}

#[tokio::test]
async fn test_terminate_after_resolve_does_nothing() {
    let program = Program::from_fn("add", |x: i64, _cx: &Context| Ok(x + 2));
    let promise = Factory::<i64, i64>::new(program, WorkerConfig::default()).invoke(3);
    let handle = promise.handle();

    assert_eq!(promise.await, Ok(5));
    handle.terminate();
    assert_eq!(handle.phase(), Phase::Settled);
}

#[tokio::test]
async fn test_terminate_through_chain() {
    let chained = forever(HostKind::Thread)
        .invoke(())
        .map(|()| 1)
        .then(|result| async move { result.map(|n| n * 2) })
        .and_then(|n| async move { Ok::<_, InvocationError>(n + 1) });

    chained.terminate();
    assert_eq!(chained.await, Err(InvocationError::Terminated));
}

#[tokio::test]
async fn test_catch_observes_termination() {
    let recovered = forever(HostKind::Task)
        .invoke(())
        .map(|()| 0)
        .catch(|err| async move {
            if err.is_terminated() {
                Ok(-1)
            } else {
                Err(err)
            }
        });

    recovered.terminate();
    assert_eq!(recovered.await, Ok(-1));
}

#[tokio::test]
async fn test_map_err_keeps_terminate() {
    let promise = forever(HostKind::Thread)
        .invoke(())
        .map_err(|err| InvocationError::Marshal(format!("wrapped: {err}")));

    promise.terminate();
    assert_eq!(
        promise.await,
        Err(InvocationError::Marshal("wrapped: WORKER_TERMINATED".to_string()))
    );
}

#[tokio::test]
async fn test_resolution_races_with_termination() {
    let program = Program::from_fn("add", |x: i64, _cx: &Context| Ok(x + 2));
    let factory: Factory<i64, i64> = Factory::new(program, config(HostKind::Thread));

    for round in 0..20u64 {
        let promise = factory.invoke(3);
        promise.start();
        tokio::time::sleep(Duration::from_micros(round * 50)).await;
        promise.terminate();

        let result = promise.await;
        assert!(
            result == Ok(5) || result == Err(InvocationError::Terminated),
            "unexpected outcome: {result:?}"
        );
    }
}

#[tokio::test]
async fn test_blocking_computation_exits_after_terminate() {
    let started = Arc::new(AtomicBool::new(false));
    let exited = Arc::new(AtomicBool::new(false));
    let factory = blocking_until_detached(Arc::clone(&started), Arc::clone(&exited));

    let promise = factory.invoke(());
    promise.start();
    wait_for(&started).await;
    assert!(!exited.load(Ordering::SeqCst));

    promise.terminate();
    assert_eq!(promise.await, Err(InvocationError::Terminated));
    wait_for(&exited).await;
}

#[tokio::test]
async fn test_dropping_every_handle_releases_isolate() {
    let started = Arc::new(AtomicBool::new(false));
    let exited = Arc::new(AtomicBool::new(false));
    let factory = blocking_until_detached(Arc::clone(&started), Arc::clone(&exited));

    let promise = factory.invoke(());
    let handle = promise.handle();
    promise.start();
    wait_for(&started).await;

    drop(promise);
    assert!(!handle.is_settled());
    drop(handle);
    wait_for(&exited).await;
}

#[tokio::test]
async fn test_terminate_does_not_wait_for_blocking_computation() {
    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    let exited = Arc::new(AtomicBool::new(false));

    let (gate, entered, left) = (
        Arc::clone(&release),
        Arc::clone(&started),
        Arc::clone(&exited),
    );
    let program = Program::from_fn("stubborn", move |_: (), _cx: &Context| {
        entered.store(true, Ordering::SeqCst);
        while !gate.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        left.store(true, Ordering::SeqCst);
        Ok(())
    });
    let factory: Factory<(), ()> = Factory::new(program, config(HostKind::Thread));

    let promise = factory.invoke(());
    promise.start();
    wait_for(&started).await;

    promise.terminate();
    assert_eq!(promise.await, Err(InvocationError::Terminated));
    assert!(!exited.load(Ordering::SeqCst));

    release.store(true, Ordering::SeqCst);
    wait_for(&exited).await;
}

//! Promise semantics: single resolution, replayable outcomes, scheduling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use miniagents::{Error, MiniAgents, Promise, PromisingContext, ResolvedValue};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn resolver_runs_at_most_once_across_concurrent_awaits() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();

    MiniAgents::new()
        .run(async {
            let promise: Promise<String> = Promise::with_options(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    Ok("value".to_string())
                },
                Some(false),
            )?;

            let (a, b, c) = tokio::join!(promise.resolve(), promise.resolve(), promise.resolve());
            assert_eq!(a?, "value");
            assert_eq!(b?, "value");
            assert_eq!(c?, "value");
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn prefilled_promise_replays_its_value() {
    MiniAgents::new()
        .run(async {
            let promise = Promise::prefilled("ready".to_string())?;
            assert!(promise.is_resolved());
            assert_eq!(assert_ok!(promise.resolve().await), "ready");
            assert_eq!(assert_ok!(promise.resolve().await), "ready");
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_resolution_is_cached_and_replayed() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();

    MiniAgents::new()
        .run(async {
            let promise: Promise<String> = Promise::with_options(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::raised("resolver blew up"))
                },
                Some(false),
            )?;

            let first = assert_err!(promise.resolve().await);
            let second = assert_err!(promise.resolve().await);
            assert_eq!(first, second);
            assert_eq!(first, Error::raised("resolver blew up"));
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_soon_resolves_before_anyone_awaits() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();

    MiniAgents::new()
        .run(async {
            let _promise: Promise<String> = Promise::with_options(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("eager".to_string())
                },
                Some(true),
            )?;
            // never awaited; finalize drains the background task
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resolver_awaiting_its_own_promise_fails_fast() {
    MiniAgents::new()
        .run(async {
            let slot: Arc<OnceLock<Promise<String>>> = Arc::new(OnceLock::new());
            let inner_slot = slot.clone();

            let promise: Promise<String> = Promise::with_options(
                move || async move {
                    let me = inner_slot.get().expect("promise wired").clone();
                    me.resolve().await
                },
                Some(false),
            )?;
            slot.set(promise.clone()).ok();

            let err = promise.resolve().await.unwrap_err();
            assert!(matches!(err, Error::Deadlock(_)));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn resolved_event_reaches_registered_handlers() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let runtime = MiniAgents::builder()
        .on_promise_resolved(move |event| {
            let sink = sink.clone();
            async move {
                if let Some(ResolvedValue::Text(text)) = event.value {
                    sink.lock().unwrap().push(text);
                }
            }
        })
        .build();

    runtime
        .run(async {
            let promise = Promise::prefilled("observed".to_string())?;
            promise.resolve().await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(seen.lock().unwrap().as_slice(), ["observed".to_string()]);
}

#[tokio::test]
async fn promise_construction_requires_a_context() {
    let result = Promise::prefilled("homeless".to_string());
    assert!(matches!(result, Err(Error::NoActiveContext(_))));
    assert!(PromisingContext::try_current().is_none());
}

//! Handler failures are cached and replayed like successes.

use std::sync::{Arc, atomic::Ordering};

use quern::{EngineBuilder, EvaluateError};
use quern_integration_test::{Brittle, BrittleHandler};

#[tokio::test]
async fn failures_are_memoized_until_invalidated() {
    let handler = Arc::new(BrittleHandler::default());

    let mut builder = EngineBuilder::new();
    builder
        .register_handler::<Brittle, _>(handler.clone())
        .expect("first registration");
    let engine = builder.build();

    let first = engine.evaluate(&Brittle(0)).await.unwrap_err();
    let EvaluateError::Failed(ref payload) = first else {
        panic!("expected a handler failure, got {first:?}");
    };
    assert_eq!(payload.downcast_ref::<usize>(), Some(&0));
    assert_eq!(handler.calls.load(Ordering::Relaxed), 1);

    // the identical failure comes back without running the handler again
    let second = engine.evaluate(&Brittle(0)).await.unwrap_err();
    assert_eq!(second, first);
    assert_eq!(handler.calls.load(Ordering::Relaxed), 1);

    // after invalidation the handler runs again and fails freshly
    engine.invalidate(&Brittle(0));

    let third = engine.evaluate(&Brittle(0)).await.unwrap_err();
    let EvaluateError::Failed(ref payload) = third else {
        panic!("expected a handler failure, got {third:?}");
    };
    assert_eq!(payload.downcast_ref::<usize>(), Some(&1));
    assert_ne!(third, first);
    assert_eq!(handler.calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn dependents_observe_the_cached_failure() {
    let handler = Arc::new(BrittleHandler::default());

    let mut builder = EngineBuilder::new();
    builder
        .register_handler::<Brittle, _>(handler.clone())
        .expect("first registration");
    let engine = builder.build();

    // the base failure bubbles through the chain and every node caches it
    let outer = engine.evaluate(&Brittle(3)).await.unwrap_err();
    let EvaluateError::Failed(ref payload) = outer else {
        panic!("expected a handler failure, got {outer:?}");
    };
    assert_eq!(payload.downcast_ref::<usize>(), Some(&0));
    assert_eq!(handler.calls.load(Ordering::Relaxed), 4);

    assert_eq!(engine.evaluate(&Brittle(3)).await.unwrap_err(), outer);
    assert_eq!(engine.evaluate(&Brittle(1)).await.unwrap_err(), outer);
    assert_eq!(handler.calls.load(Ordering::Relaxed), 4);
}

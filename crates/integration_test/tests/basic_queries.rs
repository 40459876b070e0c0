//! Basic evaluation and caching behavior.

use std::sync::{Arc, atomic::Ordering};

use quern::EngineBuilder;
use quern_integration_test::{Sum, SumHandler};

#[tokio::test]
async fn cache_hit() {
    let handler = Arc::new(SumHandler::default());

    let mut builder = EngineBuilder::new();
    builder
        .register_handler::<Sum, _>(handler.clone())
        .expect("first registration");
    let engine = builder.build();

    assert_eq!(engine.evaluate(&Sum(5)).await, Ok(15));
    assert_eq!(handler.calls.load(Ordering::Relaxed), 6);

    // the second request is served entirely from the cache
    assert_eq!(engine.evaluate(&Sum(5)).await, Ok(15));
    assert_eq!(handler.calls.load(Ordering::Relaxed), 6);
}

#[tokio::test]
async fn intermediate_queries_are_cached_individually() {
    let handler = Arc::new(SumHandler::default());

    let mut builder = EngineBuilder::new();
    builder
        .register_handler::<Sum, _>(handler.clone())
        .expect("first registration");
    let engine = builder.build();

    assert_eq!(engine.evaluate(&Sum(5)).await, Ok(15));

    // every step of the chain is its own node
    assert_eq!(engine.evaluate(&Sum(3)).await, Ok(6));
    assert_eq!(handler.calls.load(Ordering::Relaxed), 6);

    // extending the chain only computes the new top
    assert_eq!(engine.evaluate(&Sum(6)).await, Ok(21));
    assert_eq!(handler.calls.load(Ordering::Relaxed), 7);
}

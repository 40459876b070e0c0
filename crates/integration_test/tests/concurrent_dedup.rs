//! Concurrent requests for one query share a single handler invocation.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use quern::EngineBuilder;
use quern_integration_test::{Slow, SlowHandler};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn three_concurrent_callers_one_invocation() {
    let handler = Arc::new(SlowHandler::new(Duration::from_millis(500)));

    let mut builder = EngineBuilder::new();
    builder
        .register_handler::<Slow, _>(handler.clone())
        .expect("first registration");
    let engine = builder.build();

    let start = Instant::now();

    // two callers race from the start; the third joins mid-flight
    let (first, second, third) = tokio::join!(
        engine.evaluate(&Slow(5)),
        engine.evaluate(&Slow(5)),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            engine.evaluate(&Slow(5)).await
        },
    );

    let elapsed = start.elapsed();

    assert_eq!(first, Ok(5));
    assert_eq!(second, Ok(5));
    assert_eq!(third, Ok(5));

    assert_eq!(handler.calls.load(Ordering::Relaxed), 1);

    // one 500 ms invocation, shared: neither three sequential runs (1500 ms)
    // nor a second run for the late joiner (800 ms)
    assert!(elapsed >= Duration::from_millis(400), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(600), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn distinct_queries_run_concurrently() {
    let handler = Arc::new(SlowHandler::new(Duration::from_millis(500)));

    let mut builder = EngineBuilder::new();
    builder
        .register_handler::<Slow, _>(handler.clone())
        .expect("first registration");
    let engine = builder.build();

    let start = Instant::now();

    let (first, second) =
        tokio::join!(engine.evaluate(&Slow(1)), engine.evaluate(&Slow(2)));

    assert_eq!(first, Ok(1));
    assert_eq!(second, Ok(2));
    assert_eq!(handler.calls.load(Ordering::Relaxed), 2);

    // no serialization across distinct queries
    assert!(start.elapsed() <= Duration::from_millis(600));
}

//! Observable handlers: external change signals drive invalidation.

use std::sync::{Arc, atomic::Ordering};

use quern::{EngineBuilder, QueryKey, Validity};
use quern_integration_test::{
    FileContent, FileContentHandler, LineCount, LineCountHandler,
};

#[tokio::test]
async fn file_changes_flow_through_the_change_stream() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("input.txt");

    std::fs::write(&path, "a\nb\n").expect("write input");

    let file_handler = Arc::new(FileContentHandler::new());
    let line_handler = Arc::new(LineCountHandler::default());

    let mut builder = EngineBuilder::new();
    builder
        .register_handler::<FileContent, _>(file_handler.clone())
        .expect("first registration");
    builder
        .register_handler::<LineCount, _>(line_handler.clone())
        .expect("first registration");
    let engine = builder.build();

    let count = LineCount { path: path.clone() };

    assert_eq!(engine.evaluate(&count).await, Ok(2));
    assert_eq!(file_handler.calls.load(Ordering::Relaxed), 1);
    assert_eq!(line_handler.calls.load(Ordering::Relaxed), 1);

    // the file changes on disk; the watcher half reports it
    std::fs::write(&path, "a\nb\nc\n").expect("rewrite input");
    file_handler.notify_changed(path.clone());

    let snapshot = engine.snapshot();
    assert_eq!(
        snapshot.validity(&QueryKey::new(&FileContent {
            path: path.clone()
        })),
        Validity::StronglyInvalid
    );
    assert_eq!(
        snapshot.validity(&QueryKey::new(&count)),
        Validity::WeaklyInvalid
    );

    assert_eq!(engine.evaluate(&count).await, Ok(3));
    assert_eq!(file_handler.calls.load(Ordering::Relaxed), 2);
    assert_eq!(line_handler.calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn spurious_signals_revalidate_without_recomputing_dependents() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("input.txt");

    std::fs::write(&path, "a\nb\n").expect("write input");

    let file_handler = Arc::new(FileContentHandler::new());
    let line_handler = Arc::new(LineCountHandler::default());

    let mut builder = EngineBuilder::new();
    builder
        .register_handler::<FileContent, _>(file_handler.clone())
        .expect("first registration");
    builder
        .register_handler::<LineCount, _>(line_handler.clone())
        .expect("first registration");
    let engine = builder.build();

    let count = LineCount { path: path.clone() };

    assert_eq!(engine.evaluate(&count).await, Ok(2));

    // a signal without an actual change: the file is re-read, the contents
    // are identical, and the dependent is promoted back from the cache
    file_handler.notify_changed(path.clone());

    assert_eq!(engine.evaluate(&count).await, Ok(2));
    assert_eq!(file_handler.calls.load(Ordering::Relaxed), 2);
    assert_eq!(line_handler.calls.load(Ordering::Relaxed), 1);

    assert_eq!(
        engine.snapshot().validity(&QueryKey::new(&count)),
        Validity::Valid
    );
}

#[tokio::test]
async fn missing_files_fail_and_recover() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("late.txt");

    let file_handler = Arc::new(FileContentHandler::new());

    let mut builder = EngineBuilder::new();
    builder
        .register_handler::<FileContent, _>(file_handler.clone())
        .expect("first registration");
    let engine = builder.build();

    let content = FileContent { path: path.clone() };

    // the read failure is cached
    assert!(engine.evaluate(&content).await.is_err());
    assert!(engine.evaluate(&content).await.is_err());
    assert_eq!(file_handler.calls.load(Ordering::Relaxed), 1);

    // the file appears and the watcher reports it
    std::fs::write(&path, "hello\n").expect("write input");
    file_handler.notify_changed(path);

    assert_eq!(engine.evaluate(&content).await, Ok("hello\n".to_owned()));
    assert_eq!(file_handler.calls.load(Ordering::Relaxed), 2);
}

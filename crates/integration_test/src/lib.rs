//! Shared query types and handlers for the end-to-end scenario tests.
//!
//! The arithmetic family mirrors the classic incremental-computation demo:
//! `Sum(n)` folds the integers `0..=n` through one dependency edge per step,
//! so a single invalidation exercises the whole weak-propagation machinery.
//! The file queries show an observable handler feeding external change
//! signals into the engine.

#![allow(missing_docs)]
#![allow(clippy::must_use_candidate)]

use std::{
    path::PathBuf,
    sync::atomic::{AtomicI64, AtomicUsize, Ordering},
    time::Duration,
};

use quern::{ChangeStream, Handler, HandlerError, Query, QueryContext};
use serde::{Deserialize, Serialize};

// ============================================================================
// Arithmetic Queries
// ============================================================================

/// Sum of `0..=n`, plus the handler's offset once per recursion step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Sum(pub i64);

impl Query for Sum {
    type Value = i64;
}

#[derive(Debug, Default)]
pub struct SumHandler {
    /// Added at every recursion step; changing it changes every `Sum(n)`
    /// with `n > 0`.
    pub offset: AtomicI64,
    pub calls: AtomicUsize,
}

impl Handler<Sum> for SumHandler {
    async fn evaluate(
        &self,
        query: &Sum,
        ctx: &QueryContext,
    ) -> Result<i64, HandlerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if query.0 <= 0 {
            return Ok(query.0);
        }

        let previous = ctx.evaluate(&Sum(query.0 - 1)).await?;

        Ok(previous + query.0 + self.offset.load(Ordering::Relaxed))
    }
}

/// Returns its input after a fixed delay; used to observe in-flight
/// deduplication from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slow(pub i64);

impl Query for Slow {
    type Value = i64;
}

#[derive(Debug)]
pub struct SlowHandler {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay, calls: AtomicUsize::new(0) }
    }
}

impl Handler<Slow> for SlowHandler {
    async fn evaluate(
        &self,
        query: &Slow,
        _ctx: &QueryContext,
    ) -> Result<i64, HandlerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        tokio::time::sleep(self.delay).await;

        Ok(query.0)
    }
}

/// Like [`Sum`], but the base case fails with a fresh payload per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Brittle(pub i64);

impl Query for Brittle {
    type Value = i64;
}

#[derive(Debug, Default)]
pub struct BrittleHandler {
    pub calls: AtomicUsize,
    counter: AtomicUsize,
}

impl Handler<Brittle> for BrittleHandler {
    async fn evaluate(
        &self,
        query: &Brittle,
        ctx: &QueryContext,
    ) -> Result<i64, HandlerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if query.0 <= 0 {
            return Err(HandlerError::new(
                self.counter.fetch_add(1, Ordering::Relaxed),
            ));
        }

        Ok(ctx.evaluate(&Brittle(query.0 - 1)).await? + query.0)
    }
}

// ============================================================================
// File Queries
// ============================================================================

/// Contents of a file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileContent {
    pub path: PathBuf,
}

impl Query for FileContent {
    type Value = String;
}

/// Reads files and reports external modifications through its change
/// stream.
///
/// A real deployment would wire [`Self::notify_changed`] to a directory
/// watcher; the tests call it directly.
#[derive(Debug, Default)]
pub struct FileContentHandler {
    stream: ChangeStream,
    pub calls: AtomicUsize,
}

impl FileContentHandler {
    pub fn new() -> Self { Self::default() }

    /// Reports that a path's contents changed on disk.
    pub fn notify_changed(&self, path: PathBuf) {
        self.stream.emit(&FileContent { path });
    }
}

impl Handler<FileContent> for FileContentHandler {
    async fn evaluate(
        &self,
        query: &FileContent,
        _ctx: &QueryContext,
    ) -> Result<String, HandlerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        tokio::fs::read_to_string(&query.path)
            .await
            .map_err(|error| HandlerError::new(error.to_string()))
    }

    fn changes(&self) -> Option<&ChangeStream> { Some(&self.stream) }
}

/// Number of lines in a file, derived from [`FileContent`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LineCount {
    pub path: PathBuf,
}

impl Query for LineCount {
    type Value = usize;
}

#[derive(Debug, Default)]
pub struct LineCountHandler {
    pub calls: AtomicUsize,
}

impl Handler<LineCount> for LineCountHandler {
    async fn evaluate(
        &self,
        query: &LineCount,
        ctx: &QueryContext,
    ) -> Result<usize, HandlerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let content = ctx
            .evaluate(&FileContent { path: query.path.clone() })
            .await?;

        Ok(content.lines().count())
    }
}

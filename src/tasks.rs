//! Asynchronous dispatch for aggregation updates.
//!
//! Updates are designed to be fired by an external scheduler with
//! at-least-once semantics: every invocation is safe to repeat, and a
//! non-forced rerun over converged data writes nothing. The batch runner
//! fans one update task out per user on the tokio runtime.

use crate::aggregation::{AggregationUpdater, UpdateError};
use crate::completion::CompletionLog;
use crate::course::CourseCatalog;
use crate::models::{BlockKey, CourseKey};
use crate::store::InMemoryStore;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared, read-mostly inputs for update invocations.
///
/// The catalog and completion log are read-only during a run; the store
/// serializes its own writes, so one context can serve many concurrent
/// update tasks.
#[derive(Debug)]
pub struct UpdateContext {
    /// Course structures.
    pub catalog: CourseCatalog,
    /// Raw completion events.
    pub completions: CompletionLog,
    /// Aggregate record store.
    pub store: InMemoryStore,
}

/// Result of a batch run over many users.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Users whose update completed.
    pub succeeded: Vec<String>,
    /// Users whose update failed, with the error message.
    pub failed: Vec<(String, String)>,
}

impl BatchOutcome {
    /// Whether every user updated cleanly.
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Update aggregators for one user in one course.
///
/// `changed_blocks` is forwarded to the updater; the current algorithm
/// recalculates the full tree regardless. Repeated invocation with the same
/// arguments is idempotent once the stored records have converged.
pub async fn update_aggregators(
    ctx: Arc<UpdateContext>,
    user: String,
    course_key: CourseKey,
    changed_blocks: HashSet<BlockKey>,
    force: bool,
) -> Result<(), UpdateError> {
    let updater = AggregationUpdater::new(
        user,
        course_key,
        &ctx.catalog,
        &ctx.completions,
        &ctx.store,
    )?;
    updater.update(&changed_blocks, force)
}

/// Update aggregators for every given user in a course, concurrently.
///
/// Each user runs as its own tokio task; a failure for one user does not
/// stop the others. Failures are logged and collected for the caller, which
/// decides whether to retry (re-dispatch) or report.
pub async fn update_course(
    ctx: Arc<UpdateContext>,
    course_key: CourseKey,
    users: Vec<String>,
    changed_blocks: HashSet<BlockKey>,
    force: bool,
    show_progress: bool,
) -> BatchOutcome {
    info!(
        "Dispatching aggregation updates for {} users in {}",
        users.len(),
        course_key
    );

    let progress = if show_progress {
        let pb = ProgressBar::new(users.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let mut handles = Vec::with_capacity(users.len());
    for user in users {
        let ctx = Arc::clone(&ctx);
        let course_key = course_key.clone();
        let changed_blocks = changed_blocks.clone();
        let progress = progress.clone();

        handles.push(tokio::spawn(async move {
            let result =
                update_aggregators(ctx, user.clone(), course_key, changed_blocks, force).await;
            if let Some(pb) = progress {
                pb.inc(1);
            }
            (user, result)
        }));
    }

    let mut outcome = BatchOutcome::default();
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok((user, Ok(()))) => outcome.succeeded.push(user),
            Ok((user, Err(e))) => {
                warn!("Aggregation update failed for {}: {}", user, e);
                outcome.failed.push((user, e.to_string()));
            }
            Err(join_error) => {
                warn!("Aggregation update task panicked: {}", join_error);
                outcome
                    .failed
                    .push(("<unknown>".to_string(), join_error.to_string()));
            }
        }
    }

    if let Some(pb) = progress {
        pb.finish_with_message("Updates complete");
    }

    outcome
}

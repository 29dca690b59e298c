//! Fan-out/fan-in task supervision.
//!
//! Tasks return [`VmshimResult`]; a panic inside a task is caught at the
//! task boundary and reported as [`VmshimError::Internal`].

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use vmshim_shared::errors::{VmshimError, VmshimResult};

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn guarded<F>(name: &'static str, fut: F) -> VmshimResult<()>
where
    F: Future<Output = VmshimResult<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(task = name, "Task panicked: {}", message);
            Err(VmshimError::Internal(format!(
                "task {} panicked: {}",
                name, message
            )))
        }
    }
}

/// Spawn a detached task whose errors (and panics) are logged.
pub fn spawn_supervised<F>(name: &'static str, fut: F) -> JoinHandle<VmshimResult<()>>
where
    F: Future<Output = VmshimResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = guarded(name, fut).await;
        match &result {
            Err(e) if e.is_cancelled() => tracing::debug!(task = name, "Task cancelled"),
            Err(e) => tracing::warn!(task = name, "Task failed: {}", e),
            Ok(()) => tracing::trace!(task = name, "Task finished"),
        }
        result
    })
}

/// A set of tasks joined with "wait for all, first error wins".
///
/// The first failing task cancels the group token; siblings are expected to
/// observe it and return.
pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: JoinSet<VmshimResult<()>>,
}

impl TaskGroup {
    /// New group whose token is a child of `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    /// Token that fires when any task fails or the parent is cancelled.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = VmshimResult<()>> + Send + 'static,
    {
        self.tasks.spawn(guarded(name, fut));
    }

    /// Wait for every task. Returns the first error, if any.
    pub async fn wait(mut self) -> VmshimResult<()> {
        let mut first: Option<VmshimError> = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(VmshimError::Internal(format!("task join failed: {}", e))),
            };
            if let Err(e) = result {
                if first.is_none() {
                    self.cancel.cancel();
                    first = Some(e);
                } else {
                    tracing::trace!("Suppressed sibling error: {}", e);
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_all_ok() {
        let mut group = TaskGroup::new(&CancellationToken::new());
        group.spawn("a", async { Ok(()) });
        group.spawn("b", async { Ok(()) });
        group.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_error_cancels_siblings() {
        let mut group = TaskGroup::new(&CancellationToken::new());
        let token = group.token();
        group.spawn("slow", async move {
            tokio::select! {
                _ = token.cancelled() => Err(VmshimError::Cancelled("slow".into())),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
            }
        });
        group.spawn("fail", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(VmshimError::Network("boom".into()))
        });

        let err = tokio::time::timeout(Duration::from_secs(5), group.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, VmshimError::Network(_)));
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let mut group = TaskGroup::new(&CancellationToken::new());
        group.spawn("panicky", async {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });
        let err = group.wait().await.unwrap_err();
        match err {
            VmshimError::Internal(msg) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_supervised_reports_panic() {
        let handle = spawn_supervised("bg", async {
            if true {
                panic!("bg panic");
            }
            Ok(())
        });
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(VmshimError::Internal(_))));
    }
}

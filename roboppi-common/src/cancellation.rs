//! Reason-tagged, hierarchical cancellation handles.
//!
//! A handle can have children; firing a parent fires every descendant
//! exactly once. This is the propagation mechanism spec'd in spec.md §9:
//! a step's handle is a child of its permit's handle, which is a child of
//! the workflow's handle, so a single workflow-level cancel reaches every
//! in-flight worker.

use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Notify;

/// Why a cancellation handle fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Fired by an explicit user/scheduler-initiated cancel.
    User,
    /// Fired by a deadline timer.
    Deadline,
    /// Fired by the stall sentinel, carrying its trigger fingerprint.
    Sentinel(String),
    /// Any other caller-supplied reason.
    Other(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::User => write!(f, "user"),
            CancelReason::Deadline => write!(f, "deadline-exceeded"),
            CancelReason::Sentinel(fingerprint) => write!(f, "sentinel:{fingerprint}"),
            CancelReason::Other(s) => write!(f, "{s}"),
        }
    }
}

struct CancelHandleInner {
    fired: RwLock<Option<CancelReason>>,
    notify: Notify,
    parent: Option<CancelHandle>,
    children: RwLock<Vec<CancelHandle>>,
}

/// A one-shot, hierarchical cancellation handle.
///
/// Cloning shares the same underlying state. Firing is idempotent: a
/// handle fired twice still notifies its listeners exactly once (the
/// second call observes `already_aborted` and does nothing further).
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelHandleInner>,
}

impl CancelHandle {
    /// Create a fresh, unfired root handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelHandleInner {
                fired: RwLock::new(None),
                notify: Notify::new(),
                parent: None,
                children: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Create a child handle. Firing `self` fires every child recursively;
    /// firing a child never fires its parent.
    pub fn child(&self) -> Self {
        let child = Self {
            inner: Arc::new(CancelHandleInner {
                fired: RwLock::new(None),
                notify: Notify::new(),
                parent: Some(self.clone()),
                children: RwLock::new(Vec::new()),
            }),
        };
        self.inner.children.write().push(child.clone());
        child
    }

    /// Fire this handle and all descendants with `reason`. No-op if
    /// already fired.
    pub fn fire(&self, reason: CancelReason) {
        {
            let mut fired = self.inner.fired.write();
            if fired.is_some() {
                return;
            }
            *fired = Some(reason.clone());
        }
        self.inner.notify.notify_waiters();
        for child in self.inner.children.read().clone() {
            child.fire(reason.clone());
        }
    }

    /// True if this handle (or an ancestor) has fired.
    pub fn is_aborted(&self) -> bool {
        if self.inner.fired.read().is_some() {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_aborted(),
            None => false,
        }
    }

    /// The reason this handle fired, if it has.
    pub fn reason(&self) -> Option<CancelReason> {
        if let Some(reason) = self.inner.fired.read().clone() {
            return Some(reason);
        }
        self.inner.parent.as_ref().and_then(|p| p.reason())
    }

    /// Resolves once this handle is aborted. Returns immediately if
    /// already aborted.
    pub async fn aborted(&self) {
        if self.is_aborted() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }

    /// An owned future equivalent of [`Self::aborted`], for use in
    /// `tokio::select!` arms that need a `'static` future.
    pub fn aborted_owned(self) -> Aborted {
        Aborted { handle: self }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`CancelHandle::aborted_owned`].
pub struct Aborted {
    handle: CancelHandle,
}

impl Future for Aborted {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.handle.is_aborted() {
            return Poll::Ready(());
        }
        let notified = self.handle.inner.notify.notified();
        tokio::pin!(notified);
        notified.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_once_and_is_idempotent() {
        let handle = CancelHandle::new();
        assert!(!handle.is_aborted());
        handle.fire(CancelReason::User);
        assert!(handle.is_aborted());
        handle.fire(CancelReason::Deadline); // no-op, reason stays User
        assert_eq!(handle.reason(), Some(CancelReason::User));
    }

    #[tokio::test]
    async fn firing_parent_fires_child() {
        let parent = CancelHandle::new();
        let child = parent.child();
        assert!(!child.is_aborted());
        parent.fire(CancelReason::Sentinel("no-output".into()));
        assert!(child.is_aborted());
        assert_eq!(
            child.reason(),
            Some(CancelReason::Sentinel("no-output".into()))
        );
    }

    #[tokio::test]
    async fn aborted_future_resolves() {
        let handle = CancelHandle::new();
        let h2 = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
            h2.fire(CancelReason::User);
        });
        tokio::time::timeout(tokio::time::Duration::from_secs(1), handle.aborted())
            .await
            .expect("should resolve once fired");
    }

    #[tokio::test]
    async fn firing_child_does_not_fire_parent() {
        let parent = CancelHandle::new();
        let child = parent.child();
        child.fire(CancelReason::Deadline);
        assert!(child.is_aborted());
        assert!(!parent.is_aborted());
    }
}

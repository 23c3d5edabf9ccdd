//! Per-working-tree lock manager.
//!
//! Many in-flight requests may want different revisions of the same
//! repository checked out into the same filesystem tree. The lock manager
//! serializes what revision a tree holds while letting requests that want
//! the revision already checked out share it:
//!
//! - At most one checkout callback runs per tree at a time.
//! - Callers wanting the currently held revision obtain shared access,
//!   provided both the current holders and the new caller permit concurrent
//!   processing (renderers that write marker files into the tree do not).
//! - Callers wanting a different revision queue up and are admitted in FIFO
//!   order once the current holders release.
//! - A failed checkout restores the previous state and propagates the error
//!   to the requesting caller only.
//!
//! Coordination uses `tokio::sync::Notify` with the notified-future-created-
//! before-state-check pattern, so a wakeup between the state check and the
//! await cannot be missed. Tickets provide the FIFO ordering; `notify_waiters`
//! wakes everyone and only the front ticket makes progress.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Lock registry keyed by canonical tree root.
#[derive(Default)]
pub struct WorkingTreeLocks {
    states: DashMap<PathBuf, Arc<TreeState>>,
}

/// Map of path-keyed async mutexes.
///
/// Used to run per-tree side effects (dependency builds) at most once at a
/// time per path. This map only serializes tasks inside one process; the
/// marker file written by the caller covers repeats across restarts.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
}

impl KeyedLocks {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the mutex for a path, creating it on first use.
    pub async fn lock(&self, key: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

#[derive(Debug)]
struct TreeState {
    inner: Mutex<TreeInner>,
    notify: Notify,
}

#[derive(Debug)]
struct TreeInner {
    /// Revision the tree currently holds. Survives release so a later
    /// request for the same revision can skip the checkout.
    revision: Option<String>,
    /// Number of active holders.
    holders: usize,
    /// Whether the current holders permit sharing.
    allow_concurrent: bool,
    /// A checkout callback is running; nobody else may proceed.
    checking_out: bool,
    /// FIFO admission queue of waiter tickets.
    queue: VecDeque<u64>,
    next_ticket: u64,
}

/// Holds shared or exclusive access to a working tree. Dropping the guard
/// releases it; [`TreeLockGuard::release`] does the same explicitly. Release
/// is idempotent.
#[derive(Debug)]
pub struct TreeLockGuard {
    state: Arc<TreeState>,
    released: bool,
}

impl TreeLockGuard {
    /// Releases the lock now instead of at drop time.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut inner = self.state.inner.lock().unwrap();
            inner.holders = inner.holders.saturating_sub(1);
        }
        self.state.notify.notify_waiters();
    }
}

impl Drop for TreeLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

enum Admission {
    /// Caller owns the tree; the checkout callback must run.
    NeedsCheckout,
    /// Caller was admitted without a checkout (shared, or the tree already
    /// holds the revision).
    Admitted,
}

/// Removes a waiter's ticket if its `lock` future is dropped before
/// admission, so a cancelled request cannot wedge the queue head.
struct QueueGuard {
    state: Arc<TreeState>,
    ticket: u64,
    armed: bool,
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut inner = self.state.inner.lock().unwrap();
            inner.queue.retain(|t| *t != self.ticket);
        }
        self.state.notify.notify_waiters();
    }
}

/// Clears the in-progress checkout marker if the owning future is dropped
/// mid-checkout. The tree contents are indeterminate at that point, so the
/// recorded revision is cleared and the next owner re-checks out.
struct CheckoutReset {
    state: Arc<TreeState>,
    armed: bool,
}

impl Drop for CheckoutReset {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut inner = self.state.inner.lock().unwrap();
            inner.checking_out = false;
            inner.revision = None;
        }
        self.state.notify.notify_waiters();
    }
}

impl WorkingTreeLocks {
    /// Creates an empty lock registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The revision a tree currently holds, if any.
    #[must_use]
    pub fn held_revision(&self, root: &Path) -> Option<String> {
        let state = self.states.get(root)?;
        let inner = state.inner.lock().unwrap();
        inner.revision.clone()
    }

    /// Acquires access to the tree at `root` for `revision`.
    ///
    /// When the tree must switch revisions, `checkout` runs while the caller
    /// exclusively owns the tree; its failure leaves the previous state
    /// intact and is returned to this caller only.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use repogen::lock::WorkingTreeLocks;
    /// use std::path::Path;
    ///
    /// # async fn example() -> anyhow::Result<()> {
    /// let locks = WorkingTreeLocks::new();
    /// let guard = locks
    ///     .lock(Path::new("/scratch/tree"), "abc123", true, || async {
    ///         // switch the tree to the requested revision
    ///         Ok::<(), anyhow::Error>(())
    ///     })
    ///     .await?;
    ///
    /// // ... read the tree ...
    /// drop(guard);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn lock<F, Fut, E>(
        &self,
        root: &Path,
        revision: &str,
        allow_concurrent: bool,
        checkout: F,
    ) -> Result<TreeLockGuard, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let state = self
            .states
            .entry(root.to_path_buf())
            .or_insert_with(|| {
                Arc::new(TreeState {
                    inner: Mutex::new(TreeInner {
                        revision: None,
                        holders: 0,
                        allow_concurrent: false,
                        checking_out: false,
                        queue: VecDeque::new(),
                        next_ticket: 0,
                    }),
                    notify: Notify::new(),
                })
            })
            .clone();

        let ticket = {
            let mut inner = state.inner.lock().unwrap();
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.queue.push_back(ticket);
            ticket
        };
        let mut queue_guard = QueueGuard { state: state.clone(), ticket, armed: true };

        // The callback runs at most once: the NeedsCheckout arm always
        // returns. Option-wrapping satisfies the borrow checker across loop
        // iterations.
        let mut checkout = Some(checkout);

        loop {
            // The waiter must be registered before the state check, so a
            // release landing in between still wakes us. `notified()` alone
            // registers at first poll; `enable` registers immediately.
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let admission = {
                let mut inner = state.inner.lock().unwrap();
                if inner.queue.front() == Some(&ticket) && !inner.checking_out {
                    if inner.holders > 0 {
                        let same_revision = inner.revision.as_deref() == Some(revision);
                        if same_revision && inner.allow_concurrent && allow_concurrent {
                            inner.queue.pop_front();
                            inner.holders += 1;
                            Some(Admission::Admitted)
                        } else {
                            None
                        }
                    } else if inner.revision.as_deref() == Some(revision) {
                        inner.queue.pop_front();
                        inner.holders = 1;
                        inner.allow_concurrent = allow_concurrent;
                        Some(Admission::Admitted)
                    } else {
                        inner.queue.pop_front();
                        inner.checking_out = true;
                        Some(Admission::NeedsCheckout)
                    }
                } else {
                    None
                }
            };

            match admission {
                Some(Admission::Admitted) => {
                    queue_guard.armed = false;
                    // Wake the next ticket; it may be shareable too.
                    state.notify.notify_waiters();
                    return Ok(TreeLockGuard { state: state.clone(), released: false });
                }
                Some(Admission::NeedsCheckout) => {
                    queue_guard.armed = false;
                    tracing::debug!(
                        target: "repogen::lock",
                        "checking out {} into {}",
                        revision,
                        root.display()
                    );
                    let checkout_fn = checkout.take().expect("checkout callback runs at most once");
                    let mut checkout_reset = CheckoutReset { state: state.clone(), armed: true };
                    let result = checkout_fn().await;
                    checkout_reset.armed = false;
                    let mut inner = state.inner.lock().unwrap();
                    inner.checking_out = false;
                    match result {
                        Ok(()) => {
                            inner.revision = Some(revision.to_string());
                            inner.holders = 1;
                            inner.allow_concurrent = allow_concurrent;
                            drop(inner);
                            state.notify.notify_waiters();
                            return Ok(TreeLockGuard { state: state.clone(), released: false });
                        }
                        Err(err) => {
                            // Previous revision (if any) remains recorded;
                            // waiters get their turn.
                            drop(inner);
                            state.notify.notify_waiters();
                            return Err(err);
                        }
                    }
                }
                None => {
                    notified.await;
                }
            }
        }
    }
}

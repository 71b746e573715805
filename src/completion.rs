//! # Completion Handles
//!
//! Handles for operations that may finish asynchronously: connect, send,
//! close. An operation returns its handle immediately; the transport
//! completes it exactly once, from whichever thread drives the I/O.
//!
//! ## Types
//! - [`AsyncAction`]: tracks completion only (`PENDING → DONE`).
//! - [`AsyncResult`]: adds a permanent success/failure outcome and an error.
//! - [`AsyncResultGroup`]: aggregate over N results, done when every member
//!   is done. Used by fan-out operations such as send-to-all-clients.
//!
//! ## Waiting
//! Handles implement [`Future`], so async callers `.await` them. Blocking
//! callers use [`AsyncAction::wait`] or [`AsyncAction::wait_timeout`]; never
//! call those from inside an async task. Done-handlers registered with
//! [`AsyncAction::add_done_handler`] run at most once, in registration
//! order — synchronously on the registering thread when the handle is
//! already done, otherwise on the completing thread.
//!
//! ## Single-fire guarantee
//! The `PENDING → DONE` transition is guarded by the handle's mutex. When
//! two completion attempts race (a send that both times out and later
//! succeeds), exactly one wins; the loser's `complete*` call returns `false`
//! and has no effect.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::WireError;

type DoneFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    done: bool,
    success: bool,
    error: Option<Arc<WireError>>,
    callbacks: Vec<DoneFn>,
    wakers: Vec<Waker>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn new() -> Self {
        Shared {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking callback must not wedge every other holder of the handle.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Performs the PENDING → DONE transition. Returns false if some other
    /// completion attempt already won.
    fn complete(&self, success: bool, error: Option<WireError>) -> bool {
        let (callbacks, wakers) = {
            let mut state = self.lock();
            if state.done {
                return false;
            }
            state.done = true;
            state.success = success;
            state.error = error.map(Arc::new);
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.wakers),
            )
        };
        self.cond.notify_all();
        for callback in callbacks {
            callback();
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

/// Handle to an operation in flight; tracks completion but not outcome.
#[derive(Clone)]
pub struct AsyncAction {
    shared: Arc<Shared>,
}

impl AsyncAction {
    /// Creates a pending action.
    pub fn pending() -> Self {
        AsyncAction {
            shared: Arc::new(Shared::new()),
        }
    }

    /// Creates an action that is already done.
    pub fn completed() -> Self {
        let action = Self::pending();
        action.complete();
        action
    }

    /// Aggregates many actions into one that completes when the last member
    /// does. An empty input yields an immediately-done action.
    pub fn all(actions: impl IntoIterator<Item = AsyncAction>) -> AsyncAction {
        let members: Vec<AsyncAction> = actions.into_iter().collect();
        let whole = AsyncAction::pending();
        if members.is_empty() {
            whole.complete();
            return whole;
        }
        let remaining = Arc::new(AtomicUsize::new(members.len()));
        for member in members {
            let whole = whole.clone();
            let remaining = Arc::clone(&remaining);
            member.add_done_handler(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    whole.complete();
                }
            });
        }
        whole
    }

    /// Non-blocking completion check, consistent with the latest completion
    /// signal.
    pub fn is_done(&self) -> bool {
        self.shared.lock().done
    }

    /// Marks the action done. Returns false if it was already done.
    pub fn complete(&self) -> bool {
        self.shared.complete(true, None)
    }

    /// Blocks the calling thread until the action is done.
    pub fn wait(&self) {
        let mut state = self.shared.lock();
        while !state.done {
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the action is done or the timeout elapses. Returns true
    /// if the action completed within the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .cond
            .wait_timeout_while(state, timeout, |s| !s.done)
            .unwrap_or_else(PoisonError::into_inner);
        state.done
    }

    /// Registers a zero-argument callback. Runs immediately on the calling
    /// thread when the action is already done, otherwise exactly once on the
    /// completing thread.
    pub fn add_done_handler(&self, callback: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.shared.lock();
            if state.done {
                true
            } else {
                state.callbacks.push(Box::new(callback));
                return;
            }
        };
        if run_now {
            callback();
        }
    }

    fn poll_done(&self, cx: &mut Context<'_>) -> bool {
        let mut state = self.shared.lock();
        if state.done {
            return true;
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        false
    }
}

impl Future for AsyncAction {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.poll_done(cx) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl std::fmt::Debug for AsyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncAction")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Handle to an operation in flight that carries a success/failure outcome.
#[derive(Clone)]
pub struct AsyncResult {
    action: AsyncAction,
}

impl AsyncResult {
    /// Creates a pending result.
    pub fn pending() -> Self {
        AsyncResult {
            action: AsyncAction::pending(),
        }
    }

    /// Creates a result that is already done and successful.
    pub fn succeeded() -> Self {
        let result = Self::pending();
        result.complete_success();
        result
    }

    /// Creates a "quick failed" result: already done, carrying `error`.
    /// Used for operations rejected before any transport is touched, such as
    /// sending on a closed connection.
    pub fn failed(error: WireError) -> Self {
        let result = Self::pending();
        result.complete_failure(error);
        result
    }

    /// Non-blocking completion check.
    pub fn is_done(&self) -> bool {
        self.action.is_done()
    }

    /// True once the result is done and the operation succeeded.
    pub fn is_success(&self) -> bool {
        let state = self.action.shared.lock();
        state.done && state.success
    }

    /// The failure cause, once done and failed.
    pub fn error(&self) -> Option<Arc<WireError>> {
        self.action.shared.lock().error.clone()
    }

    /// Marks the result successful. Returns false if already done.
    pub fn complete_success(&self) -> bool {
        self.action.shared.complete(true, None)
    }

    /// Marks the result failed with `error`. Returns false if already done.
    pub fn complete_failure(&self, error: WireError) -> bool {
        self.action.shared.complete(false, Some(error))
    }

    /// Blocks the calling thread until the result is done.
    pub fn wait(&self) {
        self.action.wait();
    }

    /// Blocks until done or timeout; true if the result completed in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.action.wait_timeout(timeout)
    }

    /// Registers a done callback; see [`AsyncAction::add_done_handler`].
    pub fn add_done_handler(&self, callback: impl FnOnce() + Send + 'static) {
        self.action.add_done_handler(callback);
    }

    /// Completion-only view of this result.
    pub fn as_action(&self) -> &AsyncAction {
        &self.action
    }
}

impl Future for AsyncResult {
    type Output = std::result::Result<(), Arc<WireError>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.action.poll_done(cx) {
            return Poll::Pending;
        }
        let state = self.action.shared.lock();
        if state.success {
            Poll::Ready(Ok(()))
        } else {
            let error = state
                .error
                .clone()
                .unwrap_or_else(|| Arc::new(WireError::ConnectionClosed));
            Poll::Ready(Err(error))
        }
    }
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("done", &self.is_done())
            .field("success", &self.is_success())
            .finish()
    }
}

/// Aggregate over a set of [`AsyncResult`]s. Done exactly when every member
/// is done; per-category counts are computed by a full scan, which is fine
/// at the fan-out sizes this framework produces.
pub struct AsyncResultGroup {
    members: Vec<AsyncResult>,
    whole: AsyncAction,
}

impl AsyncResultGroup {
    /// Builds a group over `members`. A group over already-done results
    /// (or no results at all) is immediately done.
    pub fn new(members: Vec<AsyncResult>) -> Self {
        let whole = AsyncAction::all(members.iter().map(|m| m.as_action().clone()));
        AsyncResultGroup { members, whole }
    }

    /// True iff every member result is done.
    pub fn is_done(&self) -> bool {
        self.whole.is_done()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when the group has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members that are done and succeeded.
    pub fn success_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_success()).count()
    }

    /// Members that are done and failed.
    pub fn failure_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.is_done() && !m.is_success())
            .count()
    }

    /// Members that are done, regardless of outcome.
    pub fn done_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_done()).count()
    }

    /// The member results, in the order they were supplied.
    pub fn results(&self) -> &[AsyncResult] {
        &self.members
    }

    /// Blocks until every member is done.
    pub fn wait(&self) {
        self.whole.wait();
    }

    /// Blocks until done or timeout; true if the group completed in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.whole.wait_timeout(timeout)
    }

    /// Registers a callback that fires once the last member completes.
    pub fn add_done_handler(&self, callback: impl FnOnce() + Send + 'static) {
        self.whole.add_done_handler(callback);
    }
}

impl Future for AsyncResultGroup {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.whole).poll(cx)
    }
}

impl std::fmt::Debug for AsyncResultGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResultGroup")
            .field("members", &self.members.len())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn quick_failed_result_is_done_and_unsuccessful() {
        let result = AsyncResult::failed(WireError::ConnectionClosed);
        assert!(result.is_done());
        assert!(!result.is_success());
        assert!(matches!(
            result.error().as_deref(),
            Some(WireError::ConnectionClosed)
        ));
    }

    #[test]
    fn completion_fires_exactly_once() {
        let result = AsyncResult::pending();
        assert!(result.complete_success());
        assert!(!result.complete_failure(WireError::Timeout));
        assert!(result.is_success());
        assert!(result.error().is_none());
    }

    #[test]
    fn handler_on_done_result_runs_synchronously() {
        let result = AsyncResult::succeeded();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        result.add_done_handler(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let action = AsyncAction::pending();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4 {
            let order = Arc::clone(&order);
            action.add_done_handler(move || order.lock().unwrap().push(tag));
        }
        action.complete();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn wait_unblocks_on_completion_from_another_thread() {
        let action = AsyncAction::pending();
        let remote = action.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.complete();
        });
        action.wait();
        assert!(action.is_done());
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let action = AsyncAction::pending();
        assert!(!action.wait_timeout(Duration::from_millis(10)));
        action.complete();
        assert!(action.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn group_over_done_results_is_immediately_done() {
        let group = AsyncResultGroup::new(vec![
            AsyncResult::succeeded(),
            AsyncResult::failed(WireError::Timeout),
        ]);
        assert!(group.is_done());
        assert_eq!(group.success_count(), 1);
        assert_eq!(group.failure_count(), 1);
        assert_eq!(group.done_count(), 2);
    }

    #[test]
    fn empty_group_is_done() {
        let group = AsyncResultGroup::new(Vec::new());
        assert!(group.is_done());
        assert_eq!(group.done_count(), 0);
    }

    #[test]
    fn group_completes_with_last_member() {
        let pending = AsyncResult::pending();
        let group = AsyncResultGroup::new(vec![AsyncResult::succeeded(), pending.clone()]);
        assert!(!group.is_done());
        assert_eq!(group.done_count(), 1);

        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        group.add_done_handler(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        pending.complete_success();
        assert!(group.is_done());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(group.success_count(), 2);
    }

    #[tokio::test]
    async fn results_are_awaitable() {
        let result = AsyncResult::pending();
        let remote = result.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.complete_failure(WireError::Timeout);
        });
        let outcome = result.clone().await;
        let error = outcome.expect_err("completion failed the result");
        assert!(matches!(*error, WireError::Timeout));
    }
}

//! Ambient scope stacks.
//!
//! Every thread holds one stack per logger. Log calls read the top entry by
//! value on the calling thread, so work handed to another thread carries
//! the scope that was current when the call was made.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ErrorSink, PipelineError};
use crate::value::LogValue;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

struct Entry {
    token: u64,
    state: LogValue,
}

thread_local! {
    static STACKS: RefCell<HashMap<u64, Vec<Entry>>> = RefCell::new(HashMap::new());
}

fn push(logger: u64, state: LogValue) -> u64 {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    STACKS.with(|stacks| {
        stacks
            .borrow_mut()
            .entry(logger)
            .or_default()
            .push(Entry { token, state });
    });
    token
}

/// Remove the entry `token`. Returns `false` when it was not on top.
fn pop(logger: u64, token: u64) -> bool {
    STACKS
        .try_with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let Some(stack) = stacks.get_mut(&logger) else {
                return false;
            };
            let Some(position) = stack.iter().rposition(|entry| entry.token == token) else {
                return false;
            };
            let on_top = position + 1 == stack.len();
            stack.remove(position);
            if stack.is_empty() {
                stacks.remove(&logger);
            }
            on_top
        })
        // Thread teardown: the stack is going away anyway.
        .unwrap_or(true)
}

/// Top of `logger`'s stack on this thread.
pub(crate) fn current(logger: u64) -> Option<LogValue> {
    STACKS
        .try_with(|stacks| {
            stacks
                .borrow()
                .get(&logger)
                .and_then(|stack| stack.last())
                .map(|entry| entry.state.clone())
        })
        .ok()
        .flatten()
}

/// Depth of `logger`'s stack on this thread.
pub(crate) fn depth(logger: u64) -> usize {
    STACKS
        .try_with(|stacks| stacks.borrow().get(&logger).map_or(0, Vec::len))
        .unwrap_or(0)
}

/// Handle returned by [`Logger::begin_scope`](crate::logger::Logger::begin_scope).
///
/// Dropping it pops exactly the entry it pushed. Guards must be dropped in
/// reverse order of creation; dropping one out of order still removes its
/// entry and reports a [`PipelineError::ScopeMisuse`].
///
/// The guard is tied to the thread that created it and is not `Send`.
#[must_use = "the scope ends when the guard is dropped"]
pub struct ScopeGuard {
    logger: u64,
    token: u64,
    category: Arc<str>,
    errors: Arc<ErrorSink>,
    _thread_bound: PhantomData<*const ()>,
}

impl ScopeGuard {
    pub(crate) fn enter(logger: u64, category: Arc<str>, errors: Arc<ErrorSink>, state: LogValue) -> Self {
        let token = push(logger, state);
        Self {
            logger,
            token,
            category,
            errors,
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !pop(self.logger, self.token) {
            self.errors
                .handle(PipelineError::ScopeMisuse(self.category.to_string()));
        }
    }
}

impl std::fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeGuard")
            .field("category", &self.category)
            .field("token", &self.token)
            .finish()
    }
}

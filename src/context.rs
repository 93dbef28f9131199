//! The owning collaborator (spec section 4.6): a source table, a
//! priority-ordered dispatch order, the poll-record set, and the
//! prepare/query/poll/check/dispatch pipeline that drives one iteration.
//!
//! Mirrors the teacher's `Poll`/`Registration` split: `Context` is the
//! orchestrator (the role `Poll` plays in `poll.rs`), `Source` is the
//! dumb registered handle (the role `Evented` plays there). Ownership is
//! rendered as `Arc::clone`/`Drop` rather than manual ref/unref.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use indexmap::IndexMap;
use once_cell::sync::Lazy;

use crate::clock::{micros_to_poll_millis, monotonic_micros};
use crate::poll_set::{PollRecord, PollRecordSet};
use crate::ready::Ready;
use crate::source::{flags as source_flags, Callback, DispatchAction, Source, SourceId, SourceImpl, WatchKey};
use crate::sys::poll::{poll as default_poll, PollEntry};
use crate::wakeup::Wakeup;

type PollFn = dyn Fn(&mut [PollEntry], i32) -> io::Result<i32> + Send + Sync;

mod context_flags {
    /// Let `iteration`/`run` proceed without an acquired owner thread.
    /// Off by default: the common case is one thread per context (spec
    /// section 5).
    pub const OWNERLESS_POLLING: u32 = 1 << 0;
}

struct ContextState {
    sources: IndexMap<SourceId, Arc<Source>>,
    priorities: BTreeMap<i32, Vec<SourceId>>,
    poll_set: PollRecordSet,
    next_id: u32,
    poll_scratch: Vec<PollEntry>,
}

impl ContextState {
    fn new() -> ContextState {
        ContextState {
            sources: IndexMap::new(),
            priorities: BTreeMap::new(),
            poll_set: PollRecordSet::new(),
            next_id: 0,
            poll_scratch: Vec::new(),
        }
    }

    fn allocate_id(&mut self) -> SourceId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            let candidate = SourceId::from_raw(self.next_id);
            if !self.sources.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// The result of `Context::prepare`, threaded into `query`/`check` (spec
/// section 4.5): what was already found ready, the smallest candidate
/// timeout, and the effective max priority to cap polling/checking at.
/// GLib keeps this as mutable state directly on its `GMainContext`
/// instead of handing it back and forth between calls; this struct plays
/// the same role, parked in `ContextInner::pending_prepare` between a
/// `prepare` call and the matching `query`/`check`.
struct PendingPrepare {
    ready: Vec<SourceId>,
    next_timeout: Option<i64>,
    max_priority: i32,
}

pub(crate) struct ContextInner {
    state: Mutex<ContextState>,
    wakeup: Wakeup,
    owner: Mutex<Option<ThreadId>>,
    /// Signaled whenever `owner` transitions to `None`, so a thread
    /// blocked in `Context::acquire_blocking` wakes and re-checks (spec
    /// section 3's "condition variable" / section 4.5 step 1's "blocks on
    /// the condition variable ... until the context is handed off").
    owner_cv: Condvar,
    owner_depth: AtomicU32,
    flags: AtomicU32,
    running: AtomicBool,
    poll_fn: Mutex<Arc<PollFn>>,
    /// Raised for the duration of the prepare loop and the check loop
    /// (spec section 3's "reentrancy guard counter for prepare/check").
    /// `prepare`/`check` consult it to reject a recursive call made
    /// from within a source's own `prepare`/`check` (spec section 4.5 and
    /// section 7's misuse taxonomy) rather than deadlocking or corrupting
    /// the ready list. Recursion through `dispatch` is unaffected — it is
    /// explicitly permitted (section 4.4's `can_recurse`).
    in_prepare_or_check: AtomicBool,
    pending_prepare: Mutex<Option<PendingPrepare>>,
    /// The pending-dispatch queue (spec section 3): sources `prepare`/
    /// `check` found ready, in the order `dispatch` should run them.
    ready_for_dispatch: Mutex<Vec<SourceId>>,
}

impl ContextInner {
    fn new() -> io::Result<Arc<ContextInner>> {
        Ok(Arc::new(ContextInner {
            state: Mutex::new(ContextState::new()),
            wakeup: Wakeup::new()?,
            owner: Mutex::new(None),
            owner_cv: Condvar::new(),
            owner_depth: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            running: AtomicBool::new(false),
            poll_fn: Mutex::new(Arc::new(default_poll)),
            in_prepare_or_check: AtomicBool::new(false),
            pending_prepare: Mutex::new(None),
            ready_for_dispatch: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn wakeup(&self) -> io::Result<()> {
        self.wakeup.signal()
    }

    pub(crate) fn attach_source(self: &Arc<Self>, source: &Arc<Source>) -> SourceId {
        if source.is_attached() {
            log::warn!(target: "eventcore", "source already attached to a context, ignoring re-attach");
            return source.id();
        }

        let mut state = self.state.lock().unwrap();
        let id = state.allocate_id();
        source.set_id(id);
        *source.context.lock().unwrap() = Some(Arc::downgrade(self));

        state.priorities.entry(source.priority()).or_default().push(id);

        let mut to_register = Vec::new();
        source.each_watch(|key, watch| {
            if watch.registered {
                to_register.push((key, watch.fd, watch.requested));
            }
        });
        for (key, fd, requested) in to_register {
            state
                .poll_set
                .add(PollRecord { source_id: id, watch_key: key, fd, requested, priority: source.priority() });
        }

        state.sources.insert(id, source.clone());
        drop(state);
        let _ = self.wakeup();
        id
    }

    pub(crate) fn attach_child(self: &Arc<Self>, _parent: &Arc<Source>, child: &Arc<Source>) {
        self.attach_source(child);
    }

    pub(crate) fn detach_source(self: &Arc<Self>, source: &Arc<Source>) {
        let id = source.id();
        if id.is_detached() {
            return;
        }

        let mut state = self.state.lock().unwrap();
        state.sources.shift_remove(&id);
        if let Some(v) = state.priorities.get_mut(&source.priority()) {
            v.retain(|&x| x != id);
        }

        let mut keys = Vec::new();
        source.each_watch(|key, watch| {
            if watch.registered {
                keys.push(key);
            }
        });
        for key in keys {
            state.poll_set.remove(id, key);
        }
        drop(state);

        source.set_id(SourceId::DETACHED);
        *source.context.lock().unwrap() = None;
    }

    pub(crate) fn reprioritize_source(self: &Arc<Self>, source: &Arc<Source>, new_priority: i32) {
        let id = source.id();
        if id.is_detached() {
            source.set_priority_raw(new_priority);
            return;
        }

        let mut state = self.state.lock().unwrap();
        let old_priority = source.priority();
        if old_priority == new_priority {
            return;
        }
        if let Some(v) = state.priorities.get_mut(&old_priority) {
            v.retain(|&x| x != id);
        }
        source.set_priority_raw(new_priority);
        state.priorities.entry(new_priority).or_default().push(id);

        let mut updates = Vec::new();
        source.each_watch(|key, watch| {
            if watch.registered {
                updates.push((key, watch.fd, watch.requested));
            }
        });
        for (key, fd, requested) in updates {
            state.poll_set.remove(id, key);
            state
                .poll_set
                .add(PollRecord { source_id: id, watch_key: key, fd, requested, priority: new_priority });
        }
    }

    pub(crate) fn register_watch(
        self: &Arc<Self>,
        source_id: SourceId,
        key: WatchKey,
        fd: RawFd,
        requested: Ready,
        priority: i32,
    ) {
        let mut state = self.state.lock().unwrap();
        state.poll_set.add(PollRecord { source_id, watch_key: key, fd, requested, priority });
        drop(state);
        let _ = self.wakeup();
    }

    pub(crate) fn unregister_watch(self: &Arc<Self>, source_id: SourceId, key: WatchKey) {
        self.state.lock().unwrap().poll_set.remove(source_id, key);
    }

    fn ownerless_polling(&self) -> bool {
        self.flags.load(Ordering::Acquire) & context_flags::OWNERLESS_POLLING != 0
    }
}

/// A reusable event-loop core. Cheap to clone — clones share the same
/// underlying state via `Arc`, the idiomatic substitute for manual
/// ref/unref (spec section 4.6).
#[derive(Clone)]
pub struct Context(pub(crate) Arc<ContextInner>);

thread_local! {
    static THREAD_DEFAULT_STACK: RefCell<Vec<Context>> = RefCell::new(Vec::new());
}

static GLOBAL_DEFAULT: Lazy<Context> =
    Lazy::new(|| Context::new().expect("failed to create the global default context"));

/// RAII ownership handle returned by [`Context::try_acquire`]; releases on
/// drop so `?`-heavy callers can't forget to call [`Context::release`].
pub struct OwnershipGuard<'a> {
    context: &'a Context,
}

impl Drop for OwnershipGuard<'_> {
    fn drop(&mut self) {
        self.context.release();
    }
}

impl Context {
    pub fn new() -> io::Result<Context> {
        Ok(Context(ContextInner::new()?))
    }

    /// The process-wide default context (spec section 4.6), created
    /// lazily on first use.
    pub fn default() -> Context {
        GLOBAL_DEFAULT.clone()
    }

    /// The context on top of the calling thread's thread-default stack,
    /// if any was pushed.
    pub fn thread_default() -> Option<Context> {
        THREAD_DEFAULT_STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// The effective context for the calling thread: its thread-default
    /// if one was pushed, else the global default.
    pub fn get_thread_default_or_default() -> Context {
        Context::thread_default().unwrap_or_else(Context::default)
    }

    pub fn push_thread_default(&self) {
        THREAD_DEFAULT_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
    }

    pub fn pop_thread_default(&self) {
        THREAD_DEFAULT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last() {
                Some(top) if Arc::ptr_eq(&top.0, &self.0) => {
                    stack.pop();
                }
                _ => log::warn!(
                    target: "eventcore",
                    "pop_thread_default called on a context that is not on top of this thread's stack"
                ),
            }
        });
    }

    pub fn set_ownerless_polling(&self, enabled: bool) {
        if enabled {
            self.0.flags.fetch_or(context_flags::OWNERLESS_POLLING, Ordering::AcqRel);
        } else {
            self.0.flags.fetch_and(!context_flags::OWNERLESS_POLLING, Ordering::AcqRel);
        }
    }

    // ---- ownership ----

    pub fn acquire(&self) -> bool {
        let this_thread = thread::current().id();
        let mut owner = self.0.owner.lock().unwrap();
        match *owner {
            Some(id) if id == this_thread => {
                self.0.owner_depth.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(_) => false,
            None => {
                *owner = Some(this_thread);
                self.0.owner_depth.store(1, Ordering::SeqCst);
                true
            }
        }
    }

    /// Blocking counterpart to `acquire` (spec section 4.5 pipeline step
    /// 1): waits on the ownership condition variable instead of failing
    /// immediately when another thread already owns the context. Used by
    /// `Loop::run` and by `Context::iteration` when called with
    /// `may_block = true`.
    pub fn acquire_blocking(&self) -> OwnershipGuard<'_> {
        let this_thread = thread::current().id();
        let mut owner = self.0.owner.lock().unwrap();
        loop {
            match *owner {
                Some(id) if id == this_thread => {
                    self.0.owner_depth.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                None => {
                    *owner = Some(this_thread);
                    self.0.owner_depth.store(1, Ordering::SeqCst);
                    break;
                }
                Some(_) => {
                    owner = self.0.owner_cv.wait(owner).unwrap();
                }
            }
        }
        drop(owner);
        OwnershipGuard { context: self }
    }

    pub fn release(&self) {
        let this_thread = thread::current().id();
        let mut owner = self.0.owner.lock().unwrap();
        if *owner != Some(this_thread) {
            log::warn!(target: "eventcore", "release called by a thread that does not own this context");
            return;
        }
        let remaining = self.0.owner_depth.fetch_sub(1, Ordering::SeqCst);
        if remaining <= 1 {
            *owner = None;
            // Spec section 4.5 step 7: "signal the next waiter" once
            // ownership actually reaches zero.
            self.0.owner_cv.notify_one();
        }
    }

    pub fn is_owner(&self) -> bool {
        *self.0.owner.lock().unwrap() == Some(thread::current().id())
    }

    pub fn try_acquire(&self) -> Option<OwnershipGuard<'_>> {
        if self.acquire() {
            Some(OwnershipGuard { context: self })
        } else {
            None
        }
    }

    /// Wakes every thread blocked in `acquire_blocking`, so a `run` or a
    /// blocking `iteration` waiting for this context's ownership re-checks
    /// promptly rather than only on the owner's own next `release` (spec
    /// section 4.6: "`quit` broadcasts the condition variable so a `run`
    /// waiting for ownership can return").
    pub(crate) fn broadcast_ownership_waiters(&self) {
        self.0.owner_cv.notify_all();
    }

    // ---- source table ----

    pub(crate) fn attach_source(&self, source: &Arc<Source>) -> SourceId {
        self.0.attach_source(source)
    }

    pub fn find_source(&self, id: SourceId) -> Option<Arc<Source>> {
        self.0.state.lock().unwrap().sources.get(&id).cloned()
    }

    /// Scan variant keyed on the per-instance tag (spec section 4.5's
    /// "by callback data" scan) — `name()` is the only per-source instance
    /// tag this crate carries, since a boxed `Callback` has no separate
    /// user-data pointer the way a C vtable + void* pair would.
    pub fn find_source_by_name(&self, name: &str) -> Option<Arc<Source>> {
        self.0
            .state
            .lock()
            .unwrap()
            .sources
            .values()
            .find(|s| s.name().as_deref() == Some(name))
            .cloned()
    }

    /// Scan variant keyed on the source's vtable identity (spec section
    /// 4.5's "by vtable + data" scan) — `kind_name()` stands in for "which
    /// `SourceFuncs`/vtable built this source" since `Box<dyn SourceImpl>`
    /// has no comparable address the way a static vtable struct would.
    pub fn find_source_by_kind(&self, kind_name: &str) -> Option<Arc<Source>> {
        self.0
            .state
            .lock()
            .unwrap()
            .sources
            .values()
            .find(|s| s.kind_name() == kind_name)
            .cloned()
    }

    pub fn for_each_source(&self, mut f: impl FnMut(&Arc<Source>)) {
        for source in self.0.state.lock().unwrap().sources.values() {
            f(source);
        }
    }

    pub fn set_poll_function(
        &self,
        f: impl Fn(&mut [PollEntry], i32) -> io::Result<i32> + Send + Sync + 'static,
    ) {
        *self.0.poll_fn.lock().unwrap() = Arc::new(f);
    }

    /// Spec section 4.5: run `function` under context ownership. Direct
    /// call when the current thread already owns the context; otherwise
    /// synchronously acquire if the context is the thread-default, else
    /// schedule an idle source at `PRIORITY_DEFAULT`.
    pub fn invoke(&self, f: impl FnOnce() + Send + 'static) {
        self.invoke_full(crate::source::PRIORITY_DEFAULT, f);
    }

    /// As [`Context::invoke`], scheduling the fallback idle source at
    /// `priority` instead of `PRIORITY_DEFAULT` (spec section 4.5).
    pub fn invoke_full(&self, priority: i32, f: impl FnOnce() + Send + 'static) {
        if self.is_owner() {
            f();
            return;
        }

        let is_thread_default = Context::thread_default().map_or(false, |td| Arc::ptr_eq(&td.0, &self.0));
        if is_thread_default {
            let _guard = self.acquire_blocking();
            f();
            return;
        }

        let source = Source::new(InvokeOnce { f: Mutex::new(Some(Box::new(f))) });
        source.set_priority(priority);
        source.attach(self);
    }

    pub fn wakeup(&self) -> io::Result<()> {
        self.0.wakeup()
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.0.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    /// Returns `true` if something is ready to dispatch without blocking
    /// (spec section 4.6); never dispatches.
    pub fn pending(&self) -> bool {
        if self.rejects_recursive_entry() {
            return false;
        }
        if self.prepare() {
            return true;
        }
        let (entries, _timeout_ms) = self.query(false);
        self.run_poll_and_check(entries, 0)
    }

    /// Run one prepare/query/poll/check/dispatch pass. Returns whether
    /// anything was dispatched.
    ///
    /// Without ownership (and without [`Context::set_ownerless_polling`])
    /// this blocks to acquire ownership when `may_block` is set (spec
    /// section 4.5 step 1), or returns `false` immediately otherwise,
    /// mirroring the "iteration requires acquiring" rule in section 5.
    pub fn iteration(&self, may_block: bool) -> bool {
        if self.rejects_recursive_entry() {
            return false;
        }

        let _guard = if self.0.ownerless_polling() {
            None
        } else if may_block {
            Some(self.acquire_blocking())
        } else {
            match self.try_acquire() {
                Some(guard) => Some(guard),
                None => return false,
            }
        };

        if !self.prepare() {
            let (entries, timeout_ms) = self.query(may_block);
            self.run_poll_and_check(entries, timeout_ms);
        }
        self.dispatch()
    }

    /// Spec section 4.5: "Recursion into any of them from inside a
    /// source's `prepare` or `check` is rejected with a diagnostic and a
    /// safe `false` return." Dispatch is deliberately exempt — recursive
    /// dispatch and nested loops driven from a callback are the documented
    /// reentrancy this engine supports (section 4.4's `can_recurse`).
    fn rejects_recursive_entry(&self) -> bool {
        if self.0.in_prepare_or_check.load(Ordering::Acquire) {
            log::warn!(
                target: "eventcore",
                "recursive call into the prepare/check pipeline from within a source's prepare or check; rejecting"
            );
            true
        } else {
            false
        }
    }

    /// Manual pipeline step 1 (spec section 4.5): call every active
    /// source's `prepare`, collecting anything ready and the shortest
    /// requested timeout. Returns whether anything is already ready,
    /// so a caller driving the pipeline by hand can skip straight to
    /// `dispatch` without polling.
    pub fn prepare(&self) -> bool {
        let now = monotonic_micros();

        let mut ready: Vec<SourceId> = Vec::new();
        let mut next_timeout: Option<i64> = None;
        let mut ready_priority: Option<i32> = None;

        // Snapshot the priority-ordered source lists, then drop the lock
        // before calling into any source's `prepare` — spec section 5:
        // "the mutex is released around vtable calls ... to preserve
        // liveness and permit re-entry" (e.g. a source attaching another
        // source from within its own `prepare`).
        let groups: Vec<(i32, Vec<Arc<Source>>)> = {
            let state = self.0.state.lock().unwrap();
            state
                .priorities
                .iter()
                .map(|(&p, ids)| (p, ids.iter().filter_map(|id| state.sources.get(id).cloned()).collect()))
                .collect()
        };

        self.0.in_prepare_or_check.store(true, Ordering::Release);
        for (priority, sources) in groups {
            for source in sources {
                if !source.is_active() || source.is_blocked() || source.is_ready() {
                    continue;
                }

                let (imp_ready, imp_timeout) = source.imp.prepare(&source, now);
                let ready_time = source.ready_time();
                let time_ready = ready_time >= 0 && ready_time <= now;

                if ready_time >= 0 && !time_ready {
                    let hint = ready_time - now;
                    next_timeout = Some(next_timeout.map_or(hint, |cur| cur.min(hint)));
                }
                if let Some(hint) = imp_timeout {
                    next_timeout = Some(next_timeout.map_or(hint, |cur| cur.min(hint)));
                }

                if imp_ready || time_ready {
                    // `mark_ready` also returns any ancestor sources whose
                    // own READY flag flips as a result (spec section 4.4):
                    // fold them into this pipeline pass's ready list so
                    // `dispatch` clears their flag too, instead of wedging
                    // them permanently ready.
                    for id in source.mark_ready() {
                        if !ready.contains(&id) {
                            ready.push(id);
                        }
                    }
                    ready_priority = Some(ready_priority.map_or(priority, |p: i32| p.min(priority)));
                }
            }

            if ready_priority.is_some() {
                break;
            }
        }
        self.0.in_prepare_or_check.store(false, Ordering::Release);

        let max_priority = ready_priority.unwrap_or(i32::MAX);
        let some_ready = !ready.is_empty();

        *self.0.pending_prepare.lock().unwrap() =
            Some(PendingPrepare { ready: ready.clone(), next_timeout, max_priority });
        *self.0.ready_for_dispatch.lock().unwrap() = ready;

        some_ready
    }

    /// Manual pipeline step 2 (spec section 4.5): build the poll array a
    /// caller should pass to `poll(2)` (or an equivalent), including the
    /// context's own wakeup descriptor as a trailing entry, and the
    /// timeout in milliseconds to poll with. Must follow a `prepare` call;
    /// its result is consumed by the matching `check`.
    pub fn query(&self, may_block: bool) -> (Vec<PollEntry>, i32) {
        let (max_priority, next_timeout, has_ready) = {
            let pending = self.0.pending_prepare.lock().unwrap();
            match pending.as_ref() {
                Some(p) => (p.max_priority, p.next_timeout, !p.ready.is_empty()),
                None => (i32::MAX, None, false),
            }
        };

        let timeout_ms = if has_ready || !may_block { 0 } else { micros_to_poll_millis(next_timeout.unwrap_or(-1)) };

        let mut state = self.0.state.lock().unwrap();
        let mut entries = std::mem::take(&mut state.poll_scratch);
        state.poll_set.flatten(max_priority, &mut entries);
        drop(state);

        // The wakeup descriptor is never one of a source's own watches — it
        // belongs to the context, not the poll-record set (spec section
        // 4.6's "the wakeup is owned by the context, not exposed") — so it
        // rides along as a trailing entry that `check` pops back off.
        let wakeup_fd = self.0.wakeup.as_raw_fd();
        entries.push(PollEntry::new(wakeup_fd, Ready::readable()));

        (entries, timeout_ms)
    }

    /// Manual pipeline step 3 (spec section 4.5): scatter poll results
    /// onto each source's watches and run `check` on anything not already
    /// ready. `entries` must be the (now-polled) array `query` returned.
    /// Returns whether anything is ready to dispatch.
    pub fn check(&self, mut entries: Vec<PollEntry>) -> bool {
        if self.rejects_recursive_entry() {
            return false;
        }

        let Some(pending) = self.0.pending_prepare.lock().unwrap().take() else {
            log::warn!(target: "eventcore", "check called without a matching prepare; ignoring");
            return false;
        };
        let PendingPrepare { mut ready, max_priority, .. } = pending;

        if let Some(wakeup_entry) = entries.pop() {
            if wakeup_entry.received.is_readable() {
                let _ = self.0.wakeup.acknowledge();
            }
        }

        let mut state = self.0.state.lock().unwrap();

        if state.poll_set.is_dirty() {
            // A source was added or removed from another thread while we
            // were blocked in poll, so the record ordering `entries` was
            // built against no longer matches the live set. Abort rather
            // than scatter against a stale layout; the caller's next
            // iteration rebuilds from scratch (spec section 4.5 step 5).
            state.poll_set.clear_dirty();
            state.poll_scratch = entries;
            let some_ready = !ready.is_empty();
            *self.0.ready_for_dispatch.lock().unwrap() = ready;
            return some_ready;
        }

        let mut deliveries: Vec<(SourceId, WatchKey, Ready)> = Vec::new();
        state.poll_set.scatter(max_priority, &entries, |source_id, watch_key, received| {
            deliveries.push((source_id, watch_key, received));
        });
        for (source_id, watch_key, received) in deliveries {
            if let Some(source) = state.sources.get(&source_id) {
                source.set_watch_received(watch_key, received);
            }
        }
        state.poll_scratch = entries;

        // Snapshot again for the check phase, then release the lock before
        // calling into any source's `check` — same rationale as the
        // prepare loop above (spec section 5).
        let check_groups: Vec<(i32, Vec<Arc<Source>>)> = state
            .priorities
            .iter()
            .filter(|&(&p, _)| p <= max_priority)
            .map(|(&p, ids)| (p, ids.iter().filter_map(|id| state.sources.get(id).cloned()).collect()))
            .collect();
        drop(state);

        // check phase: anything with watch bits set, or the vtable's own
        // check, becomes ready too (spec section 4.5 step 5). Mirrors the
        // prepare loop above: walk priority groups ascending, and stop as
        // soon as a group yields a ready source, so a low-priority-number
        // source never shares an iteration's dispatch pass with a
        // higher-priority-number one discovered only here in check.
        self.0.in_prepare_or_check.store(true, Ordering::Release);
        for (_priority, sources) in check_groups {
            let mut found_ready_here = false;
            for source in sources {
                if ready.contains(&source.id()) {
                    continue;
                }
                if !source.is_active() || source.is_blocked() {
                    continue;
                }
                if source.any_watch_received() || source.imp.check(&source) {
                    for id in source.mark_ready() {
                        if !ready.contains(&id) {
                            ready.push(id);
                        }
                    }
                    found_ready_here = true;
                }
            }
            if found_ready_here {
                break;
            }
        }
        self.0.in_prepare_or_check.store(false, Ordering::Release);

        let some_ready = !ready.is_empty();
        *self.0.ready_for_dispatch.lock().unwrap() = ready;
        some_ready
    }

    fn run_poll_and_check(&self, mut entries: Vec<PollEntry>, timeout_ms: i32) -> bool {
        let poll_fn = self.0.poll_fn.lock().unwrap().clone();
        let _ = poll_fn(&mut entries, timeout_ms);
        self.check(entries)
    }

    /// Manual pipeline step 4 (spec section 4.5): run every source that
    /// `prepare`/`check` found ready. Returns whether anything was
    /// dispatched.
    pub fn dispatch(&self) -> bool {
        let ready = std::mem::take(&mut *self.0.ready_for_dispatch.lock().unwrap());
        let dispatched = !ready.is_empty();

        for id in ready {
            let Some(source) = self.find_source(id) else { continue };
            if !source.is_active() {
                continue;
            }

            source.clear_flag(source_flags::READY);

            let can_recurse = source.can_recurse();
            if !can_recurse {
                // Deregisters the source's (and its children's) descriptor
                // watches for the duration of dispatch, re-adding them on
                // unblock (spec section 4.4).
                source.block();
            }
            source.set_flag(source_flags::IN_CALL);

            let mut callback = source.take_callback_for_dispatch();
            let action = source.imp.dispatch(&source, &mut callback);
            if let Some(callback) = callback {
                source.restore_callback_after_dispatch(callback);
            }

            source.clear_flag(source_flags::IN_CALL);
            if !can_recurse {
                source.unblock();
            }

            if action == DispatchAction::Remove {
                source.destroy();
            }
        }

        dispatched
    }
}

/// Backs `Context::invoke`/`invoke_full` when neither the owner nor
/// thread-default fast paths apply: a one-shot idle-priority source whose
/// only job is to run the closure once, then remove itself.
struct InvokeOnce {
    f: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SourceImpl for InvokeOnce {
    fn prepare(&self, _source: &Source, _now: crate::clock::Micros) -> (bool, Option<i64>) {
        (true, None)
    }

    fn check(&self, _source: &Source) -> bool {
        false
    }

    fn dispatch(&self, _source: &Source, _callback: &mut Option<Callback>) -> DispatchAction {
        if let Some(f) = self.f.lock().unwrap().take() {
            f();
        }
        DispatchAction::Remove
    }

    fn kind_name(&self) -> &'static str {
        "invoke-once"
    }
}

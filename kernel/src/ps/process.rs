//! Process Object
//!
//! A process owns an address space, a handle table, its threads and its
//! children. Its lifecycle only ever moves forward:
//!
//! ```text
//! Running -> Dying -> Dead
//! ```
//!
//! `Running -> Dying` happens exactly once, when some caller wins the
//! right to drive termination. `Dying -> Dead` happens under the watcher
//! lock, so a watcher added concurrently is either signalled by the
//! transition or sees Dead and signals itself.
//!
//! Threads hold a weak reference to their process and a child holds a
//! weak reference to its parent; the strong edges run downwards.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use x86_64::VirtAddr;

use super::signal::{SignalHandler, SignalHandlerTable};
use super::watcher::{WatchEvents, Watcher};
use super::{ProcessId, PsError, ThreadId};
use crate::config::{NAME_MAX, PATH_MAX, RESERVED_HANDLES, SIGNAL_MAX};
use crate::ke::bugcheck::{codes, ke_bug_check_ex};
use crate::ke::{Scheduler, SpinLock, SpinLockGuard, Thread};
use crate::mm::AddressSpace;
use crate::ob::{FsNode, HandleTable};

/// Process lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Running = 0,
    Dying = 1,
    Dead = 2,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessState::Running,
            1 => ProcessState::Dying,
            _ => ProcessState::Dead,
        }
    }
}

/// User and group identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

/// Everything needed to build a process
pub struct ProcessParams<'a> {
    pub pid: ProcessId,
    pub name: &'a str,
    pub working_dir: &'a str,
    pub working_dir_node: Option<Arc<dyn FsNode>>,
    /// None for processes that run on the kernel root
    pub address_space: Option<AddressSpace>,
    pub is_idle: bool,
    pub creation_time: u64,
}

struct ProcessInner {
    threads: Vec<Arc<Thread>>,
    children: Vec<Arc<Process>>,
    next_tid: u32,
    started: bool,
    executable_base: VirtAddr,
    environment_block: Option<VirtAddr>,
    shared_data_base: Option<VirtAddr>,
    signal_trampoline: Option<VirtAddr>,
}

/// Process object
pub struct Process {
    pid: ProcessId,
    name: SpinLock<String>,
    working_dir: SpinLock<String>,
    working_dir_node: SpinLock<Option<Arc<dyn FsNode>>>,
    state: AtomicU8,
    main_thread: SpinLock<Arc<Thread>>,
    inner: SpinLock<ProcessInner>,
    address_space: SpinLock<Option<Arc<AddressSpace>>>,
    handles: HandleTable,
    watchers: SpinLock<Vec<Arc<Watcher>>>,
    signal_handlers: SpinLock<SignalHandlerTable>,
    credentials: SpinLock<Credentials>,
    parent: SpinLock<Option<Weak<Process>>>,
    is_idle: bool,
    creation_time: u64,
}

impl Process {
    /// Build a Running process with its main thread (TID 1)
    pub fn new(params: ProcessParams<'_>) -> Arc<Process> {
        let ProcessParams {
            pid,
            name,
            working_dir,
            working_dir_node,
            address_space,
            is_idle,
            creation_time,
        } = params;

        Arc::new_cyclic(|me: &Weak<Process>| {
            let main_thread = Arc::new(Thread::new(ThreadId(1), pid, me.clone()));
            Process {
                pid,
                name: SpinLock::new(bounded(name, NAME_MAX)),
                working_dir: SpinLock::new(bounded(working_dir, PATH_MAX)),
                working_dir_node: SpinLock::new(working_dir_node),
                state: AtomicU8::new(ProcessState::Running as u8),
                main_thread: SpinLock::new(main_thread.clone()),
                inner: SpinLock::new(ProcessInner {
                    threads: alloc::vec![main_thread],
                    children: Vec::new(),
                    next_tid: 2,
                    started: false,
                    executable_base: VirtAddr::zero(),
                    environment_block: None,
                    shared_data_base: None,
                    signal_trampoline: None,
                }),
                address_space: SpinLock::new(address_space.map(Arc::new)),
                handles: HandleTable::new(RESERVED_HANDLES),
                watchers: SpinLock::new(Vec::new()),
                signal_handlers: SpinLock::new([SignalHandler::default(); SIGNAL_MAX]),
                credentials: SpinLock::new(Credentials::default()),
                parent: SpinLock::new(None),
                is_idle,
                creation_time,
            }
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = bounded(name, NAME_MAX);
    }

    pub fn working_dir(&self) -> String {
        self.working_dir.lock().clone()
    }

    pub fn working_dir_node(&self) -> Option<Arc<dyn FsNode>> {
        self.working_dir_node.lock().clone()
    }

    pub fn set_working_dir(&self, path: &str, node: Option<Arc<dyn FsNode>>) {
        *self.working_dir.lock() = bounded(path, PATH_MAX);
        *self.working_dir_node.lock() = node;
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    /// Platform uptime when the process was built
    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Move Running -> Dying. Only one caller ever gets true.
    pub fn begin_dying(&self) -> bool {
        self.state
            .compare_exchange(
                ProcessState::Running as u8,
                ProcessState::Dying as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move Dying -> Dead and fire every watcher once.
    ///
    /// Returns the number of watchers signalled.
    pub fn mark_dead(&self) -> usize {
        let watchers = {
            let mut list = self.watchers.lock();
            let state = self.state();
            if state != ProcessState::Dying {
                ke_bug_check_ex(
                    codes::INVALID_PROCESS_STATE_TRANSITION,
                    self.pid.as_u32() as u64,
                    state as u64,
                    ProcessState::Dead as u64,
                    0,
                );
            }
            self.state.store(ProcessState::Dead as u8, Ordering::Release);
            core::mem::take(&mut *list)
        };

        for watcher in &watchers {
            watcher.signal();
        }
        watchers.len()
    }

    /// Queue the main thread. Later calls do nothing.
    pub fn start(&self, scheduler: &Scheduler) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.started {
                return false;
            }
            inner.started = true;
        }
        scheduler.insert_new_thread(self.main_thread());
        true
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    /// Release what a Dead, unparented process still holds
    pub fn destroy(&self) {
        let state = self.state();
        if state != ProcessState::Dead {
            ke_bug_check_ex(
                codes::PROCESS_DESTROYED_WHILE_ALIVE,
                self.pid.as_u32() as u64,
                state as u64,
                0,
                0,
            );
        }
        if self.has_parent() {
            ke_bug_check_ex(
                codes::PROCESS_DESTROYED_WHILE_PARENTED,
                self.pid.as_u32() as u64,
                0,
                0,
                0,
            );
        }

        let space = self.address_space.lock().take();
        let main = self.main_thread();
        let (threads, children) = {
            let mut inner = self.inner.lock();
            inner.threads.retain(|t| Arc::ptr_eq(t, &main));
            (inner.threads.len(), core::mem::take(&mut inner.children))
        };
        drop(children);
        drop(space);
        log::trace!("[PS] [{}] destroyed ({} thread left)", self.pid, threads);
    }

    // ========================================================================
    // Threads
    // ========================================================================

    pub fn main_thread(&self) -> Arc<Thread> {
        self.main_thread.lock().clone()
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.inner.lock().threads.clone()
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().threads.len()
    }

    pub fn thread(&self, tid: ThreadId) -> Option<Arc<Thread>> {
        self.inner.lock().threads.iter().find(|t| t.tid() == tid).cloned()
    }

    /// Add a thread with the next TID. Refused once the process is dying.
    pub fn add_thread(self: &Arc<Self>) -> Result<Arc<Thread>, PsError> {
        let mut inner = self.inner.lock();
        if !self.is_running() {
            return Err(PsError::ProcessNotRunning);
        }
        let tid = ThreadId(inner.next_tid);
        inner.next_tid += 1;
        let thread = Arc::new(Thread::new(tid, self.pid, Arc::downgrade(self)));
        inner.threads.push(thread.clone());
        Ok(thread)
    }

    /// Drop every thread except `keep` from the thread list.
    ///
    /// `keep` becomes the main thread.
    pub fn remove_threads_except(&self, keep: &Arc<Thread>) -> Vec<Arc<Thread>> {
        let removed = {
            let mut inner = self.inner.lock();
            let (kept, removed): (Vec<_>, Vec<_>) = inner
                .threads
                .drain(..)
                .partition(|t| Arc::ptr_eq(t, keep));
            inner.threads = kept;
            removed
        };
        *self.main_thread.lock() = keep.clone();
        removed
    }

    // ========================================================================
    // Family
    // ========================================================================

    pub fn children(&self) -> Vec<Arc<Process>> {
        self.inner.lock().children.clone()
    }

    pub fn child(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.inner.lock().children.iter().find(|c| c.pid == pid).cloned()
    }

    pub fn add_child(&self, child: Arc<Process>) {
        self.inner.lock().children.push(child);
    }

    pub fn remove_child(&self, pid: ProcessId) -> Option<Arc<Process>> {
        let mut inner = self.inner.lock();
        let index = inner.children.iter().position(|c| c.pid == pid)?;
        Some(inner.children.remove(index))
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_parent(&self, parent: Option<&Arc<Process>>) {
        *self.parent.lock() = parent.map(Arc::downgrade);
    }

    pub fn has_parent(&self) -> bool {
        self.parent.lock().is_some()
    }

    // ========================================================================
    // Resources
    // ========================================================================

    pub fn address_space(&self) -> Option<Arc<AddressSpace>> {
        self.address_space.lock().clone()
    }

    /// Swap the address space, returning the old one
    pub fn replace_address_space(&self, space: Option<Arc<AddressSpace>>) -> Option<Arc<AddressSpace>> {
        core::mem::replace(&mut *self.address_space.lock(), space)
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn credentials(&self) -> Credentials {
        *self.credentials.lock()
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.lock() = credentials;
    }

    pub fn signal_handlers(&self) -> SpinLockGuard<'_, SignalHandlerTable> {
        self.signal_handlers.lock()
    }

    /// Put caught signals back to their default action
    pub fn reset_signal_handlers(&self) -> usize {
        let mut handlers = self.signal_handlers.lock();
        let mut reset = 0;
        for handler in handlers.iter_mut().filter(|h| h.resets_on_exec()) {
            *handler = SignalHandler::default();
            reset += 1;
        }
        reset
    }

    // ------------------------------------------------------------------------
    // Fixed user mappings
    // ------------------------------------------------------------------------

    pub fn executable_base(&self) -> VirtAddr {
        self.inner.lock().executable_base
    }

    pub fn set_executable_base(&self, base: VirtAddr) {
        self.inner.lock().executable_base = base;
    }

    pub fn environment_block(&self) -> Option<VirtAddr> {
        self.inner.lock().environment_block
    }

    pub fn set_environment_block(&self, base: Option<VirtAddr>) {
        self.inner.lock().environment_block = base;
    }

    pub fn shared_data_base(&self) -> Option<VirtAddr> {
        self.inner.lock().shared_data_base
    }

    pub fn set_shared_data_base(&self, base: Option<VirtAddr>) {
        self.inner.lock().shared_data_base = base;
    }

    pub fn signal_trampoline(&self) -> Option<VirtAddr> {
        self.inner.lock().signal_trampoline
    }

    pub fn set_signal_trampoline(&self, base: Option<VirtAddr>) {
        self.inner.lock().signal_trampoline = base;
    }

    // ========================================================================
    // Watchers
    // ========================================================================

    /// Register `watcher` for `events`.
    ///
    /// Only termination can be watched. On a Dead process the watcher
    /// fires before this returns and is not kept.
    pub fn watch(&self, watcher: Arc<Watcher>, events: WatchEvents) -> Result<(), PsError> {
        if events != WatchEvents::TERMINATED {
            return Err(PsError::UnsupportedEvent);
        }

        let mut watchers = self.watchers.lock();
        if self.state() == ProcessState::Dead {
            drop(watchers);
            watcher.signal();
            return Ok(());
        }
        watchers.push(watcher);
        Ok(())
    }

    /// Remove `watcher`, returning whether it was registered
    pub fn unwatch(&self, watcher: &Arc<Watcher>) -> bool {
        let mut watchers = self.watchers.lock();
        match watchers.iter().position(|w| Arc::ptr_eq(w, watcher)) {
            Some(index) => {
                watchers.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }
}

fn bounded(text: &str, max: usize) -> String {
    if text.len() <= max {
        return String::from(text);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&text[..end])
}

/*
 * Process Management
 *
 * A process is an address space plus the threads running in it. Ownership
 * is directional:
 * - a process owns its threads and its live and zombie children (`Arc`)
 * - threads and children point back at their process/parent with `Weak`
 * - the registry maps IDs to `Weak` handles for lookups only
 *
 * Every process except the kernel process (PID 0) has a parent; processes
 * created without one become children of the kernel process, so the whole
 * tree is owned from PID 0 down and nothing leaks through reference cycles.
 */

use alloc::{
    boxed::Box,
    collections::BTreeMap,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::event::Event;
use super::thread::Thread;
use super::types::{ProcessId, SchedError, ThreadId};
use crate::memory::AddressSpace;
use crate::sync::IrqLock;

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is running (has at least one live thread)
    Running,
    /// Process has exited but not yet been reaped
    Zombie,
}

pub(crate) struct ProcessInner {
    pub(crate) state: ProcessState,
    pub(crate) exit_code: Option<i32>,
    pub(crate) threads: BTreeMap<ThreadId, Arc<Thread>>,
    pub(crate) children: BTreeMap<ProcessId, Arc<Process>>,
    pub(crate) zombies: BTreeMap<ProcessId, Arc<Process>>,
}

/// A process represents an isolated execution environment
pub struct Process {
    id: ProcessId,
    /// Never reused, unlike `id`
    serial: u64,
    name: String,
    pub(crate) parent: IrqLock<Weak<Process>>,
    address_space: Box<dyn AddressSpace>,
    pub(crate) inner: IrqLock<ProcessInner>,
    next_tid: AtomicUsize,
    /// Triggered once for every child that becomes a zombie
    pub(crate) child_exited: Event,
}

impl Process {
    fn new(id: ProcessId, serial: u64, name: &str, address_space: Box<dyn AddressSpace>) -> Self {
        Self {
            id,
            serial,
            name: String::from(name),
            parent: IrqLock::new(Weak::new()),
            address_space,
            inner: IrqLock::new(ProcessInner {
                state: ProcessState::Running,
                exit_code: None,
                threads: BTreeMap::new(),
                children: BTreeMap::new(),
                zombies: BTreeMap::new(),
            }),
            next_tid: AtomicUsize::new(0),
            child_exited: Event::new(),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity that survives PID reuse
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn is_kernel(&self) -> bool {
        self.id == ProcessId::KERNEL
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    pub fn is_zombie(&self) -> bool {
        self.state() == ProcessState::Zombie
    }

    /// Exit code, set once when the process exits
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().exit_code
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().upgrade()
    }

    pub fn address_space(&self) -> &dyn AddressSpace {
        self.address_space.as_ref()
    }

    pub(crate) fn alloc_tid(&self) -> ThreadId {
        ThreadId(self.next_tid.fetch_add(1, Ordering::Relaxed))
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().threads.len()
    }

    pub fn thread(&self, tid: ThreadId) -> Option<Arc<Thread>> {
        self.inner.lock().threads.get(&tid).cloned()
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.inner.lock().threads.values().cloned().collect()
    }

    pub fn has_child(&self, pid: ProcessId) -> bool {
        self.inner.lock().children.contains_key(&pid)
    }

    pub fn has_zombie(&self, pid: ProcessId) -> bool {
        self.inner.lock().zombies.contains_key(&pid)
    }

    pub fn child_ids(&self) -> Vec<ProcessId> {
        self.inner.lock().children.keys().copied().collect()
    }

    pub fn zombie_ids(&self) -> Vec<ProcessId> {
        self.inner.lock().zombies.keys().copied().collect()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("thread_count", &inner.threads.len())
            .field("exit_code", &inner.exit_code)
            .finish()
    }
}

/// Global process table
///
/// ID allocation and lookup share one lock. IDs are handed out lowest-free
/// first and return to the pool when the process is reaped.
pub struct ProcessRegistry {
    table: IrqLock<BTreeMap<ProcessId, Weak<Process>>>,
    max_pid: usize,
    next_serial: AtomicU64,
}

impl ProcessRegistry {
    pub fn new(max_pid: usize) -> Self {
        Self {
            table: IrqLock::new(BTreeMap::new()),
            max_pid,
            next_serial: AtomicU64::new(0),
        }
    }

    /// Allocate the lowest free ID and register a new process under it
    pub(crate) fn create(
        &self,
        name: &str,
        address_space: Box<dyn AddressSpace>,
    ) -> Result<Arc<Process>, SchedError> {
        let mut table = self.table.lock();

        let mut candidate = 0;
        for pid in table.keys() {
            if pid.0 != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate > self.max_pid {
            return Err(SchedError::NoFreePids);
        }

        let pid = ProcessId(candidate);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let process = Arc::new(Process::new(pid, serial, name, address_space));
        table.insert(pid, Arc::downgrade(&process));
        Ok(process)
    }

    /// Resolve a live (running or zombie) process by ID
    pub fn lookup(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.table.lock().get(&pid).and_then(Weak::upgrade)
    }

    /// Whether `pid` is currently allocated
    pub fn contains(&self, pid: ProcessId) -> bool {
        self.table.lock().contains_key(&pid)
    }

    /// Return `pid` to the free pool
    pub(crate) fn release(&self, pid: ProcessId) {
        self.table.lock().remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSpace;

    fn space() -> Box<dyn AddressSpace> {
        Box::new(MockSpace::default())
    }

    #[test]
    fn test_lowest_free_pid_first() {
        let registry = ProcessRegistry::new(16);
        let a = registry.create("a", space()).expect("a");
        let b = registry.create("b", space()).expect("b");
        let c = registry.create("c", space()).expect("c");
        assert_eq!((a.id(), b.id(), c.id()), (ProcessId(0), ProcessId(1), ProcessId(2)));

        registry.release(b.id());
        let d = registry.create("d", space()).expect("d");
        assert_eq!(d.id(), ProcessId(1));
        assert_ne!(d.serial(), b.serial());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let registry = ProcessRegistry::new(1);
        let _a = registry.create("a", space()).expect("a");
        let _b = registry.create("b", space()).expect("b");
        assert_eq!(
            registry.create("c", space()).map(|p| p.id()),
            Err(SchedError::NoFreePids)
        );
    }

    #[test]
    fn test_lookup_does_not_extend_lifetime() {
        let registry = ProcessRegistry::new(4);
        let a = registry.create("a", space()).expect("a");
        assert!(registry.lookup(ProcessId(0)).is_some());
        drop(a);
        assert!(registry.lookup(ProcessId(0)).is_none());
        assert!(registry.contains(ProcessId(0)));
    }
}

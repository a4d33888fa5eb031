//! The process tree.
//!
//! Parents, children and pid lookup live in maps keyed by pid (a node
//! arena) behind one lock. A parent link is just a pid, a weak
//! back-reference; a child is owned by its parent's child list until the
//! parent reaps it, and orphans move to the root process. Pids come from
//! a bitmap and return to it only at reap.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{KernelContext, Pid, Proc};
use crate::arch::{Arch, TargetArch};
use crate::cpu;
use crate::file::FileType;
use crate::fs::RcInode;
use crate::lock::SpinLock;
use crate::param::NPID;
use crate::sched::{self, ProcEntry};

struct PidMap {
    words: [u64; NPID / 64],
}

impl PidMap {
    const fn new() -> Self {
        let mut words = [0u64; NPID / 64];
        // Pid 0 belongs to the idle tasks.
        words[0] = 1;
        Self { words }
    }

    fn alloc(&mut self) -> Option<Pid> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                return Some((i * 64 + bit) as Pid);
            }
        }
        None
    }

    fn free(&mut self, pid: Pid) {
        let pid = pid as usize;
        assert!(pid < NPID && self.words[pid / 64] & (1 << (pid % 64)) != 0, "free_pid");
        self.words[pid / 64] &= !(1 << (pid % 64));
    }
}

struct TreeInner {
    /// Every live (created, not yet reaped) process.
    procs: BTreeMap<Pid, Arc<Proc>>,

    /// Child pid to parent pid.
    parent: BTreeMap<Pid, Pid>,

    /// Parent pid to owned children.
    children: BTreeMap<Pid, Vec<Arc<Proc>>>,

    root: Option<Arc<Proc>>,
}

pub struct ProcTree {
    inner: SpinLock<TreeInner>,
    pids: SpinLock<PidMap>,
}

/// First function of a process that enters user space: restores the user
/// context built by fork or exec.
extern "C" fn user_entry(_: usize) -> ! {
    // SAFETY: the process's user context and page table are in place.
    unsafe { TargetArch::trap_return() }
}

impl ProcTree {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "ptree",
                TreeInner {
                    procs: BTreeMap::new(),
                    parent: BTreeMap::new(),
                    children: BTreeMap::new(),
                    root: None,
                },
            ),
            pids: SpinLock::new("pid", PidMap::new()),
        }
    }

    /// Allocates a pid and builds a process in the `Unused` state.
    pub fn create(&self, cwd: Option<RcInode>) -> Result<Arc<Proc>, ()> {
        let pid = self.pids.lock().alloc().ok_or(())?;
        match Proc::new(pid, false, cwd) {
            Ok(p) => {
                self.inner.lock().procs.insert(pid, Arc::clone(&p));
                Ok(p)
            }
            Err(()) => {
                self.pids.lock().free(pid);
                Err(())
            }
        }
    }

    /// Deletes a process that was never started (error unwinding).
    fn discard(&self, p: &Arc<Proc>) {
        let mut t = self.inner.lock();
        t.procs.remove(&p.pid);
        t.parent.remove(&p.pid);
        drop(t);
        self.pids.lock().free(p.pid);
    }

    /// Installs `p` as the root process; it is its own parent.
    pub fn install_root(&self, p: &Arc<Proc>) {
        let mut t = self.inner.lock();
        assert!(t.root.is_none(), "proc tree: second root");
        t.root = Some(Arc::clone(p));
        t.parent.insert(p.pid, p.pid);
    }

    pub fn root(&self) -> Arc<Proc> {
        self.inner.lock().root.clone().expect("proc tree: no root")
    }

    pub fn find(&self, pid: Pid) -> Option<Arc<Proc>> {
        self.inner.lock().procs.get(&pid).cloned()
    }

    /// Seeds the kernel context so the process starts in
    /// `proc_entry(entry, arg)`, adopts it to the root if unparented, and
    /// activates it.
    pub fn start(&self, p: &Arc<Proc>, entry: ProcEntry, arg: usize) -> Pid {
        {
            let mut t = self.inner.lock();
            if !t.parent.contains_key(&p.pid) {
                let root = t.root.clone().expect("proc tree: no root");
                t.parent.insert(p.pid, root.pid);
                t.children.entry(root.pid).or_insert_with(Vec::new).push(Arc::clone(p));
            }
        }
        // SAFETY: the process has not been activated, we have exclusive
        // access.
        unsafe {
            let kctx = p.data().kstack.kcontext();
            *kctx = KernelContext::zeroed();
            (*kctx).lr = sched::proc_entry as usize as u64;
            (*kctx).x0 = entry as usize as u64;
            (*kctx).x1 = arg as u64;
            p.sch().context = kctx;
        }
        sched::activate(p);
        p.pid
    }

    /// Starts `p` straight into user space via the trap return path.
    pub fn start_user(&self, p: &Arc<Proc>) -> Pid {
        self.start(p, user_entry, 0)
    }

    /// Creates a child copying the caller: same user context (with a zero
    /// return value), copy-on-write address space, shared working
    /// directory, duplicated open files. Sockets are not inherited.
    pub fn fork(&self) -> Result<Pid, ()> {
        let this = cpu::current().ok_or(())?;
        // SAFETY: we are the running owner.
        let this_data = unsafe { this.data() };
        let child = self.create(this_data.cwd.clone())?;

        // SAFETY: the child is unstarted; we are its only user.
        unsafe {
            let child_data = child.data();
            *child_data.kstack.ucontext() = *this_data.kstack.ucontext();
            (*child_data.kstack.ucontext()).x[0] = 0;

            if this_data.pgdir.cow_clone_into(&child_data.pgdir).is_err() {
                self.discard(&child);
                return Err(());
            }

            for (fd, f) in this_data.oftable.iter() {
                if !matches!(f.typ, FileType::Socket { .. }) {
                    child_data.oftable.set(fd, Arc::clone(f));
                }
            }
        }

        {
            let mut t = self.inner.lock();
            t.parent.insert(child.pid, this.pid);
            t.children
                .entry(this.pid)
                .or_insert_with(Vec::new)
                .push(Arc::clone(&child));
        }
        Ok(self.start(&child, user_entry, 0))
    }

    /// Hands `pid`'s children to the root, optionally posting the root's
    /// `childexit` for every zombie among them.
    fn reparent_to_root(&self, pid: Pid, notify_zombies: bool) {
        let (root, moved) = {
            let mut t = self.inner.lock();
            let root = t.root.clone().expect("proc tree: no root");
            let kids = t.children.remove(&pid).unwrap_or_default();
            for k in &kids {
                t.parent.insert(k.pid, root.pid);
            }
            t.children
                .entry(root.pid)
                .or_insert_with(Vec::new)
                .extend(kids.iter().cloned());
            (root, kids)
        };
        if notify_zombies {
            for k in moved {
                if sched::is_zombie(&k) {
                    root.childexit.post();
                }
            }
        }
    }

    /// Terminates the calling process: records the exit code, orphans its
    /// children onto the root, releases every user-visible resource, and
    /// schedules away as a zombie after posting the parent.
    pub fn exit(&self, code: i32) -> ! {
        let this = cpu::current().expect("exit: no process");
        {
            let root = self.root();
            assert!(!Arc::ptr_eq(&this, &root), "exit: the root process exited");
        }
        this.set_exit_code(code);
        self.reparent_to_root(this.pid, true);

        // SAFETY: we are the running owner.
        let data = unsafe { this.data() };
        data.oftable.clear();
        data.cwd = None;
        data.pgdir.release();

        let parent = {
            let t = self.inner.lock();
            t.parent
                .get(&this.pid)
                .and_then(|pp| t.procs.get(pp).cloned())
                .or_else(|| t.root.clone())
        };
        // This stack is never resumed; drop the handle before leaving.
        drop(this);
        sched::exit_to_zombie(parent)
    }

    /// Waits for a child to exit and reaps it, returning its pid and exit
    /// code. Fails with no children, or when killed while waiting (the
    /// children then move to the root).
    pub fn wait(&self) -> Result<(Pid, i32), ()> {
        let this = cpu::current().ok_or(())?;
        {
            let t = self.inner.lock();
            if t.children.get(&this.pid).map_or(true, |c| c.is_empty()) {
                return Err(());
            }
        }
        loop {
            if !this.childexit.wait() {
                self.reparent_to_root(this.pid, false);
                return Err(());
            }
            let mut t = self.inner.lock();
            let kids = match t.children.get_mut(&this.pid) {
                Some(kids) => kids,
                None => return Err(()),
            };
            if let Some(pos) = kids.iter().position(|k| sched::is_zombie(k)) {
                let child = kids.remove(pos);
                t.parent.remove(&child.pid);
                t.procs.remove(&child.pid);
                drop(t);
                let pid = child.pid;
                let code = child.exit_code();
                // The last handle: dropping it frees the kernel stack and
                // the process body.
                drop(child);
                self.pids.lock().free(pid);
                return Ok((pid, code));
            }
            // A wakeup without a zombie of ours; keep waiting.
        }
    }

    /// Marks `pid` killed and alerts it out of any alertable wait.
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        let p = self.inner.lock().procs.get(&pid).cloned().ok_or(())?;
        if sched::is_unused(&p) {
            return Err(());
        }
        p.set_killed();
        sched::alert(&p);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_bitmap_roundtrip() {
        let mut pids = PidMap::new();
        let a = pids.alloc().unwrap();
        let b = pids.alloc().unwrap();
        // Pid 0 is reserved for the idle tasks.
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        pids.free(a);
        assert_eq!(pids.alloc().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "free_pid")]
    fn double_free_pid_panics() {
        let mut pids = PidMap::new();
        let a = pids.alloc().unwrap();
        pids.free(a);
        pids.free(a);
    }

    #[test]
    fn create_find_kill() {
        crate::kalloc::test_pool::init();
        let tree: &'static ProcTree = Box::leak(Box::new(ProcTree::new()));
        let p = tree.create(None).unwrap();
        assert!(tree.find(p.pid).is_some());
        // Unstarted processes cannot be killed.
        assert!(tree.kill(p.pid).is_err());
        assert!(tree.kill(9999).is_err());

        // Once runnable, kill sets the flag.
        sched::activate(&p);
        tree.kill(p.pid).unwrap();
        assert!(p.killed());
    }
}

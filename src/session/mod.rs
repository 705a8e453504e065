pub mod diversion;
pub mod record;
pub mod replay;

use crate::address_space::{AddressSpace, WatchConfig};
use crate::remote_code_ptr::RemoteCodePtr;
use crate::task::Task;
use crate::uid::{AddressSpaceUid, TaskUid, ThreadGroupUid};
use crate::wait_status::WaitType;
use libc::pid_t;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

/// A process group of tasks. Parent uids form a tree rooted at the initial
/// exec.
pub struct ThreadGroup {
    pub tgid: pid_t,
    pub serial: u32,
    pub parent: Option<ThreadGroupUid>,
    pub children: Vec<ThreadGroupUid>,
    pub exit_status: i32,
    /// Torn down without a clean ptrace detach; consistency checks relax
    /// for its members.
    pub unstable: bool,
}

impl ThreadGroup {
    pub fn uid(&self) -> ThreadGroupUid {
        ThreadGroupUid::new(self.tgid, self.serial)
    }
}

/// What a step operation observed, for the layers above (timeline, debugger
/// server).
#[derive(Clone, Default)]
pub struct BreakStatus {
    pub task: Option<TaskUid>,
    /// Stopped at a user breakpoint.
    pub breakpoint_hit: bool,
    /// Watchpoints that changed or fired.
    pub watchpoints_hit: Vec<WatchConfig>,
    /// A signal is pending delivery to the debugger's client.
    pub signal: Option<i32>,
    /// A requested single-step finished.
    pub singlestep_complete: bool,
    /// Within the skid margin of a requested ticks target.
    pub approaching_ticks_target: bool,
    /// The stopped task is exiting.
    pub task_exit: bool,
}

impl BreakStatus {
    pub fn new() -> BreakStatus {
        Default::default()
    }

    pub fn any_break(&self) -> bool {
        self.breakpoint_hit
            || !self.watchpoints_hit.is_empty()
            || self.signal.is_some()
            || self.singlestep_complete
            || self.approaching_ticks_target
    }
}

/// How the caller wants a step to execute.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RunCommand {
    Continue,
    Singlestep,
    /// Single-step, but coalesce a single-instruction loop into one step.
    SinglestepFastForward,
}

/// The arena owner for one coherent set of tracees: tasks, address spaces
/// and thread groups are stored in uid-keyed tables and refer to one
/// another only by uid. Dropping a Session drops tasks first, then spaces,
/// then groups (field order below).
pub struct Session {
    pub tasks: BTreeMap<TaskUid, Task>,
    pub vms: BTreeMap<AddressSpaceUid, AddressSpace>,
    pub thread_groups: BTreeMap<ThreadGroupUid, ThreadGroup>,
    next_serial: u32,
    /// Set by a debugger interrupt or SIGINT; checked at safe points.
    pub interrupted: bool,
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Session {
    pub fn new() -> Session {
        Session {
            tasks: BTreeMap::new(),
            vms: BTreeMap::new(),
            thread_groups: BTreeMap::new(),
            next_serial: 1,
            interrupted: false,
        }
    }

    pub fn next_task_serial(&mut self) -> u32 {
        let s = self.next_serial;
        self.next_serial += 1;
        s
    }

    pub fn task(&self, uid: TaskUid) -> &Task {
        &self.tasks[&uid]
    }

    pub fn task_mut(&mut self, uid: TaskUid) -> &mut Task {
        self.tasks.get_mut(&uid).unwrap()
    }

    pub fn find_task_by_rec_tid(&self, rec_tid: pid_t) -> Option<TaskUid> {
        self.tasks
            .values()
            .find(|t| t.rec_tid == rec_tid)
            .map(|t| t.uid())
    }

    /// Split borrow: the task and its address space, simultaneously
    /// mutable. Legal because they live in disjoint tables.
    pub fn task_and_vm_mut(&mut self, uid: TaskUid) -> (&mut Task, &mut AddressSpace) {
        let tasks = &mut self.tasks;
        let vms = &mut self.vms;
        let t = tasks.get_mut(&uid).unwrap();
        let vm = vms.get_mut(&t.vm_uid).unwrap();
        (t, vm)
    }

    pub fn vm_of(&self, uid: TaskUid) -> &AddressSpace {
        &self.vms[&self.tasks[&uid].vm_uid]
    }

    pub fn vm_of_mut(&mut self, uid: TaskUid) -> &mut AddressSpace {
        let vm_uid = self.tasks[&uid].vm_uid;
        self.vms.get_mut(&vm_uid).unwrap()
    }

    /// Register a freshly created thread group.
    pub fn create_thread_group(
        &mut self,
        tgid: pid_t,
        parent: Option<ThreadGroupUid>,
    ) -> ThreadGroupUid {
        let serial = self.next_task_serial();
        let tg = ThreadGroup {
            tgid,
            serial,
            parent,
            children: Vec::new(),
            exit_status: 0,
            unstable: false,
        };
        let uid = tg.uid();
        if let Some(parent_uid) = parent {
            if let Some(p) = self.thread_groups.get_mut(&parent_uid) {
                p.children.push(uid);
            }
        }
        self.thread_groups.insert(uid, tg);
        uid
    }

    /// Remove a task and, when it was the last member, its thread group's
    /// task-level bookkeeping. Address spaces are dropped when no task
    /// references them.
    pub fn destroy_task(&mut self, uid: TaskUid) {
        let t = match self.tasks.remove(&uid) {
            Some(t) => t,
            None => return,
        };
        let vm_uid = t.vm_uid;
        if !self.tasks.values().any(|other| other.vm_uid == vm_uid) {
            self.vms.remove(&vm_uid);
        }
    }

    pub fn mark_unstable(&mut self, tg_uid: ThreadGroupUid) {
        if let Some(tg) = self.thread_groups.get_mut(&tg_uid) {
            tg.unstable = true;
        }
        for t in self.tasks.values_mut() {
            if t.tg_uid == tg_uid {
                t.unstable = true;
            }
        }
    }

    /// Shutdown: for each stopped task, write an exit syscall at a safe IP
    /// and detach; SIGKILL whatever survives and mark its group unstable so
    /// later bookkeeping tolerates the mess.
    pub fn kill_all_tasks(&mut self) {
        let uids: Vec<TaskUid> = self.tasks.keys().copied().collect();
        for uid in uids {
            let vm_traced_ip = {
                let t = &self.tasks[&uid];
                self.vms
                    .get(&t.vm_uid)
                    .filter(|vm| vm.stub_page_mapped())
                    .map(|vm| vm.traced_syscall_ip())
            };
            let t = self.tasks.get_mut(&uid).unwrap();
            let clean = if t.is_stopped() {
                if let Some(ip) = vm_traced_ip {
                    t.set_ip(ip);
                }
                t.try_graceful_exit()
            } else {
                false
            };
            if !clean {
                let tg_uid = t.tg_uid;
                t.kill();
                self.mark_unstable(tg_uid);
            }
        }
        // Reap what we can; survivors are the kernel's problem now.
        for t in self.tasks.values() {
            let _ = kill(Pid::from_raw(t.tid), None::<Signal>);
        }
        self.tasks.clear();
        self.vms.clear();
    }
}

/// Fork and exec the initial tracee under ptrace, stopped at its first
/// instruction (the post-exec trap). Returns the child pid.
pub fn spawn_tracee(exe: &OsStr, argv: &[OsString], envp: &[OsString], cwd: &OsStr) -> pid_t {
    let exe_c = CString::new(exe.as_bytes()).unwrap();
    let argv_c: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()).unwrap())
        .collect();
    let mut envp_vec: Vec<OsString> = envp.to_vec();
    envp_vec.push(OsString::from("RUNNING_UNDER_RETRACE=1"));
    let envp_c: Vec<CString> = envp_vec
        .iter()
        .map(|e| CString::new(e.as_bytes()).unwrap())
        .collect();

    match unsafe { libc::fork() } {
        -1 => fatal!("fork() failed spawning {:?}", exe),
        0 => {
            // Child.
            unsafe {
                if !cwd.is_empty() {
                    let cwd_c = CString::new(cwd.as_bytes()).unwrap();
                    libc::chdir(cwd_c.as_ptr());
                }
                libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0);
                // The parent attaches options at our first stop.
                libc::raise(libc::SIGSTOP);

                let mut argv_ptrs: Vec<*const libc::c_char> =
                    argv_c.iter().map(|a| a.as_ptr()).collect();
                argv_ptrs.push(std::ptr::null());
                let mut envp_ptrs: Vec<*const libc::c_char> =
                    envp_c.iter().map(|e| e.as_ptr()).collect();
                envp_ptrs.push(std::ptr::null());
                libc::execve(exe_c.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                libc::_exit(126)
            }
        }
        child => {
            let mut status: i32 = 0;
            let ret = unsafe { libc::waitpid(child, &mut status, libc::__WALL) };
            if ret != child {
                fatal!("waitpid on spawned tracee {} failed", child);
            }
            child
        }
    }
}

/// Drive a freshly spawned task through its exec: set ptrace options at the
/// initial SIGSTOP, then continue to the exec stop.
pub fn wait_for_exec(t: &mut Task) {
    t.set_ptrace_options();
    loop {
        if t.status().ptrace_event() == Some(libc::PTRACE_EVENT_EXEC) {
            break;
        }
        match t.status().wait_type() {
            WaitType::Exit | WaitType::FatalSignal => {
                clean_fatal!(
                    "Tracee {} died before exec (is the binary executable?)",
                    t.tid
                );
            }
            _ => {}
        }
        t.resume_execution(
            crate::task::ResumeRequest::Cont,
            crate::task::WaitRequest::ResumeAndWait,
            0,
            None,
        );
    }
    t.post_exec(OsStr::new(""));
}

/// Read DR6-equivalent state. The engine does not program hardware debug
/// registers on all paths; value-compare watchpoints cover writes, and this
/// hook reports "no hardware status" so read/exec hits fall back
/// conservatively.
pub fn read_debug_status(_t: &Task) -> usize {
    0
}

/// True if the given stop looks like a breakpoint trap at one of our
/// installed breakpoints.
pub fn is_breakpoint_trap(t: &mut Task, vm: &AddressSpace) -> Option<RemoteCodePtr> {
    if t.status().stop_sig() != Some(libc::SIGTRAP) {
        return None;
    }
    let ip = t.ip();
    let bp_ip = ip.undo_executed_breakpoint();
    if vm.get_breakpoint_type_at_addr(bp_ip) != crate::address_space::BreakpointType::None {
        Some(bp_ip)
    } else {
        None
    }
}

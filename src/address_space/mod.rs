pub mod kernel_map_iterator;
pub mod kernel_mapping;
pub mod memory_range;

use crate::address_space::kernel_map_iterator::KernelMapIterator;
use crate::address_space::kernel_mapping::KernelMapping;
use crate::address_space::memory_range::{MemoryRange, MemoryRangeKey};
use crate::kernel_abi::{syscall_instruction, BREAKPOINT_INSN, BREAKPOINT_INSN_LEN};
use crate::kernel_supplement::{DS_WATCHPOINT_ANY, DS_SINGLESTEP};
use crate::preload_interface::{
    STUB_SYSCALL_PRIVILEGED_TRACED, STUB_SYSCALL_PRIVILEGED_UNTRACED, STUB_SYSCALL_TRACED,
    STUB_SYSCALL_UNTRACED, STUB_SYSCALL_UNTRACED_REPLAY_ONLY,
};
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::task::Task;
use crate::trace::frame::FrameTime;
use crate::uid::AddressSpaceUid;
use libc::{dev_t, ino_t, pid_t};
use nix::sys::mman::{MapFlags, ProtFlags};
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::ops::Bound::{Included, Unbounded};

/// Breakpoint refcount classes. User breakpoints (set through the debugger)
/// outrank internal ones (set by the replay engine for its own navigation):
/// a stop at an address with any user refcount reports as a user stop.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BreakpointType {
    None,
    Internal,
    User,
}

/// Watchpoint access classes. Values match the x86 debug-register type
/// field encoding.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(usize)]
pub enum WatchType {
    Exec = 0x00,
    Write = 0x01,
    ReadWrite = 0x03,
}

bitflags! {
    pub struct MappingFlags: u32 {
        /// Mapping holds a syscallbuf; its contents are not fully restored
        /// by replay and checksum-style comparisons must skip it.
        const IS_SYSCALLBUF = 0x1;
        /// The preload library's thread-locals area.
        const IS_THREAD_LOCALS = 0x2;
        /// Patch-stub trampolines.
        const IS_PATCH_STUBS = 0x4;
        /// The injected stub page itself.
        const IS_STUB_PAGE = 0x8;
    }
}

/// A distinct watchpoint as it would be programmed into one debug register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub kind: WatchType,
}

impl WatchConfig {
    pub fn new(addr: RemotePtr<Void>, num_bytes: usize, kind: WatchType) -> WatchConfig {
        WatchConfig {
            addr,
            num_bytes,
            kind,
        }
    }
}

/// Identifies an emulated file within the replay session's EmuFs; stored by
/// id rather than handle so address spaces stay plain data.
pub type EmuFileId = (dev_t, ino_t);

/// One entry in the tracked memory map: the live kernel view plus the
/// recorded view (they diverge when replay re-materialises a mapping from a
/// trace-backed file).
#[derive(Clone)]
pub struct Mapping {
    pub map: KernelMapping,
    pub recorded_map: KernelMapping,
    pub emu_file: Option<EmuFileId>,
    pub mapped_file_stat: Option<libc::stat>,
    pub flags: MappingFlags,
}

impl Mapping {
    pub fn new(map: KernelMapping, recorded_map: KernelMapping) -> Mapping {
        Mapping {
            map,
            recorded_map,
            emu_file: None,
            mapped_file_stat: None,
            flags: MappingFlags::empty(),
        }
    }

    pub fn with_emu_file(mut self, id: EmuFileId) -> Mapping {
        self.emu_file = Some(id);
        self
    }

    pub fn with_flags(mut self, flags: MappingFlags) -> Mapping {
        self.flags = flags;
        self
    }
}

struct Breakpoint {
    internal_count: u32,
    user_count: u32,
    /// The byte displaced by the trap opcode.
    overwritten_data: u8,
}

impl Breakpoint {
    fn bp_type(&self) -> BreakpointType {
        if self.user_count > 0 {
            BreakpointType::User
        } else if self.internal_count > 0 {
            BreakpointType::Internal
        } else {
            BreakpointType::None
        }
    }

    fn ref_count(&mut self, which: BreakpointType, delta: i32) {
        let slot = match which {
            BreakpointType::Internal => &mut self.internal_count,
            BreakpointType::User => &mut self.user_count,
            BreakpointType::None => panic!("refcounting a non-breakpoint"),
        };
        *slot = (*slot as i32 + delta) as u32;
    }

    fn total(&self) -> u32 {
        self.internal_count + self.user_count
    }
}

#[derive(Clone)]
struct Watchpoint {
    exec_count: u32,
    read_count: u32,
    write_count: u32,
    /// Snapshot of the watched bytes, for value-comparison watchpoints.
    value_bytes: Vec<u8>,
    /// Whether value_bytes could actually be read.
    valid: bool,
    /// Set when a change has been observed and not yet consumed.
    changed: bool,
}

impl Watchpoint {
    fn new(num_bytes: usize) -> Watchpoint {
        Watchpoint {
            exec_count: 0,
            read_count: 0,
            write_count: 0,
            value_bytes: vec![0; num_bytes],
            valid: false,
            changed: false,
        }
    }

    fn watched_type(&self) -> Option<WatchType> {
        // Reads are only observable through a read/write debug register.
        if self.read_count > 0 {
            Some(WatchType::ReadWrite)
        } else if self.write_count > 0 {
            Some(WatchType::Write)
        } else if self.exec_count > 0 {
            Some(WatchType::Exec)
        } else {
            None
        }
    }

    fn total(&self) -> u32 {
        self.exec_count + self.read_count + self.write_count
    }

    fn ref_count(&mut self, kind: WatchType, delta: i32) {
        let bump = |slot: &mut u32| *slot = (*slot as i32 + delta) as u32;
        match kind {
            WatchType::Exec => bump(&mut self.exec_count),
            WatchType::Write => bump(&mut self.write_count),
            WatchType::ReadWrite => {
                bump(&mut self.read_count);
                bump(&mut self.write_count);
            }
        }
    }
}

pub type MemoryMap = BTreeMap<MemoryRangeKey, Mapping>;

/// The tracked virtual-memory image of a set of tasks sharing one mm:
/// mappings, breakpoints, watchpoints and the stub-page registry.
///
/// Mutating entry points accept the task to write through; the address
/// space itself holds no task handles (tasks refer to it by uid).
pub struct AddressSpace {
    leader_tid: pid_t,
    leader_serial: u32,
    exec_count: u32,
    exe: OsString,

    mem: MemoryMap,
    /// Sizes of SYSV shm segments, for shmdt bookkeeping.
    shm_sizes: HashMap<RemotePtr<Void>, usize>,
    /// madvise DONTFORK regions, excluded from fork inheritance.
    dont_fork: Vec<MemoryRange>,

    /// Only meaningful during recording.
    brk_start: RemotePtr<Void>,
    brk_end: RemotePtr<Void>,

    breakpoints: HashMap<RemoteCodePtr, Breakpoint>,
    watchpoints: BTreeMap<MemoryRange, Watchpoint>,
    saved_watchpoints: Vec<BTreeMap<MemoryRange, Watchpoint>>,

    /// First mapped byte of the vdso.
    vdso_start: RemotePtr<Void>,

    stub_page_mapped: bool,
    syscallbuf_enabled: bool,

    /// Time of the first event that ran code in this address space.
    first_run_event: FrameTime,
}

impl AddressSpace {
    /// Build the model for a task that just completed exec, from the
    /// kernel's own map.
    pub fn new_after_exec(t: &mut Task, exe: &OsStr, exec_count: u32) -> AddressSpace {
        let mut vm = AddressSpace {
            leader_tid: t.rec_tid,
            leader_serial: t.serial,
            exec_count,
            exe: exe.to_owned(),
            mem: BTreeMap::new(),
            shm_sizes: HashMap::new(),
            dont_fork: Vec::new(),
            brk_start: RemotePtr::null(),
            brk_end: RemotePtr::null(),
            breakpoints: HashMap::new(),
            watchpoints: BTreeMap::new(),
            saved_watchpoints: Vec::new(),
            vdso_start: RemotePtr::null(),
            stub_page_mapped: false,
            syscallbuf_enabled: false,
            first_run_event: 0,
        };
        vm.populate_from_kernel(t.tid);
        vm
    }

    /// Build an empty model; replay fills it in from the trace.
    pub fn new_for_replay(leader_tid: pid_t, leader_serial: u32, exec_count: u32, exe: &OsStr) -> AddressSpace {
        AddressSpace {
            leader_tid,
            leader_serial,
            exec_count,
            exe: exe.to_owned(),
            mem: BTreeMap::new(),
            shm_sizes: HashMap::new(),
            dont_fork: Vec::new(),
            brk_start: RemotePtr::null(),
            brk_end: RemotePtr::null(),
            breakpoints: HashMap::new(),
            watchpoints: BTreeMap::new(),
            saved_watchpoints: Vec::new(),
            vdso_start: RemotePtr::null(),
            stub_page_mapped: false,
            syscallbuf_enabled: false,
            first_run_event: 0,
        }
    }

    fn populate_from_kernel(&mut self, tid: pid_t) {
        for km in KernelMapIterator::new(tid) {
            if km.is_vdso() {
                self.vdso_start = km.start();
            }
            if km.is_heap() {
                self.brk_start = km.start();
                self.brk_end = km.end();
            }
            let recorded = km.clone();
            self.mem
                .insert(MemoryRangeKey(km.range()), Mapping::new(km, recorded));
        }
    }

    /// A fork shares no memory but starts with an identical map.
    pub fn clone_for_fork(&self, leader_tid: pid_t, leader_serial: u32) -> AddressSpace {
        AddressSpace {
            leader_tid,
            leader_serial,
            exec_count: 0,
            exe: self.exe.clone(),
            mem: self.mem.clone(),
            shm_sizes: self.shm_sizes.clone(),
            dont_fork: self.dont_fork.clone(),
            brk_start: self.brk_start,
            brk_end: self.brk_end,
            // Breakpoint opcodes are inherited as bytes in the child's
            // (copied) memory, and so is our bookkeeping for them.
            breakpoints: self
                .breakpoints
                .iter()
                .map(|(k, v)| {
                    (
                        *k,
                        Breakpoint {
                            internal_count: v.internal_count,
                            user_count: v.user_count,
                            overwritten_data: v.overwritten_data,
                        },
                    )
                })
                .collect(),
            watchpoints: self.watchpoints.clone(),
            saved_watchpoints: Vec::new(),
            vdso_start: self.vdso_start,
            stub_page_mapped: self.stub_page_mapped,
            syscallbuf_enabled: self.syscallbuf_enabled,
            first_run_event: 0,
        }
    }

    pub fn uid(&self) -> AddressSpaceUid {
        AddressSpaceUid::new(self.leader_tid, self.leader_serial, self.exec_count)
    }

    pub fn exe_image(&self) -> &OsStr {
        &self.exe
    }

    pub fn vdso_start(&self) -> RemotePtr<Void> {
        self.vdso_start
    }

    pub fn first_run_event(&self) -> FrameTime {
        self.first_run_event
    }

    pub fn set_first_run_event(&mut self, time: FrameTime) {
        if self.first_run_event == 0 {
            self.first_run_event = time;
        }
    }

    pub fn syscallbuf_enabled(&self) -> bool {
        self.syscallbuf_enabled
    }

    pub fn set_syscallbuf_enabled(&mut self, enabled: bool) {
        self.syscallbuf_enabled = enabled;
    }

    // --- the memory map ---

    pub fn mapping_of(&self, addr: RemotePtr<Void>) -> Option<&Mapping> {
        self.mem
            .get(&MemoryRangeKey(MemoryRange::new_range(addr, 1)))
    }

    pub fn mapping_of_mut(&mut self, addr: RemotePtr<Void>) -> Option<&mut Mapping> {
        self.mem
            .get_mut(&MemoryRangeKey(MemoryRange::new_range(addr, 1)))
    }

    pub fn has_mapping(&self, addr: RemotePtr<Void>) -> bool {
        self.mapping_of(addr).is_some()
    }

    /// Snapshot of the keys at or after `start`, for iteration that must
    /// survive map mutation: each key is re-looked-up at use, never held as
    /// a live iterator across a mutation.
    pub fn map_keys_starting_at(&self, start: RemotePtr<Void>) -> Vec<MemoryRange> {
        self.mem
            .range((
                Included(MemoryRangeKey(MemoryRange::from_range(start, start))),
                Unbounded,
            ))
            .map(|(k, _)| *k.range())
            .collect()
    }

    /// Iterate mappings in address order.
    pub fn maps(&self) -> impl Iterator<Item = (&MemoryRangeKey, &Mapping)> {
        self.mem.iter()
    }

    pub fn maps_in_range<'a>(
        &'a self,
        range: MemoryRange,
    ) -> impl Iterator<Item = (&'a MemoryRangeKey, &'a Mapping)> {
        self.mem
            .range((
                Included(MemoryRangeKey(MemoryRange::from_range(
                    range.start(),
                    range.start(),
                ))),
                Unbounded,
            ))
            .take_while(move |(k, _)| k.range().start() < range.end())
    }

    /// Record a new mapping. Overlapping parts of existing mappings are
    /// dropped first (mmap with MAP_FIXED semantics), then adjacent
    /// compatible mappings are coalesced.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &mut self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset_bytes: u64,
        fsname: &OsStr,
        device: dev_t,
        inode: ino_t,
        recorded_map: Option<KernelMapping>,
        emu_file: Option<EmuFileId>,
    ) -> KernelMapping {
        let num_bytes = crate::util::ceil_page_size(num_bytes);
        let km = KernelMapping::new(
            addr,
            addr.byte_add(num_bytes),
            fsname,
            device,
            inode,
            prot,
            flags,
            offset_bytes,
        );
        self.unmap_internal(addr, num_bytes);
        let recorded = recorded_map.unwrap_or_else(|| km.clone());
        let mut mapping = Mapping::new(km.clone(), recorded);
        mapping.emu_file = emu_file;
        self.mem.insert(MemoryRangeKey(km.range()), mapping);
        self.coalesce_around(km.range());
        km
    }

    pub fn set_mapping_flags(&mut self, addr: RemotePtr<Void>, flags: MappingFlags) {
        if let Some(m) = self.mapping_of_mut(addr) {
            m.flags |= flags;
        }
    }

    /// Remove `[addr, addr+num_bytes)` from the map, splitting mappings
    /// that straddle the edges.
    pub fn unmap(&mut self, addr: RemotePtr<Void>, num_bytes: usize) {
        let num_bytes = crate::util::ceil_page_size(num_bytes);
        if num_bytes == 0 {
            return;
        }
        self.remove_breakpoints_and_watchpoints_in(MemoryRange::new_range(addr, num_bytes));
        self.unmap_internal(addr, num_bytes);
    }

    fn unmap_internal(&mut self, addr: RemotePtr<Void>, num_bytes: usize) {
        let unmap_range = MemoryRange::new_range(addr, num_bytes);
        for key in self.map_keys_starting_at(RemotePtr::null()) {
            if !key.intersects(&unmap_range) {
                continue;
            }
            let mapping = self.mem.remove(&MemoryRangeKey(key)).unwrap();
            // Keep the parts outside the unmapped window.
            if key.start() < unmap_range.start() {
                let left = mapping
                    .map
                    .subrange(key.start(), unmap_range.start());
                let left_recorded = mapping
                    .recorded_map
                    .subrange(key.start(), unmap_range.start());
                let mut m = Mapping::new(left.clone(), left_recorded);
                m.emu_file = mapping.emu_file;
                m.mapped_file_stat = mapping.mapped_file_stat;
                m.flags = mapping.flags;
                self.mem.insert(MemoryRangeKey(left.range()), m);
            }
            if unmap_range.end() < key.end() {
                let right = mapping.map.subrange(unmap_range.end(), key.end());
                let right_recorded =
                    mapping.recorded_map.subrange(unmap_range.end(), key.end());
                let mut m = Mapping::new(right.clone(), right_recorded);
                m.emu_file = mapping.emu_file;
                m.mapped_file_stat = mapping.mapped_file_stat;
                m.flags = mapping.flags;
                self.mem.insert(MemoryRangeKey(right.range()), m);
            }
        }
    }

    /// Change protections over `[addr, addr+num_bytes)`, splitting at the
    /// edges as the kernel does.
    pub fn protect(&mut self, addr: RemotePtr<Void>, num_bytes: usize, prot: ProtFlags) {
        let num_bytes = crate::util::ceil_page_size(num_bytes);
        let protect_range = MemoryRange::new_range(addr, num_bytes);
        for key in self.map_keys_starting_at(RemotePtr::null()) {
            if !key.intersects(&protect_range) {
                continue;
            }
            let mapping = self.mem.remove(&MemoryRangeKey(key)).unwrap();
            let overlap = key.intersect(&protect_range);

            let mut reinsert = |km: KernelMapping, rec: KernelMapping, proto: &Mapping| {
                let mut m = Mapping::new(km.clone(), rec);
                m.emu_file = proto.emu_file;
                m.mapped_file_stat = proto.mapped_file_stat;
                m.flags = proto.flags;
                self.mem.insert(MemoryRangeKey(km.range()), m);
            };

            if key.start() < overlap.start() {
                reinsert(
                    mapping.map.subrange(key.start(), overlap.start()),
                    mapping.recorded_map.subrange(key.start(), overlap.start()),
                    &mapping,
                );
            }
            reinsert(
                mapping
                    .map
                    .subrange(overlap.start(), overlap.end())
                    .set_prot(prot),
                mapping
                    .recorded_map
                    .subrange(overlap.start(), overlap.end())
                    .set_prot(prot),
                &mapping,
            );
            if overlap.end() < key.end() {
                reinsert(
                    mapping.map.subrange(overlap.end(), key.end()),
                    mapping.recorded_map.subrange(overlap.end(), key.end()),
                    &mapping,
                );
            }
        }
        self.coalesce_around(protect_range);
    }

    /// Track an mremap. The old range's mapping (and any watchpoint saved
    /// values inside it) move to the new range.
    pub fn remap(
        &mut self,
        old_addr: RemotePtr<Void>,
        old_num_bytes: usize,
        new_addr: RemotePtr<Void>,
        new_num_bytes: usize,
    ) {
        let old_num_bytes = crate::util::ceil_page_size(old_num_bytes);
        let new_num_bytes = crate::util::ceil_page_size(new_num_bytes);
        let mapping = match self.mapping_of(old_addr) {
            Some(m) => m.clone(),
            None => {
                fatal!("mremap of unmapped address {}", old_addr);
            }
        };
        self.unmap_internal(old_addr, old_num_bytes);
        if new_addr != old_addr || new_num_bytes != old_num_bytes {
            self.unmap_internal(new_addr, new_num_bytes);
        }
        let new_end = new_addr.byte_add(new_num_bytes);
        let km = mapping.map.set_range(new_addr, new_end);
        let recorded = mapping.recorded_map.set_range(new_addr, new_end);
        let mut m = Mapping::new(km.clone(), recorded);
        m.emu_file = mapping.emu_file;
        m.mapped_file_stat = mapping.mapped_file_stat;
        m.flags = mapping.flags;
        self.mem.insert(MemoryRangeKey(km.range()), m);
    }

    /// Track a brk() outcome.
    pub fn brk(&mut self, addr: RemotePtr<Void>, prot: ProtFlags) {
        let old_brk = crate::util::ceil_page_size(self.brk_end.as_usize());
        let new_brk = crate::util::ceil_page_size(addr.as_usize());
        if old_brk < new_brk {
            self.map(
                RemotePtr::from_val(old_brk),
                new_brk - old_brk,
                prot,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
                0,
                OsStr::new("[heap]"),
                KernelMapping::NO_DEVICE,
                KernelMapping::NO_INODE,
                None,
                None,
            );
        } else if new_brk < old_brk {
            self.unmap(RemotePtr::from_val(new_brk), old_brk - new_brk);
        }
        self.brk_end = addr;
    }

    pub fn track_shm(&mut self, addr: RemotePtr<Void>, num_bytes: usize) {
        self.shm_sizes.insert(addr, num_bytes);
    }

    pub fn shm_size_at(&self, addr: RemotePtr<Void>) -> Option<usize> {
        self.shm_sizes.get(&addr).copied()
    }

    pub fn track_dont_fork(&mut self, range: MemoryRange) {
        self.dont_fork.push(range);
    }

    fn coalesce_around(&mut self, range: MemoryRange) {
        // Look one mapping left of the range and sweep right, merging
        // adjacent entries that continue each other. Flags must agree too:
        // special-purpose mappings never merge with ordinary ones.
        let start_key = match self
            .mem
            .range((
                Unbounded,
                Included(MemoryRangeKey(MemoryRange::from_range(
                    range.start(),
                    range.start(),
                ))),
            ))
            .next_back()
        {
            Some((k, _)) => *k.range(),
            None => match self.map_keys_starting_at(range.start()).first() {
                Some(k) => *k,
                None => return,
            },
        };

        let mut current = start_key;
        loop {
            let next_key = match self
                .mem
                .range((
                    Included(MemoryRangeKey(MemoryRange::from_range(
                        current.end(),
                        current.end(),
                    ))),
                    Unbounded,
                ))
                .next()
            {
                Some((k, _)) => *k.range(),
                None => break,
            };
            if next_key.start() > range.end() {
                break;
            }
            let can_merge = {
                let cur = &self.mem[&MemoryRangeKey(current)];
                let next = &self.mem[&MemoryRangeKey(next_key)];
                cur.flags == next.flags
                    && cur.emu_file == next.emu_file
                    && next.map.is_adjacent_continuation_of(&cur.map)
            };
            if can_merge {
                let next = self.mem.remove(&MemoryRangeKey(next_key)).unwrap();
                let cur = self.mem.remove(&MemoryRangeKey(current)).unwrap();
                let merged_km = cur.map.extend(next.map.end());
                let merged_rec = cur.recorded_map.extend(next.recorded_map.end());
                let mut m = Mapping::new(merged_km.clone(), merged_rec);
                m.emu_file = cur.emu_file;
                m.mapped_file_stat = cur.mapped_file_stat;
                m.flags = cur.flags;
                self.mem.insert(MemoryRangeKey(merged_km.range()), m);
                current = merged_km.range();
            } else {
                current = next_key;
            }
        }
    }

    /// Assert our map equals the kernel's for `t`, modulo coalescing. Any
    /// difference is a tracking bug and fatal.
    pub fn verify(&self, t: &Task) {
        let ours = Self::coalesced_view(
            self.mem
                .values()
                .map(|m| m.map.clone())
                .collect::<Vec<_>>(),
        );
        let kernels = Self::coalesced_view(KernelMapIterator::new(t.tid).collect::<Vec<_>>());
        if ours.len() != kernels.len() {
            self.dump_mismatch(&ours, &kernels);
        }
        for (a, b) in ours.iter().zip(kernels.iter()) {
            let same = a.start() == b.start()
                && a.end() == b.end()
                && a.prot() == b.prot()
                && (a.flags() & KernelMapping::CHECKABLE_FLAGS_MASK)
                    == (b.flags() & KernelMapping::CHECKABLE_FLAGS_MASK);
            if !same {
                self.dump_mismatch(&ours, &kernels);
            }
        }
    }

    fn coalesced_view(mut v: Vec<KernelMapping>) -> Vec<KernelMapping> {
        v.sort_by_key(|km| km.start());
        let mut out: Vec<KernelMapping> = Vec::new();
        for km in v {
            match out.last() {
                Some(prev)
                    if km.is_adjacent_continuation_of(prev)
                        || (prev.end() == km.start()
                            && prev.prot() == km.prot()
                            && (prev.flags() & KernelMapping::CHECKABLE_FLAGS_MASK)
                                == (km.flags() & KernelMapping::CHECKABLE_FLAGS_MASK)
                            && prev.fsname() == km.fsname()) =>
                {
                    let merged = out.pop().unwrap().extend(km.end());
                    out.push(merged);
                }
                _ => out.push(km),
            }
        }
        out
    }

    fn dump_mismatch(&self, ours: &[KernelMapping], kernels: &[KernelMapping]) -> ! {
        log!(crate::log::LogError, "Cached address space:");
        for m in ours {
            log!(crate::log::LogError, "  {}", m);
        }
        log!(crate::log::LogError, "Kernel address space:");
        for m in kernels {
            log!(crate::log::LogError, "  {}", m);
        }
        fatal!("Address space mismatch for tid leader {}", self.leader_tid);
    }

    // --- stub page / syscall instruction registry ---

    pub fn stub_page_mapped(&self) -> bool {
        self.stub_page_mapped
    }

    pub fn set_stub_page_mapped(&mut self) {
        self.stub_page_mapped = true;
    }

    /// IP of the traced syscall instruction in the stub page.
    pub fn traced_syscall_ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::from_val(STUB_SYSCALL_TRACED)
    }

    pub fn privileged_traced_syscall_ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::from_val(STUB_SYSCALL_PRIVILEGED_TRACED)
    }

    pub fn untraced_syscall_ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::from_val(STUB_SYSCALL_UNTRACED)
    }

    pub fn untraced_replay_syscall_ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::from_val(STUB_SYSCALL_UNTRACED_REPLAY_ONLY)
    }

    pub fn privileged_untraced_syscall_ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::from_val(STUB_SYSCALL_PRIVILEGED_UNTRACED)
    }

    /// IP just after a syscall instruction recognised by the tracer.
    pub fn is_traced_syscall_ip(&self, ip: RemoteCodePtr) -> bool {
        let insn_end = crate::preload_interface::STUB_PAGE_SYSCALL_INSTRUCTION_END;
        ip == self.traced_syscall_ip().advance_past_syscall(insn_end)
            || ip == self
                .privileged_traced_syscall_ip()
                .advance_past_syscall(insn_end)
    }

    pub fn is_untraced_syscall_ip(&self, ip: RemoteCodePtr) -> bool {
        let insn_end = crate::preload_interface::STUB_PAGE_SYSCALL_INSTRUCTION_END;
        ip == self.untraced_syscall_ip().advance_past_syscall(insn_end)
            || ip == self
                .untraced_replay_syscall_ip()
                .advance_past_syscall(insn_end)
            || ip == RemoteCodePtr::from_val(STUB_SYSCALL_PRIVILEGED_UNTRACED)
                .advance_past_syscall(insn_end)
    }

    /// Find a syscall instruction usable for remote syscalls: the stub page
    /// if present, else a scan of the vdso.
    pub fn find_syscall_instruction(&self, t: &mut Task) -> RemoteCodePtr {
        if self.stub_page_mapped {
            return self.traced_syscall_ip();
        }
        if !self.vdso_start.is_null() {
            if let Some(m) = self.mapping_of(self.vdso_start) {
                let len = m.map.size();
                let bytes = t.read_mem_vec(self.vdso_start, len);
                let insn = syscall_instruction(t.arch());
                if let Some(offset) = crate::util::find_bytes(&bytes, insn) {
                    return RemoteCodePtr::from_val(self.vdso_start.as_usize() + offset);
                }
            }
        }
        fatal!(
            "No syscall instruction found for remote syscalls in {:?}",
            self.exe
        );
    }

    // --- breakpoints ---

    pub fn add_breakpoint(&mut self, t: &mut Task, addr: RemoteCodePtr, kind: BreakpointType) -> bool {
        debug_assert!(kind != BreakpointType::None);
        if let Some(bp) = self.breakpoints.get_mut(&addr) {
            bp.ref_count(kind, 1);
            return true;
        }
        let mut overwritten = [0u8; BREAKPOINT_INSN_LEN];
        if t
            .read_bytes_fallible(addr.to_data_ptr(), &mut overwritten)
            .map(|n| n == BREAKPOINT_INSN_LEN)
            != Ok(true)
        {
            return false;
        }
        if t
            .write_bytes_fallible(addr.to_data_ptr(), &[BREAKPOINT_INSN])
            .map(|n| n == BREAKPOINT_INSN_LEN)
            != Ok(true)
        {
            return false;
        }
        let mut bp = Breakpoint {
            internal_count: 0,
            user_count: 0,
            overwritten_data: overwritten[0],
        };
        bp.ref_count(kind, 1);
        self.breakpoints.insert(addr, bp);
        true
    }

    /// Drop one reference of `kind`. Memory is rewritten only when the last
    /// reference of either kind goes away; removal of an absent breakpoint
    /// is a no-op.
    pub fn remove_breakpoint(&mut self, t: &mut Task, addr: RemoteCodePtr, kind: BreakpointType) {
        let last = match self.breakpoints.get_mut(&addr) {
            Some(bp) => {
                bp.ref_count(kind, -1);
                bp.total() == 0
            }
            None => return,
        };
        if last {
            let bp = self.breakpoints.remove(&addr).unwrap();
            let _ = t.write_bytes_fallible(addr.to_data_ptr(), &[bp.overwritten_data]);
        }
    }

    pub fn remove_all_breakpoints(&mut self, t: &mut Task) {
        let addrs: Vec<RemoteCodePtr> = self.breakpoints.keys().copied().collect();
        for addr in addrs {
            let bp = self.breakpoints.remove(&addr).unwrap();
            let _ = t.write_bytes_fallible(addr.to_data_ptr(), &[bp.overwritten_data]);
        }
    }

    pub fn get_breakpoint_type_at_addr(&self, addr: RemoteCodePtr) -> BreakpointType {
        self.breakpoints
            .get(&addr)
            .map(|bp| bp.bp_type())
            .unwrap_or(BreakpointType::None)
    }

    /// If a SIGTRAP retired at `ip`, was it one of ours?
    pub fn get_breakpoint_type_for_retired_insn(&self, ip: RemoteCodePtr) -> BreakpointType {
        self.get_breakpoint_type_at_addr(ip.undo_executed_breakpoint())
    }

    /// Rewrite `buf` (read from tracee addresses starting at `addr`) so
    /// installed breakpoint opcodes read as the original bytes. What the
    /// debugger and checksum logic see must match what the tracee would
    /// read through a load.
    pub fn replace_breakpoints_with_original_values(
        &self,
        buf: &mut [u8],
        addr: RemotePtr<Void>,
    ) {
        let range = MemoryRange::new_range(addr, buf.len());
        for (bp_addr, bp) in self.breakpoints.iter() {
            let p: RemotePtr<Void> = bp_addr.to_data_ptr();
            if range.contains_ptr(p) {
                buf[p.as_usize() - addr.as_usize()] = bp.overwritten_data;
            }
        }
    }

    fn remove_breakpoints_and_watchpoints_in(&mut self, range: MemoryRange) {
        self.breakpoints.retain(|addr, _| {
            !range.contains_ptr(addr.to_data_ptr())
        });
        self.watchpoints.retain(|r, _| !range.intersects(r));
    }

    // --- watchpoints ---

    pub fn add_watchpoint(
        &mut self,
        t: &mut Task,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        kind: WatchType,
    ) -> bool {
        let range = MemoryRange::new_range(addr, num_bytes);
        if !self.watchpoints.contains_key(&range) {
            let mut wp = Watchpoint::new(num_bytes);
            wp.valid = t
                .read_bytes_fallible(addr, &mut wp.value_bytes)
                .map(|n| n == num_bytes)
                == Ok(true);
            self.watchpoints.insert(range, wp);
        }
        self.watchpoints.get_mut(&range).unwrap().ref_count(kind, 1);
        true
    }

    pub fn remove_watchpoint(&mut self, addr: RemotePtr<Void>, num_bytes: usize, kind: WatchType) {
        let range = MemoryRange::new_range(addr, num_bytes);
        let empty = match self.watchpoints.get_mut(&range) {
            Some(wp) => {
                wp.ref_count(kind, -1);
                wp.total() == 0
            }
            None => return,
        };
        if empty {
            self.watchpoints.remove(&range);
        }
    }

    pub fn remove_all_watchpoints(&mut self) {
        self.watchpoints.clear();
    }

    /// Push the current watchpoint set and start a fresh one. A diversion
    /// session mirrors the timeline's watchpoints and must be able to give
    /// them back untouched.
    pub fn save_watchpoints(&mut self) {
        self.saved_watchpoints.push(self.watchpoints.clone());
    }

    pub fn restore_watchpoints(&mut self) {
        if let Some(saved) = self.saved_watchpoints.pop() {
            self.watchpoints = saved;
        }
    }

    /// The debug-register programs covering all live watchpoints. Ranges
    /// are split into aligned 1/2/4/8-byte chunks the hardware can express;
    /// the caller decides whether there are few enough to schedule.
    pub fn get_watch_configs(&self) -> Vec<WatchConfig> {
        let mut configs = Vec::new();
        for (range, wp) in self.watchpoints.iter() {
            let kind = match wp.watched_type() {
                Some(k) => k,
                None => continue,
            };
            if kind == WatchType::Exec {
                // Exec watchpoints are a precise address, length 1.
                configs.push(WatchConfig::new(range.start(), 1, kind));
                continue;
            }
            let mut addr = range.start().as_usize();
            let end = range.end().as_usize();
            while addr < end {
                let mut size = 8;
                while size > 1 && (addr % size != 0 || addr + size > end) {
                    size /= 2;
                }
                configs.push(WatchConfig::new(RemotePtr::from_val(addr), size, kind));
                addr += size;
            }
        }
        configs
    }

    /// Called after a stop whose debug-status register reported a
    /// watchpoint, and after single-steps. Hardware is trusted for
    /// READ/EXEC hits; WRITE watchpoints are re-checked by comparing saved
    /// values, because on some hypervisors the debug-status register fails
    /// to report hits during single-step.
    pub fn notify_watchpoint_fired(&mut self, t: &mut Task, debug_status: usize) -> bool {
        let hw_hit = (debug_status & DS_WATCHPOINT_ANY) != 0;
        let single_stepped = (debug_status & DS_SINGLESTEP) != 0;
        let mut any = false;
        for (range, wp) in self.watchpoints.iter_mut() {
            if wp.write_count > 0 {
                let mut current = vec![0u8; wp.value_bytes.len()];
                let read_ok = t
                    .read_bytes_fallible(range.start(), &mut current)
                    .map(|n| n == current.len())
                    == Ok(true);
                if read_ok && wp.valid && current != wp.value_bytes {
                    wp.changed = true;
                    wp.value_bytes = current;
                    any = true;
                    continue;
                }
            }
            if (wp.read_count > 0 || wp.exec_count > 0) && hw_hit && !single_stepped {
                wp.changed = true;
                any = true;
            }
        }
        any || hw_hit
    }

    /// Re-snapshot watched values after the tracer itself wrote tracee
    /// memory, so the write doesn't read as a tracee-caused change.
    pub fn notify_written(&mut self, t: &mut Task, addr: RemotePtr<Void>, num_bytes: usize) {
        let written = MemoryRange::new_range(addr, num_bytes);
        for (range, wp) in self.watchpoints.iter_mut() {
            if range.intersects(&written) {
                let mut current = vec![0u8; wp.value_bytes.len()];
                if t
                    .read_bytes_fallible(range.start(), &mut current)
                    .map(|n| n == current.len())
                    == Ok(true)
                {
                    wp.value_bytes = current;
                    wp.valid = true;
                }
            }
        }
    }

    /// Drain the changed flags, returning the configs that fired.
    pub fn consume_watchpoint_changes(&mut self) -> Vec<WatchConfig> {
        let mut fired = Vec::new();
        for (range, wp) in self.watchpoints.iter_mut() {
            if wp.changed {
                wp.changed = false;
                let kind = wp.watched_type().unwrap_or(WatchType::Write);
                fired.push(WatchConfig::new(range.start(), range.size(), kind));
            }
        }
        fired
    }

    pub fn has_any_watchpoint_changes(&self) -> bool {
        self.watchpoints.values().any(|wp| wp.changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::page_size;

    fn make_vm() -> AddressSpace {
        AddressSpace::new_for_replay(100, 1, 0, OsStr::new("/bin/test"))
    }

    fn p(n: usize) -> RemotePtr<Void> {
        RemotePtr::from_val(n * page_size())
    }

    fn map_anon(vm: &mut AddressSpace, page: usize, pages: usize, prot: ProtFlags) {
        vm.map(
            p(page),
            pages * page_size(),
            prot,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            0,
            OsStr::new(""),
            KernelMapping::NO_DEVICE,
            KernelMapping::NO_INODE,
            None,
            None,
        );
    }

    #[test]
    fn map_and_lookup() {
        let mut vm = make_vm();
        map_anon(&mut vm, 10, 2, ProtFlags::PROT_READ);
        assert!(vm.has_mapping(p(10)));
        assert!(vm.has_mapping(RemotePtr::from_val(12 * page_size() - 1)));
        assert!(!vm.has_mapping(p(12)));
        let m = vm.mapping_of(p(11)).unwrap();
        assert_eq!(m.map.start(), p(10));
        assert_eq!(m.map.size(), 2 * page_size());
    }

    #[test]
    fn adjacent_identical_mappings_coalesce() {
        let mut vm = make_vm();
        map_anon(&mut vm, 10, 1, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        map_anon(&mut vm, 11, 1, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        assert_eq!(vm.maps().count(), 1);
        let m = vm.mapping_of(p(10)).unwrap();
        assert_eq!(m.map.size(), 2 * page_size());
    }

    #[test]
    fn differing_prot_does_not_coalesce() {
        let mut vm = make_vm();
        map_anon(&mut vm, 10, 1, ProtFlags::PROT_READ);
        map_anon(&mut vm, 11, 1, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        assert_eq!(vm.maps().count(), 2);
    }

    #[test]
    fn unmap_splits_straddling_mapping() {
        let mut vm = make_vm();
        map_anon(&mut vm, 10, 4, ProtFlags::PROT_READ);
        vm.unmap(p(11), page_size());
        assert!(vm.has_mapping(p(10)));
        assert!(!vm.has_mapping(p(11)));
        assert!(vm.has_mapping(p(12)));
        assert_eq!(vm.maps().count(), 2);
        assert_eq!(vm.mapping_of(p(12)).unwrap().map.start(), p(12));
    }

    #[test]
    fn protect_splits_at_edges() {
        let mut vm = make_vm();
        map_anon(&mut vm, 10, 4, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        vm.protect(p(11), 2 * page_size(), ProtFlags::PROT_READ);
        assert_eq!(vm.maps().count(), 3);
        assert_eq!(
            vm.mapping_of(p(11)).unwrap().map.prot(),
            ProtFlags::PROT_READ
        );
        assert_eq!(
            vm.mapping_of(p(10)).unwrap().map.prot(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        );
        assert_eq!(
            vm.mapping_of(p(13)).unwrap().map.prot(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        );
    }

    #[test]
    fn remap_moves_mapping() {
        let mut vm = make_vm();
        map_anon(&mut vm, 10, 1, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE);
        vm.remap(p(10), page_size(), p(20), 2 * page_size());
        assert!(!vm.has_mapping(p(10)));
        let m = vm.mapping_of(p(20)).unwrap();
        assert_eq!(m.map.size(), 2 * page_size());
    }

    #[test]
    fn watch_configs_split_to_hardware_sizes() {
        let mut vm = make_vm();
        // Bypass the task read by inserting directly.
        let range = MemoryRange::new_range(RemotePtr::from_val(0x1003), 6);
        let mut wp = Watchpoint::new(6);
        wp.ref_count(WatchType::Write, 1);
        vm.watchpoints.insert(range, wp);

        let configs = vm.get_watch_configs();
        // 0x1003..0x1009 must be covered by aligned chunks.
        let mut covered = Vec::new();
        for c in &configs {
            assert_eq!(c.kind, WatchType::Write);
            assert_eq!(c.addr.as_usize() % c.num_bytes, 0);
            for b in 0..c.num_bytes {
                covered.push(c.addr.as_usize() + b);
            }
        }
        covered.sort_unstable();
        assert_eq!(covered, (0x1003..0x1009).collect::<Vec<_>>());
    }

    #[test]
    fn breakpoint_type_precedence() {
        let vm = make_vm();
        assert_eq!(
            vm.get_breakpoint_type_at_addr(RemoteCodePtr::from_val(0x1000)),
            BreakpointType::None
        );
        let mut bp = Breakpoint {
            internal_count: 1,
            user_count: 0,
            overwritten_data: 0x90,
        };
        assert_eq!(bp.bp_type(), BreakpointType::Internal);
        bp.ref_count(BreakpointType::User, 1);
        assert_eq!(bp.bp_type(), BreakpointType::User);
        bp.ref_count(BreakpointType::User, -1);
        assert_eq!(bp.bp_type(), BreakpointType::Internal);
    }

    #[test]
    fn replace_breakpoints_restores_bytes() {
        let mut vm = make_vm();
        vm.breakpoints.insert(
            RemoteCodePtr::from_val(0x2004),
            Breakpoint {
                internal_count: 1,
                user_count: 0,
                overwritten_data: 0xAB,
            },
        );
        let mut buf = vec![0xCCu8; 8];
        vm.replace_breakpoints_with_original_values(&mut buf, RemotePtr::from_val(0x2000));
        assert_eq!(buf, vec![0xCC, 0xCC, 0xCC, 0xCC, 0xAB, 0xCC, 0xCC, 0xCC]);
        // Out-of-range breakpoints leave the buffer alone.
        let mut buf2 = vec![0xCCu8; 4];
        vm.replace_breakpoints_with_original_values(&mut buf2, RemotePtr::from_val(0x3000));
        assert_eq!(buf2, vec![0xCC; 4]);
    }

    #[test]
    fn save_restore_watchpoints() {
        let mut vm = make_vm();
        let range = MemoryRange::new_range(RemotePtr::from_val(0x1000), 8);
        let mut wp = Watchpoint::new(8);
        wp.ref_count(WatchType::Write, 1);
        vm.watchpoints.insert(range, wp);

        vm.save_watchpoints();
        vm.remove_all_watchpoints();
        assert!(vm.get_watch_configs().is_empty());
        vm.restore_watchpoints();
        assert_eq!(vm.get_watch_configs().len(), 1);
    }
}

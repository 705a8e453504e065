use crate::address_space::kernel_mapping::KernelMapping;
use crate::event::Event;
use crate::preload_interface::SYSCALLBUF_PROTOCOL_VERSION;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::trace::compressed_writer::{CompressedWriter, SyncFlag};
use crate::trace::frame::TraceFrame;
use crate::trace::stream::{
    substream_data, RecordEncoder, Substream, TraceStream, SUBSTREAMS, SUBSTREAM_COUNT,
    TRACE_VERSION,
};
use crate::trace::task_event::{TimedTaskEvent, TraceTaskEvent};
use libc::pid_t;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::ffi::{OsStr, OsString};
use std::fs::{hard_link, rename};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RecordInTrace {
    DontRecordInTrace,
    RecordInTrace,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum MappingOrigin {
    SyscallMapping,
    /// Memory moved from one place to another; contents need no recording.
    RemapMapping,
    ExecMapping,
    PatchMapping,
    EngineInternalMapping,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum CloseStatus {
    /// Trace completed normally and can be replayed.
    CloseOk,
    /// Trace completed abnormally; leave it uncommitted.
    CloseError,
}

/// Source tags stored with each mmaps record, telling replay where the
/// mapping's bytes come from.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum MappedDataSource {
    SourceTrace = 0,
    SourceFile = 1,
    SourceZero = 2,
}

/// Metadata checked against the backing file at replay; divergence warns.
#[derive(Copy, Clone, Default, Debug)]
pub struct BackingFileMetadata {
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub inode: u64,
}

impl BackingFileMetadata {
    pub fn from_stat(st: &libc::stat) -> BackingFileMetadata {
        BackingFileMetadata {
            size: st.st_size as u64,
            mtime: st.st_mtime,
            mode: st.st_mode,
            uid: st.st_uid,
            gid: st.st_gid,
            inode: st.st_ino,
        }
    }
}

/// Writes a trace directory: the five compressed substreams plus the
/// plain-text `version` and `args_env` files.
///
/// The trace directory moves through observable states: it is created
/// empty; `incomplete` is created and written; at a clean close
/// `incomplete` is renamed to `version`. A directory containing `version`
/// is a complete, replayable trace.
pub struct TraceWriter {
    stream: TraceStream,
    writers: Vec<CompressedWriter>,
    mmap_count: u32,
    supports_hardlinking: bool,
    version_fd: ScopedFd,
    good: bool,
}

impl TraceWriter {
    pub fn new(exe_path: &OsStr, bind_to_cpu: i32) -> TraceWriter {
        let mut stream = TraceStream::make_new(exe_path);
        stream.set_bound_cpu(bind_to_cpu);

        let mut writers = Vec::with_capacity(SUBSTREAM_COUNT);
        let mut good = true;
        for s in SUBSTREAMS.iter() {
            let data = substream_data(*s);
            let w = CompressedWriter::new(&stream.path(*s), data.block_size, data.threads);
            good = good && w.good();
            writers.push(w);
        }

        // `incomplete` holds the version payload until the close commits it.
        let version_fd = ScopedFd::open_path_with_mode(
            stream.incomplete_version_path().as_os_str(),
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        );
        if !version_fd.is_open() {
            fatal!(
                "Unable to create trace version file {:?}",
                stream.incomplete_version_path()
            );
        }
        let version_line = format!("{}\n{}\n", TRACE_VERSION, SYSCALLBUF_PROTOCOL_VERSION);
        crate::util::write_all(version_fd.as_raw(), version_line.as_bytes());

        TraceWriter {
            stream,
            writers,
            mmap_count: 0,
            supports_hardlinking: true,
            version_fd,
            good,
        }
    }

    pub fn good(&self) -> bool {
        self.good
    }

    pub fn dir(&self) -> &OsStr {
        self.stream.dir()
    }

    pub fn time(&self) -> u64 {
        self.stream.time()
    }

    pub fn bound_to_cpu(&self) -> i32 {
        self.stream.bound_to_cpu()
    }

    fn writer(&mut self, s: Substream) -> &mut CompressedWriter {
        &mut self.writers[s as usize]
    }

    fn put_record(&mut self, s: Substream, enc: RecordEncoder) {
        let framed = enc.into_framed();
        if self.writer(s).write_all(&framed).is_err() {
            self.good = false;
        }
    }

    /// Write the cwd/argv/envp/bound-cpu preamble. Must happen before the
    /// first frame; replay reads it to re-exec the initial task.
    pub fn write_args_env(&mut self, cwd: &OsStr, argv: &[OsString], envp: &[OsString]) {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(cwd.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&(argv.len() as u32).to_le_bytes());
        for a in argv {
            buf.extend_from_slice(&(a.as_bytes().len() as u32).to_le_bytes());
            buf.extend_from_slice(a.as_bytes());
        }
        buf.extend_from_slice(&(envp.len() as u32).to_le_bytes());
        for e in envp {
            buf.extend_from_slice(&(e.as_bytes().len() as u32).to_le_bytes());
            buf.extend_from_slice(e.as_bytes());
        }
        buf.extend_from_slice(&self.stream.bound_to_cpu().to_le_bytes());

        let fd = ScopedFd::open_path_with_mode(
            self.stream.args_env_path().as_os_str(),
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        );
        if !fd.is_open() {
            fatal!("Unable to create args_env file");
        }
        crate::util::write_all(fd.as_raw(), &buf);
    }

    /// Write one frame and advance the frame counter.
    pub fn write_frame(&mut self, frame: &TraceFrame) {
        let enc_event = frame.event().encode();
        let mut enc = RecordEncoder::new();
        enc.u64(frame.time())
            .i32(frame.tid())
            .u32(enc_event.to_u32())
            .u64(frame.ticks())
            .f64(frame.monotonic_time());
        if enc_event.has_exec_info {
            enc.u8(frame.regs_ref().arch() as u8);
            enc.bytes(frame.regs_ref().raw_bytes());
            enc.u8(frame.extra_regs_ref().format() as u8);
            enc.bytes(frame.extra_regs_ref().data());
        }
        if frame.event().is_signal_event() {
            enc.bytes(crate::util::u8_slice(&frame.event().signal().siginfo));
        }
        self.put_record(Substream::Events, enc);
        self.stream.tick_time();
    }

    /// Record a block of tracee memory: metadata to `data_header`, bytes to
    /// `data`. Zero-length writes are suppressed.
    pub fn write_raw(&mut self, rec_tid: pid_t, data: &[u8], addr: RemotePtr<Void>) {
        if data.is_empty() {
            return;
        }
        let time = self.stream.time();
        let mut enc = RecordEncoder::new();
        enc.u64(time)
            .i32(rec_tid)
            .u64(addr.as_usize() as u64)
            .u32(data.len() as u32);
        self.put_record(Substream::RawDataHeader, enc);
        if self.writer(Substream::RawData).write_all(data).is_err() {
            self.good = false;
        }
    }

    /// Record a mapping. Decides where replay will find the bytes:
    /// hardlinked backing file when possible, a trace copy otherwise, or
    /// nothing for zero/remap cases. The caller must follow up with
    /// `write_raw` of the contents iff this returns RecordInTrace.
    pub fn write_mapped_region(
        &mut self,
        km: &KernelMapping,
        meta: &BackingFileMetadata,
        origin: MappingOrigin,
    ) -> RecordInTrace {
        let (source, backing_name, record) = self.classify_mapping(km, origin);

        let mut enc = RecordEncoder::new();
        enc.u64(self.stream.time())
            .u8(source as u8)
            .u64(km.start().as_usize() as u64)
            .u64(km.end().as_usize() as u64)
            .os_str(km.fsname())
            .u64(km.device())
            .u64(km.inode())
            .u32(km.prot().bits() as u32)
            .u32(km.flags().bits() as u32)
            .u64(km.file_offset_bytes())
            .u64(meta.size)
            .i64(meta.mtime)
            .u32(meta.mode)
            .u32(meta.uid)
            .u32(meta.gid)
            .u64(meta.inode)
            .os_str(&backing_name);
        self.put_record(Substream::Mmaps, enc);
        self.mmap_count += 1;
        record
    }

    fn classify_mapping(
        &mut self,
        km: &KernelMapping,
        origin: MappingOrigin,
    ) -> (MappedDataSource, OsString, RecordInTrace) {
        if origin == MappingOrigin::RemapMapping {
            // Contents moved, not created; replay has them already.
            return (
                MappedDataSource::SourceZero,
                OsString::new(),
                RecordInTrace::DontRecordInTrace,
            );
        }
        if km.is_anonymous() && !km.is_shared() {
            return (
                MappedDataSource::SourceZero,
                OsString::new(),
                RecordInTrace::DontRecordInTrace,
            );
        }
        if km.is_real_device() && origin != MappingOrigin::PatchMapping {
            // Hardlink the backing file into the trace so deleting the
            // original later doesn't orphan the recording.
            if self.supports_hardlinking {
                let link_name = self.stream.hardlink_path(self.mmap_count, km.fsname());
                match hard_link(km.fsname(), &link_name) {
                    Ok(()) => {
                        return (
                            MappedDataSource::SourceFile,
                            link_name,
                            RecordInTrace::DontRecordInTrace,
                        )
                    }
                    Err(_) => {
                        // Cross-device or permission trouble; fall back to
                        // copying, and stop trying to hardlink.
                        self.supports_hardlinking = false;
                    }
                }
            }
        }
        (
            MappedDataSource::SourceTrace,
            OsString::new(),
            RecordInTrace::RecordInTrace,
        )
    }

    pub fn write_task_event(&mut self, event: &TimedTaskEvent) {
        let mut enc = RecordEncoder::new();
        enc.u64(event.time);
        match &event.event {
            TraceTaskEvent::Clone {
                tid,
                parent_tid,
                clone_flags,
            } => {
                enc.u8(0).i32(*tid).i32(*parent_tid).u64(*clone_flags);
            }
            TraceTaskEvent::Exec {
                tid,
                file_name,
                cmd_line,
            } => {
                enc.u8(1).i32(*tid).os_str(file_name);
                enc.u32(cmd_line.len() as u32);
                for arg in cmd_line {
                    enc.os_str(arg);
                }
            }
            TraceTaskEvent::Exit { tid, exit_status } => {
                enc.u8(2).i32(*tid).i32(*exit_status);
            }
        }
        self.put_record(Substream::Tasks, enc);
    }

    /// Flush the substreams and, on CloseOk, commit the trace by renaming
    /// `incomplete` to `version` and repointing `latest-trace`.
    pub fn close(&mut self, status: CloseStatus) {
        for w in self.writers.iter_mut() {
            w.close(SyncFlag::Sync);
            if !w.good() {
                self.good = false;
            }
        }
        if status == CloseStatus::CloseOk && self.good {
            if rename(
                self.stream.incomplete_version_path(),
                self.stream.version_path(),
            )
            .is_err()
            {
                fatal!("Unable to commit {:?}", self.stream.version_path());
            }
            self.stream.update_latest_trace_symlink();
        }
        self.version_fd.close();
    }
}

use crate::address_space::kernel_mapping::KernelMapping;
use crate::event::{EncodedEvent, Event};
use crate::extra_registers::{ExtraRegisters, Format};
use crate::kernel_abi::SupportedArch;
use crate::registers::Registers;
use crate::remote_ptr::{RemotePtr, Void};
use crate::trace::compressed_reader::CompressedReader;
use crate::trace::frame::{FrameTime, TraceFrame};
use crate::trace::stream::{
    resolve_trace_name, substream_data, RecordDecoder, Substream, TraceStream, SUBSTREAMS,
    SUBSTREAM_COUNT, TRACE_VERSION,
};
use crate::trace::task_event::{TimedTaskEvent, TraceTaskEvent};
use crate::trace::writer::{BackingFileMetadata, MappedDataSource};
use libc::pid_t;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};

/// Metadata needed to materialise one recorded mapping during replay.
#[derive(Clone, Debug)]
pub struct MappedData {
    pub time: FrameTime,
    pub source: MappedDataSource,
    /// For SourceFile: the (hardlinked) file to map.
    pub file_name: OsString,
    pub backing_meta: BackingFileMetadata,
}

/// One record from the raw-data substreams.
#[derive(Clone, Debug)]
pub struct RawDataRecord {
    pub time: FrameTime,
    pub rec_tid: pid_t,
    pub addr: RemotePtr<Void>,
    pub data: Vec<u8>,
}

/// Reads a trace directory. Reading is strictly sequential per substream
/// with one-record lookahead via the compressed readers' save/restore.
pub struct TraceReader {
    stream: TraceStream,
    readers: Vec<CompressedReader>,
    cwd: OsString,
    argv: Vec<OsString>,
    envp: Vec<OsString>,
    /// Raw-data metadata parsed ahead of its consumption; keyed off frame
    /// times.
    pending_raw: Option<RawDataRecord>,
}

impl TraceReader {
    /// Open a trace for reading. Fatal (with a user-actionable message) on
    /// a missing directory or a version mismatch.
    pub fn new(maybe_dir: Option<&OsStr>) -> TraceReader {
        let dir = resolve_trace_name(maybe_dir);
        let resolved = fs::canonicalize(&dir)
            .map(|p| p.into_os_string())
            .unwrap_or(dir);
        let stream = TraceStream::new(resolved, 1);

        Self::check_version(&stream);

        let mut readers = Vec::with_capacity(SUBSTREAM_COUNT);
        for s in SUBSTREAMS.iter() {
            let r = CompressedReader::new(&stream.path(*s));
            if !r.good() {
                clean_fatal!(
                    "Trace file {:?} is missing or unreadable; the recording did not complete.",
                    stream.path(*s)
                );
            }
            readers.push(r);
        }

        let mut reader = TraceReader {
            stream,
            readers,
            cwd: OsString::new(),
            argv: Vec::new(),
            envp: Vec::new(),
            pending_raw: None,
        };
        reader.read_args_env();
        reader
    }

    fn check_version(stream: &TraceStream) {
        let path = stream.version_path();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => clean_fatal!(
                "`{:?}' is not a valid trace (no version file). \
                 If the recording crashed, the file `incomplete' will be present instead.",
                stream.dir()
            ),
        };
        let mut lines = content.lines();
        let version: u32 = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .unwrap_or(0);
        if version != TRACE_VERSION {
            clean_fatal!(
                "Trace version mismatch in {:?}: found {}, expected {}. \
                 Traces are only replayable by the engine version that recorded them.",
                path,
                version,
                TRACE_VERSION
            );
        }
    }

    fn read_args_env(&mut self) {
        let bytes = match fs::read(self.stream.args_env_path()) {
            Ok(b) => b,
            Err(_) => clean_fatal!("Trace {:?} has no args_env file.", self.stream.dir()),
        };
        let nul = bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(bytes.len());
        self.cwd = OsString::from_vec(bytes[..nul].to_vec());

        let mut pos = nul + 1;
        let mut take_u32 = |pos: &mut usize| -> u32 {
            if *pos + 4 > bytes.len() {
                return 0;
            }
            let v = u32::from_le_bytes([
                bytes[*pos],
                bytes[*pos + 1],
                bytes[*pos + 2],
                bytes[*pos + 3],
            ]);
            *pos += 4;
            v
        };
        let argc = take_u32(&mut pos);
        for _ in 0..argc {
            let len = take_u32(&mut pos) as usize;
            self.argv
                .push(OsString::from_vec(bytes[pos..pos + len].to_vec()));
            pos += len;
        }
        let envc = take_u32(&mut pos);
        for _ in 0..envc {
            let len = take_u32(&mut pos) as usize;
            self.envp
                .push(OsString::from_vec(bytes[pos..pos + len].to_vec()));
            pos += len;
        }
        if pos + 4 <= bytes.len() {
            let cpu = i32::from_le_bytes([
                bytes[pos],
                bytes[pos + 1],
                bytes[pos + 2],
                bytes[pos + 3],
            ]);
            self.stream.set_bound_cpu(cpu);
        }
    }

    pub fn dir(&self) -> &OsStr {
        self.stream.dir()
    }
    pub fn cwd(&self) -> &OsStr {
        &self.cwd
    }
    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }
    pub fn envp(&self) -> &[OsString] {
        &self.envp
    }
    pub fn bound_to_cpu(&self) -> i32 {
        self.stream.bound_to_cpu()
    }

    /// Time of the next frame to be read.
    pub fn time(&self) -> FrameTime {
        self.stream.time()
    }

    fn reader(&mut self, s: Substream) -> &mut CompressedReader {
        &mut self.readers[s as usize]
    }

    fn read_framed(&mut self, s: Substream) -> Option<Vec<u8>> {
        if self.reader(s).at_end() {
            return None;
        }
        let mut len_bytes = [0u8; 4];
        if !self.reader(s).read(&mut len_bytes) {
            return None;
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        if !self.reader(s).read(&mut payload) {
            fatal!("Truncated record in substream {}", substream_data(s).name);
        }
        Some(payload)
    }

    pub fn at_end(&mut self) -> bool {
        self.reader(Substream::Events).at_end()
    }

    /// Read the next frame and advance the frame counter.
    pub fn read_frame(&mut self) -> Option<TraceFrame> {
        let payload = self.read_framed(Substream::Events)?;
        let mut dec = RecordDecoder::new(&payload);
        let time = dec.u64();
        let tid = dec.i32();
        let raw_event = dec.u32();
        let ticks = dec.u64();
        let monotonic = dec.f64();

        let enc_event = match EncodedEvent::from_u32(raw_event) {
            Some(e) => e,
            None => fatal!("Unknown event encoding {:#x} at frame {}", raw_event, time),
        };
        let mut event = Event::decode(enc_event);
        let mut frame = TraceFrame::new_with(time, tid, Event::Unassigned, ticks, monotonic);

        if enc_event.has_exec_info {
            let arch = if dec.u8() == SupportedArch::X64 as u8 {
                SupportedArch::X64
            } else {
                SupportedArch::X86
            };
            frame.set_regs(Registers::set_from_raw_bytes(arch, dec.bytes()));
            let format = dec.u8();
            let extra_bytes = dec.bytes();
            if format == Format::XSave as u8 {
                frame.set_extra_regs(ExtraRegisters::from_xsave(arch, extra_bytes.to_vec()));
            }
        }
        if event.is_signal_event() {
            let si_bytes = dec.bytes();
            if si_bytes.len() == std::mem::size_of::<libc::siginfo_t>() {
                let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
                crate::util::u8_slice_mut(&mut siginfo).copy_from_slice(si_bytes);
                match &mut event {
                    Event::Signal(d) | Event::SignalDelivery(d) | Event::SignalHandler(d) => {
                        d.siginfo = siginfo;
                    }
                    _ => unreachable!(),
                }
            }
        }
        frame.ev = event;
        self.stream.set_time(time + 1);
        Some(frame)
    }

    /// Look at the next frame without consuming it.
    pub fn peek_frame(&mut self) -> Option<TraceFrame> {
        let time_before = self.stream.time();
        self.reader(Substream::Events).save_state();
        let frame = self.read_frame();
        self.reader(Substream::Events).restore_state();
        self.stream.set_time(time_before);
        frame
    }

    /// The next raw-data record whose time is `time`, if any.
    pub fn read_raw_data_for_time(&mut self, time: FrameTime) -> Option<RawDataRecord> {
        if self.pending_raw.is_none() {
            self.pending_raw = self.parse_next_raw();
        }
        match &self.pending_raw {
            Some(r) if r.time == time => self.pending_raw.take(),
            _ => None,
        }
    }

    fn parse_next_raw(&mut self) -> Option<RawDataRecord> {
        let payload = self.read_framed(Substream::RawDataHeader)?;
        let mut dec = RecordDecoder::new(&payload);
        let time = dec.u64();
        let rec_tid = dec.i32();
        let addr = RemotePtr::from_val(dec.u64() as usize);
        let size = dec.u32() as usize;
        let mut data = vec![0u8; size];
        if !self.reader(Substream::RawData).read(&mut data) {
            fatal!("Raw data substream truncated ({} bytes wanted)", size);
        }
        Some(RawDataRecord {
            time,
            rec_tid,
            addr,
            data,
        })
    }

    /// The next recorded mapping, or None at end of substream.
    pub fn read_mapped_region(&mut self) -> Option<(KernelMapping, MappedData)> {
        let payload = self.read_framed(Substream::Mmaps)?;
        let mut dec = RecordDecoder::new(&payload);
        let time = dec.u64();
        let source = match dec.u8() {
            0 => MappedDataSource::SourceTrace,
            1 => MappedDataSource::SourceFile,
            _ => MappedDataSource::SourceZero,
        };
        let start = RemotePtr::from_val(dec.u64() as usize);
        let end = RemotePtr::from_val(dec.u64() as usize);
        let fsname = dec.os_string();
        let device = dec.u64();
        let inode = dec.u64();
        let prot = nix::sys::mman::ProtFlags::from_bits_truncate(dec.u32() as i32);
        let flags = nix::sys::mman::MapFlags::from_bits_truncate(dec.u32() as i32);
        let offset = dec.u64();
        let backing_meta = BackingFileMetadata {
            size: dec.u64(),
            mtime: dec.i64(),
            mode: dec.u32(),
            uid: dec.u32(),
            gid: dec.u32(),
            inode: dec.u64(),
        };
        let file_name = dec.os_string();

        let km = KernelMapping::new(start, end, &fsname, device, inode, prot, flags, offset);
        if source == MappedDataSource::SourceFile {
            Self::check_backing_file(&file_name, &backing_meta);
        }
        Some((
            km,
            MappedData {
                time,
                source,
                file_name,
                backing_meta,
            },
        ))
    }

    fn check_backing_file(file_name: &OsStr, meta: &BackingFileMetadata) {
        match nix::sys::stat::stat(file_name) {
            Ok(st) => {
                let now = BackingFileMetadata::from_stat(&st);
                if now.size != meta.size || now.mtime != meta.mtime || now.inode != meta.inode {
                    log!(
                        crate::log::LogWarn,
                        "Metadata of {:?} changed since recording (size {} vs {}, mtime {} vs {}); \
                         replay may diverge",
                        file_name,
                        now.size,
                        meta.size,
                        now.mtime,
                        meta.mtime
                    );
                }
            }
            Err(_) => {
                log!(
                    crate::log::LogWarn,
                    "Backing file {:?} has vanished; replay may diverge",
                    file_name
                );
            }
        }
    }

    pub fn read_task_event(&mut self) -> Option<TimedTaskEvent> {
        let payload = self.read_framed(Substream::Tasks)?;
        let mut dec = RecordDecoder::new(&payload);
        let time = dec.u64();
        let kind = dec.u8();
        let event = match kind {
            0 => TraceTaskEvent::Clone {
                tid: dec.i32(),
                parent_tid: dec.i32(),
                clone_flags: dec.u64(),
            },
            1 => {
                let tid = dec.i32();
                let file_name = dec.os_string();
                let argc = dec.u32() as usize;
                let mut cmd_line = Vec::with_capacity(argc);
                for _ in 0..argc {
                    cmd_line.push(dec.os_string());
                }
                TraceTaskEvent::Exec {
                    tid,
                    file_name,
                    cmd_line,
                }
            }
            2 => TraceTaskEvent::Exit {
                tid: dec.i32(),
                exit_status: dec.i32(),
            },
            other => fatal!("Unknown task event kind {}", other),
        };
        Some(TimedTaskEvent { time, event })
    }

    /// Restart reading from the first frame. The same sequence of records
    /// is returned again.
    pub fn rewind(&mut self) {
        for r in self.readers.iter_mut() {
            r.rewind();
        }
        self.pending_raw = None;
        self.stream.set_time(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, SyscallEventData, SyscallState};
    use crate::kernel_abi::SupportedArch;
    use crate::trace::writer::{CloseStatus, TraceWriter};
    use std::ffi::OsString;

    fn make_trace(dir: &std::path::Path) -> OsString {
        std::env::set_var("_RETRACE_TRACE_DIR", dir);
        let mut w = TraceWriter::new(OsStr::new("/bin/true"), -1);
        let trace_dir = w.dir().to_owned();
        w.write_args_env(
            OsStr::new("/tmp"),
            &[OsString::from("/bin/true")],
            &[OsString::from("HOME=/root")],
        );

        for time in 1..=5u64 {
            let mut data = SyscallEventData::new(0, SupportedArch::X64);
            data.state = if time % 2 == 1 {
                SyscallState::EnteringSyscall
            } else {
                SyscallState::ExitingSyscall
            };
            let mut frame =
                TraceFrame::new_with(time, 100, Event::Syscall(data), time * 1000, 0.5);
            let mut regs = Registers::new(SupportedArch::X64);
            regs.set_ip(crate::remote_code_ptr::RemoteCodePtr::from_val(
                0x7000_0000 + time as usize,
            ));
            frame.set_regs(regs);
            w.write_frame(&frame);
            w.write_raw(100, &[time as u8; 16], RemotePtr::from_val(0x1000));
        }
        w.close(CloseStatus::CloseOk);
        trace_dir
    }

    #[test]
    fn frame_round_trip_and_rewind() {
        let tmp = tempfile::tempdir().unwrap();
        let trace_dir = make_trace(tmp.path());

        let mut r = TraceReader::new(Some(&trace_dir));
        assert_eq!(r.argv(), &[OsString::from("/bin/true")]);
        assert_eq!(r.cwd(), OsStr::new("/tmp"));

        let mut seen = Vec::new();
        while let Some(frame) = r.read_frame() {
            assert_eq!(frame.tid(), 100);
            let raw = r.read_raw_data_for_time(frame.time()).unwrap();
            assert_eq!(raw.data, vec![frame.time() as u8; 16]);
            seen.push((frame.time(), frame.ticks(), frame.regs_ref().ip()));
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[4].1, 5000);

        // Re-reading after rewind gives the identical sequence.
        r.rewind();
        let mut again = Vec::new();
        while let Some(frame) = r.read_frame() {
            let _ = r.read_raw_data_for_time(frame.time());
            again.push((frame.time(), frame.ticks(), frame.regs_ref().ip()));
        }
        assert_eq!(seen, again);
    }

    #[test]
    fn peek_does_not_consume() {
        let tmp = tempfile::tempdir().unwrap();
        let trace_dir = make_trace(tmp.path());
        let mut r = TraceReader::new(Some(&trace_dir));
        let peeked = r.peek_frame().unwrap();
        let read = r.read_frame().unwrap();
        assert_eq!(peeked.time(), read.time());
        assert_eq!(peeked.ticks(), read.ticks());
        assert_eq!(r.read_frame().unwrap().time(), read.time() + 1);
    }
}

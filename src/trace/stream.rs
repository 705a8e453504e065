use crate::util::{KILO, MEGA};
use libc::pid_t;
use nix::sys::stat::{stat, Mode};
use nix::unistd::mkdir;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// Bump when the layout of any substream record changes. Replay refuses a
/// trace whose version file disagrees.
pub const TRACE_VERSION: u32 = 41;

/// The five substreams a trace directory holds. Update `substream_data` and
/// TRACE_VERSION together when this list changes.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(usize)]
pub enum Substream {
    /// Trace frames.
    Events = 0,
    /// Metadata for entries in `Data`: (time, addr, size, tid) tuples.
    RawDataHeader = 1,
    /// Recorded memory contents, headerless.
    RawData = 2,
    /// Metadata about files mmap'd during recording.
    Mmaps = 3,
    /// Task creation, exec and exit events.
    Tasks = 4,
}

pub const SUBSTREAM_COUNT: usize = 5;

pub const SUBSTREAMS: [Substream; SUBSTREAM_COUNT] = [
    Substream::Events,
    Substream::RawDataHeader,
    Substream::RawData,
    Substream::Mmaps,
    Substream::Tasks,
];

pub struct SubstreamData {
    pub name: &'static str,
    pub block_size: usize,
    pub threads: usize,
}

pub fn substream_data(s: Substream) -> &'static SubstreamData {
    const DATA: [SubstreamData; SUBSTREAM_COUNT] = [
        SubstreamData {
            name: "events",
            block_size: MEGA,
            threads: 1,
        },
        SubstreamData {
            name: "data_header",
            block_size: MEGA,
            threads: 1,
        },
        SubstreamData {
            name: "data",
            block_size: 8 * MEGA,
            threads: 3,
        },
        SubstreamData {
            name: "mmaps",
            block_size: 64 * KILO,
            threads: 1,
        },
        SubstreamData {
            name: "tasks",
            block_size: 64 * KILO,
            threads: 1,
        },
    ];
    &DATA[s as usize]
}

/// The root under which trace directories are created:
/// $_RETRACE_TRACE_DIR, else $XDG_DATA_HOME/retrace, else $HOME/.retrace,
/// else /tmp/retrace.
pub fn trace_save_dir() -> OsString {
    if let Some(dir) = env::var_os("_RETRACE_TRACE_DIR") {
        return dir;
    }
    if let Some(data_home) = env::var_os("XDG_DATA_HOME") {
        if !data_home.is_empty() {
            let mut dir = PathBuf::from(data_home);
            dir.push("retrace");
            return dir.into_os_string();
        }
    }
    if let Some(home) = env::var_os("HOME") {
        if !home.is_empty() {
            let mut dir = PathBuf::from(home);
            dir.push(".retrace");
            return dir.into_os_string();
        }
    }
    OsString::from("/tmp/retrace")
}

pub fn latest_trace_symlink() -> OsString {
    let mut p = PathBuf::from(trace_save_dir());
    p.push("latest-trace");
    p.into_os_string()
}

/// Resolve a trace-dir argument: an absolute/relative path is used as given;
/// an empty argument means the `latest-trace` symlink.
pub fn resolve_trace_name(maybe_name: Option<&OsStr>) -> OsString {
    match maybe_name {
        Some(name) if !name.is_empty() => {
            if name.as_bytes().contains(&b'/') || Path::new(name).exists() {
                name.to_owned()
            } else {
                let mut p = PathBuf::from(trace_save_dir());
                p.push(name);
                p.into_os_string()
            }
        }
        _ => latest_trace_symlink(),
    }
}

fn ensure_dir(dir: &Path) {
    if let Some(parent) = dir.parent() {
        if !parent.as_os_str().is_empty() && stat(parent).is_err() {
            ensure_dir(parent);
        }
    }
    let _ = mkdir(dir, Mode::S_IRWXU | Mode::S_IRWXG | Mode::S_IXOTH | Mode::S_IROTH);
    match stat(dir) {
        Ok(st) => {
            if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
                clean_fatal!("`{}' exists but isn't a directory.", dir.display());
            }
        }
        Err(_) => clean_fatal!("Can't create trace directory `{}'", dir.display()),
    }
}

/// Shared bookkeeping for readers and writers: the directory, per-substream
/// file paths, and the monotonic frame counter.
pub struct TraceStream {
    trace_dir: OsString,
    /// CPU the tracees were bound to while recording, or -1.
    bind_to_cpu: i32,
    /// Frame counter: the time of the next frame to be written/read.
    global_time: u64,
}

impl TraceStream {
    pub fn new(trace_dir: OsString, initial_time: u64) -> TraceStream {
        TraceStream {
            trace_dir,
            bind_to_cpu: -1,
            global_time: initial_time,
        }
    }

    pub fn dir(&self) -> &OsStr {
        &self.trace_dir
    }

    pub fn bound_to_cpu(&self) -> i32 {
        self.bind_to_cpu
    }

    pub fn set_bound_cpu(&mut self, bound: i32) {
        self.bind_to_cpu = bound;
    }

    pub fn time(&self) -> u64 {
        self.global_time
    }

    pub fn tick_time(&mut self) {
        self.global_time += 1;
    }

    pub(super) fn set_time(&mut self, time: u64) {
        self.global_time = time;
    }

    pub fn path(&self, s: Substream) -> OsString {
        let mut p = PathBuf::from(&self.trace_dir);
        p.push(substream_data(s).name);
        p.into_os_string()
    }

    pub fn version_path(&self) -> OsString {
        let mut p = PathBuf::from(&self.trace_dir);
        p.push("version");
        p.into_os_string()
    }

    /// While recording is in progress the version file is named
    /// `incomplete`; the rename to `version` commits the trace.
    pub fn incomplete_version_path(&self) -> OsString {
        let mut p = PathBuf::from(&self.trace_dir);
        p.push("incomplete");
        p.into_os_string()
    }

    pub fn args_env_path(&self) -> OsString {
        let mut p = PathBuf::from(&self.trace_dir);
        p.push("args_env");
        p.into_os_string()
    }

    pub fn hardlink_path(&self, mmap_count: u32, file_name: &OsStr) -> OsString {
        let base = Path::new(file_name)
            .file_name()
            .unwrap_or_else(|| OsStr::new("file"));
        let mut p = PathBuf::from(&self.trace_dir);
        p.push(format!(
            "mmap_{}_hardlink_{}",
            mmap_count,
            base.to_string_lossy()
        ));
        p.into_os_string()
    }

    /// Create a fresh trace directory `<exe-basename>-<nonce>` under the
    /// save root and return the stream for it.
    pub fn make_new(exe_path: &OsStr) -> TraceStream {
        let save_dir = PathBuf::from(trace_save_dir());
        ensure_dir(&save_dir);

        let base = Path::new(exe_path)
            .file_name()
            .unwrap_or_else(|| OsStr::new("trace"))
            .to_string_lossy()
            .into_owned();
        // Nonce by first-free probing; recordings on one machine are
        // serialized by the mkdir.
        let mut nonce = 0u32;
        loop {
            let mut dir = save_dir.clone();
            dir.push(format!("{}-{}", base, nonce));
            match mkdir(&dir, Mode::S_IRWXU | Mode::S_IRWXG) {
                Ok(()) => {
                    return TraceStream::new(dir.into_os_string(), 1);
                }
                Err(nix::Error::Sys(nix::errno::Errno::EEXIST)) => {
                    nonce += 1;
                }
                Err(e) => {
                    clean_fatal!("Cannot create trace dir `{}': {}", dir.display(), e);
                }
            }
            if nonce > 99_999 {
                clean_fatal!("Gave up probing for a free trace directory name");
            }
        }
    }

    /// Point the `latest-trace` symlink at this trace.
    pub fn update_latest_trace_symlink(&self) {
        let link = latest_trace_symlink();
        let _ = fs::remove_file(&link);
        if symlink(&self.trace_dir, &link).is_err() {
            log!(
                crate::log::LogWarn,
                "Failed to update latest-trace symlink `{}'",
                PathBuf::from(&link).display()
            );
        }
    }
}

/// A length-prefixed serialization buffer for substream records. All
/// multi-byte values are little-endian.
#[derive(Default)]
pub struct RecordEncoder {
    buf: Vec<u8>,
}

impl RecordEncoder {
    pub fn new() -> RecordEncoder {
        RecordEncoder { buf: Vec::new() }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn os_str(&mut self, v: &OsStr) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    /// The completed record: a u32 length prefix followed by the payload.
    pub fn into_framed(self) -> Vec<u8> {
        let mut framed = Vec::with_capacity(4 + self.buf.len());
        framed.extend_from_slice(&(self.buf.len() as u32).to_le_bytes());
        framed.extend_from_slice(&self.buf);
        framed
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len()
    }
}

/// Cursor over one framed record's payload.
pub struct RecordDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> RecordDecoder<'a> {
        RecordDecoder { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        if self.pos + n > self.buf.len() {
            fatal!(
                "Corrupt trace record: wanted {} bytes at offset {} of {}",
                n,
                self.pos,
                self.buf.len()
            );
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        s
    }

    pub fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    pub fn u16(&mut self) -> u16 {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2));
        u16::from_le_bytes(b)
    }

    pub fn u32(&mut self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4));
        u32::from_le_bytes(b)
    }

    pub fn i32(&mut self) -> i32 {
        self.u32() as i32
    }

    pub fn u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8));
        u64::from_le_bytes(b)
    }

    pub fn i64(&mut self) -> i64 {
        self.u64() as i64
    }

    pub fn f64(&mut self) -> f64 {
        f64::from_bits(self.u64())
    }

    pub fn bytes(&mut self) -> &'a [u8] {
        let len = self.u32() as usize;
        self.take(len)
    }

    pub fn os_string(&mut self) -> OsString {
        OsString::from_vec(self.bytes().to_vec())
    }

    pub fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}

pub fn tid_from(v: i32) -> pid_t {
    v as pid_t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_decoder_round_trip() {
        let mut enc = RecordEncoder::new();
        enc.u8(7)
            .u16(300)
            .u32(70_000)
            .i32(-5)
            .u64(1 << 40)
            .f64(1.5)
            .bytes(b"hello")
            .os_str(OsStr::new("/bin/true"));
        let framed = enc.into_framed();
        let len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len + 4, framed.len());

        let mut dec = RecordDecoder::new(&framed[4..]);
        assert_eq!(dec.u8(), 7);
        assert_eq!(dec.u16(), 300);
        assert_eq!(dec.u32(), 70_000);
        assert_eq!(dec.i32(), -5);
        assert_eq!(dec.u64(), 1 << 40);
        assert!((dec.f64() - 1.5).abs() < f64::EPSILON);
        assert_eq!(dec.bytes(), b"hello");
        assert_eq!(dec.os_string(), OsString::from("/bin/true"));
        assert!(dec.at_end());
    }

    #[test]
    fn substream_table_is_consistent() {
        assert_eq!(substream_data(Substream::Events).name, "events");
        assert_eq!(substream_data(Substream::RawData).threads, 3);
        for (i, s) in SUBSTREAMS.iter().enumerate() {
            assert_eq!(*s as usize, i);
        }
    }
}

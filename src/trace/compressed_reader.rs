use crate::scoped_fd::ScopedFd;
use crate::trace::compressed_writer::BlockHeader;
use brotli_sys::{BrotliDecoderDecompress, BROTLI_DECODER_RESULT_SUCCESS};
use nix::fcntl::OFlag;
use std::ffi::OsStr;
use std::mem::size_of;

/// Reads a stream written by CompressedWriter. Decompression happens on the
/// reading thread, one block ahead of the consumer.
///
/// The fd may be shared with a cloned reader, so the file position is
/// tracked here and all I/O uses pread.
pub struct CompressedReader {
    fd: ScopedFd,
    fd_offset: u64,
    error: bool,
    eof: bool,
    buffer: Vec<u8>,
    buffer_read_pos: usize,
    /// One pending save/restore slot; nested saves are a caller bug.
    have_saved_state: bool,
    have_saved_buffer: bool,
    saved_fd_offset: u64,
    saved_buffer: Vec<u8>,
    saved_buffer_read_pos: usize,
}

impl CompressedReader {
    pub fn new(filename: &OsStr) -> CompressedReader {
        let fd = ScopedFd::open_path(filename, OFlag::O_CLOEXEC | OFlag::O_RDONLY | OFlag::O_LARGEFILE);
        let error = !fd.is_open();
        CompressedReader {
            fd,
            fd_offset: 0,
            error,
            eof: false,
            buffer: Vec::new(),
            buffer_read_pos: 0,
            have_saved_state: false,
            have_saved_buffer: false,
            saved_fd_offset: 0,
            saved_buffer: Vec::new(),
            saved_buffer_read_pos: 0,
        }
    }

    pub fn good(&self) -> bool {
        !self.error
    }

    pub fn at_end(&mut self) -> bool {
        if self.buffer_read_pos < self.buffer.len() {
            return false;
        }
        // Nothing buffered: end only if the file has no further block.
        if !self.eof && !self.refill_buffer() {
            self.eof = true;
        }
        self.eof && self.buffer_read_pos == self.buffer.len()
    }

    /// Fill `data` completely. Returns false (and poisons the reader) on a
    /// truncated or corrupt stream.
    pub fn read(&mut self, data: &mut [u8]) -> bool {
        let mut done = 0;
        while done < data.len() {
            if self.error {
                return false;
            }
            if self.buffer_read_pos == self.buffer.len() {
                if !self.refill_buffer() {
                    self.error = true;
                    return false;
                }
            }
            let avail = self.buffer.len() - self.buffer_read_pos;
            let amount = std::cmp::min(avail, data.len() - done);
            data[done..done + amount]
                .copy_from_slice(&self.buffer[self.buffer_read_pos..self.buffer_read_pos + amount]);
            self.buffer_read_pos += amount;
            done += amount;
        }
        true
    }

    pub fn rewind(&mut self) {
        debug_assert!(!self.have_saved_state);
        self.fd_offset = 0;
        self.eof = false;
        self.error = !self.fd.is_open();
        self.buffer.clear();
        self.buffer_read_pos = 0;
    }

    pub fn close(&mut self) {
        self.fd.close();
    }

    /// Save the current position. Nested saves are not allowed.
    pub fn save_state(&mut self) {
        debug_assert!(!self.have_saved_state);
        self.have_saved_state = true;
        self.have_saved_buffer = !self.buffer.is_empty();
        self.saved_fd_offset = self.fd_offset;
        self.saved_buffer = self.buffer.clone();
        self.saved_buffer_read_pos = self.buffer_read_pos;
    }

    /// Restore the previously saved position.
    pub fn restore_state(&mut self) {
        debug_assert!(self.have_saved_state);
        self.have_saved_state = false;
        if self.saved_fd_offset < self.fd_offset {
            self.eof = false;
        }
        self.fd_offset = self.saved_fd_offset;
        if self.have_saved_buffer {
            self.buffer = std::mem::take(&mut self.saved_buffer);
            self.buffer_read_pos = self.saved_buffer_read_pos;
        } else {
            self.buffer.clear();
            self.buffer_read_pos = 0;
        }
        self.have_saved_buffer = false;
    }

    /// Discard the saved position.
    pub fn discard_state(&mut self) {
        debug_assert!(self.have_saved_state);
        self.have_saved_state = false;
        self.have_saved_buffer = false;
        self.saved_buffer = Vec::new();
    }

    fn pread_exact(&mut self, buf: &mut [u8]) -> bool {
        let mut done = 0;
        while done < buf.len() {
            let ret = unsafe {
                libc::pread64(
                    self.fd.as_raw(),
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    (self.fd_offset + done as u64) as i64,
                )
            };
            if ret < 0 {
                if nix::errno::errno() == libc::EINTR {
                    continue;
                }
                return false;
            }
            if ret == 0 {
                return false;
            }
            done += ret as usize;
        }
        self.fd_offset += buf.len() as u64;
        true
    }

    /// Read and decompress the next block. False at clean EOF or on error.
    fn refill_buffer(&mut self) -> bool {
        let mut header = BlockHeader::default();
        {
            let header_bytes = crate::util::u8_slice_mut(&mut header);
            let mut probe = [0u8; 1];
            // Distinguish EOF from truncation: a stream ends exactly on a
            // block boundary.
            let ret = unsafe {
                libc::pread64(
                    self.fd.as_raw(),
                    probe.as_mut_ptr() as *mut libc::c_void,
                    1,
                    self.fd_offset as i64,
                )
            };
            if ret == 0 {
                return false;
            }
            if ret < 0 {
                self.error = true;
                return false;
            }
            if !self.pread_exact(header_bytes) {
                self.error = true;
                return false;
            }
        }

        let mut compressed = vec![0u8; header.compressed_length as usize];
        if !self.pread_exact(&mut compressed) {
            self.error = true;
            return false;
        }

        let mut uncompressed = vec![0u8; header.uncompressed_length as usize];
        let mut decoded_size = uncompressed.len();
        let result = unsafe {
            BrotliDecoderDecompress(
                compressed.len(),
                compressed.as_ptr(),
                &mut decoded_size,
                uncompressed.as_mut_ptr(),
            )
        };
        if result != BROTLI_DECODER_RESULT_SUCCESS || decoded_size != uncompressed.len() {
            self.error = true;
            return false;
        }
        self.buffer = uncompressed;
        self.buffer_read_pos = 0;
        true
    }
}

impl Drop for CompressedReader {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::compressed_writer::{CompressedWriter, SyncFlag};
    use std::io::Write;

    fn round_trip(payload: &[u8], block_size: usize, threads: usize) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream");
        let os_path = path.as_os_str();
        {
            let mut w = CompressedWriter::new(os_path, block_size, threads);
            assert!(w.good());
            w.write_all(payload).unwrap();
            w.close(SyncFlag::Sync);
            assert!(w.good());
        }
        let mut r = CompressedReader::new(os_path);
        assert!(r.good());
        let mut back = vec![0u8; payload.len()];
        assert!(r.read(&mut back));
        assert_eq!(&back[..], payload);
        assert!(r.at_end());

        // Rewinding replays the identical byte sequence.
        r.rewind();
        let mut again = vec![0u8; payload.len()];
        assert!(r.read(&mut again));
        assert_eq!(&again[..], payload);
    }

    #[test]
    fn small_payload_single_thread() {
        round_trip(b"hello compressed world", 1 << 16, 1);
    }

    #[test]
    fn multi_block_multi_thread() {
        let mut payload = Vec::new();
        for i in 0..200_000u32 {
            payload.extend_from_slice(&i.to_le_bytes());
        }
        // Small blocks force many submissions through the ordered-write
        // turnstile.
        round_trip(&payload, 4096, 3);
    }

    #[test]
    fn save_restore_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream");
        {
            let mut w = CompressedWriter::new(path.as_os_str(), 4096, 1);
            w.write_all(b"abcdefghij").unwrap();
            w.close(SyncFlag::DontSync);
        }
        let mut r = CompressedReader::new(path.as_os_str());
        let mut first = [0u8; 3];
        assert!(r.read(&mut first));
        assert_eq!(&first, b"abc");

        r.save_state();
        let mut peeked = [0u8; 4];
        assert!(r.read(&mut peeked));
        assert_eq!(&peeked, b"defg");
        r.restore_state();

        let mut rest = [0u8; 7];
        assert!(r.read(&mut rest));
        assert_eq!(&rest, b"defghij");
        assert!(r.at_end());
    }
}

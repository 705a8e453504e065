use crate::scoped_fd::ScopedFd;
use crate::util::write_all;
use brotli_sys::{
    BrotliEncoderCompressStream, BrotliEncoderCreateInstance, BrotliEncoderDestroyInstance,
    BrotliEncoderSetParameter, BROTLI_OPERATION_FINISH, BROTLI_OPERATION_PROCESS,
    BROTLI_PARAM_QUALITY,
};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::fsync;
use std::cmp::min;
use std::ffi::OsStr;
use std::io::{Error, ErrorKind, Result, Write};
use std::mem::size_of;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Compression level. Higher levels cost more cpu per block than the
/// recording saves in write bandwidth.
const BROTLI_LEVEL: u32 = 5;

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum SyncFlag {
    DontSync,
    Sync,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum WaitFlag {
    Wait,
    NoWait,
}

/// Each compressed block on disk is preceded by these two words.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct BlockHeader {
    pub compressed_length: u32,
    pub uncompressed_length: u32,
}

/// Writes a stream as independently-compressed blocks of a fixed size.
///
/// The creating thread is the producer and the only legal caller of
/// `write`. Worker threads pull full blocks off a shared ring buffer,
/// compress in parallel, and write to the file strictly in block-submission
/// order: a worker holding a later block waits on the condvar until every
/// earlier block has been written. An error in any worker poisons the
/// stream; all further producer operations fail.
pub struct CompressedWriter {
    fd: ScopedFd,
    block_size: usize,
    shared: Arc<CompressorShared>,
    threads: Vec<JoinHandle<()>>,
    /// Stream position up to which the producer has published data.
    producer_reserved_pos: u64,
    /// Stream position of the next byte the producer will write.
    producer_reserved_write_pos: u64,
    /// Stream position up to which buffer space is known free.
    producer_reserved_upto_pos: u64,
    error: bool,
}

struct CompressorShared {
    mutex: Mutex<CompressorState>,
    cond_var: Condvar,
}

struct CompressorState {
    /// The ring buffer of uncompressed bytes, indexed modulo its length.
    buffer: Vec<u8>,
    /// Per-worker: stream position of the block being processed, None when
    /// idle.
    thread_pos: Vec<Option<u64>>,
    /// Stream position of data to hand to the next free worker.
    next_thread_pos: u64,
    /// Stream position of the end of published data.
    next_thread_end_pos: u64,
    closing: bool,
    write_error: bool,
}

impl Drop for CompressedWriter {
    fn drop(&mut self) {
        self.close(SyncFlag::DontSync);
    }
}

impl CompressedWriter {
    pub fn new(filename: &OsStr, block_size: usize, num_threads: usize) -> CompressedWriter {
        let fd = ScopedFd::open_path_with_mode(
            filename,
            OFlag::O_CLOEXEC | OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_LARGEFILE,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        let error = !fd.is_open();

        let shared = Arc::new(CompressorShared {
            mutex: Mutex::new(CompressorState {
                buffer: vec![0u8; block_size * (num_threads + 2)],
                thread_pos: vec![None; num_threads],
                next_thread_pos: 0,
                next_thread_end_pos: 0,
                closing: false,
                write_error: false,
            }),
            cond_var: Condvar::new(),
        });

        let mut cw = CompressedWriter {
            fd,
            block_size,
            shared,
            threads: Vec::new(),
            producer_reserved_pos: 0,
            producer_reserved_write_pos: 0,
            producer_reserved_upto_pos: block_size as u64 * (num_threads as u64 + 2),
            error,
        };
        if cw.error {
            return cw;
        }

        for i in 0..num_threads {
            let shared = cw.shared.clone();
            let fd_raw = cw.fd.as_raw();
            cw.threads.push(
                std::thread::Builder::new()
                    .name(format!("compress{}", i))
                    .spawn(move || compressor_thread(shared, i, block_size, fd_raw))
                    .unwrap(),
            );
        }
        cw
    }

    pub fn good(&self) -> bool {
        !self.error
    }

    /// Publish produced bytes to the workers and refresh the reservation
    /// window, optionally blocking until space frees up.
    fn update_reservation(&mut self, wait_flag: WaitFlag) {
        let mut g = self.shared.mutex.lock().unwrap();

        g.next_thread_end_pos = self.producer_reserved_write_pos;
        self.producer_reserved_pos = self.producer_reserved_write_pos;
        self.shared.cond_var.notify_all();

        while !self.error {
            if g.write_error {
                self.error = true;
                break;
            }

            // The oldest in-flight position bounds how much ring space has
            // been fully consumed.
            let mut completed_pos = g.next_thread_pos;
            for pos in g.thread_pos.iter().flatten() {
                completed_pos = min(completed_pos, *pos);
            }
            self.producer_reserved_upto_pos = completed_pos + g.buffer.len() as u64;

            if self.producer_reserved_pos < self.producer_reserved_upto_pos
                || wait_flag == WaitFlag::NoWait
            {
                break;
            }
            g = self.shared.cond_var.wait(g).unwrap();
        }
    }

    pub fn close(&mut self, sync: SyncFlag) {
        if !self.fd.is_open() {
            return;
        }

        self.update_reservation(WaitFlag::NoWait);

        {
            let mut g = self.shared.mutex.lock().unwrap();
            g.closing = true;
            self.shared.cond_var.notify_all();
        }

        while let Some(handle) = self.threads.pop() {
            handle.join().unwrap();
        }

        if sync == SyncFlag::Sync && fsync(self.fd.as_raw()).is_err() {
            self.error = true;
        }

        if self.shared.mutex.lock().unwrap().write_error {
            self.error = true;
        }
        self.fd.close();
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, data_to_write: &[u8]) -> Result<usize> {
        let mut data = data_to_write;
        while !self.error && !data.is_empty() {
            let reservation_size =
                (self.producer_reserved_upto_pos - self.producer_reserved_write_pos) as usize;
            if reservation_size == 0 {
                self.update_reservation(WaitFlag::Wait);
                continue;
            }
            {
                let mut g = self.shared.mutex.lock().unwrap();
                let buf_len = g.buffer.len();
                let buf_offset = (self.producer_reserved_write_pos % buf_len as u64) as usize;
                let amount = min(buf_len - buf_offset, min(reservation_size, data.len()));
                g.buffer[buf_offset..buf_offset + amount].copy_from_slice(&data[..amount]);
                self.producer_reserved_write_pos += amount as u64;
                data = &data[amount..];
            }
        }

        if !self.error
            && self.producer_reserved_write_pos - self.producer_reserved_pos
                >= (self.block_size as u64)
        {
            self.update_reservation(WaitFlag::NoWait);
        }

        if self.error {
            return Err(Error::new(ErrorKind::Other, "CompressedWriter error"));
        }
        Ok(data_to_write.len())
    }

    fn flush(&mut self) -> Result<()> {
        // Unwritten bytes are pushed by close(); there is no partial-block
        // flush, blocks are the compression unit.
        Ok(())
    }
}

fn compressor_thread(shared: Arc<CompressorShared>, thread_index: usize, block_size: usize, fd: i32) {
    // Slop for incompressible blocks.
    let mut outputbuf = vec![0u8; block_size + block_size / 2 + size_of::<BlockHeader>() + 1024];
    let mut inputbuf = vec![0u8; block_size];

    let mut g = shared.mutex.lock().unwrap();
    loop {
        if !g.write_error
            && g.next_thread_pos < g.next_thread_end_pos
            && (g.closing || g.next_thread_pos + block_size as u64 <= g.next_thread_end_pos)
        {
            let my_pos = g.next_thread_pos;
            g.thread_pos[thread_index] = Some(my_pos);
            g.next_thread_pos = min(g.next_thread_end_pos, my_pos + block_size as u64);
            let uncompressed_length = (g.next_thread_pos - my_pos) as usize;

            // Copy the (possibly ring-wrapped) region out while holding the
            // lock; the ring slot can be reused as soon as thread_pos
            // advances past it.
            let buf_len = g.buffer.len();
            let start = (my_pos % buf_len as u64) as usize;
            let first = min(uncompressed_length, buf_len - start);
            inputbuf[..first].copy_from_slice(&g.buffer[start..start + first]);
            inputbuf[first..uncompressed_length]
                .copy_from_slice(&g.buffer[..uncompressed_length - first]);

            drop(g);
            let compressed_length = unsafe {
                do_compress(
                    &inputbuf[..uncompressed_length],
                    &mut outputbuf[size_of::<BlockHeader>()..],
                )
            };
            g = shared.mutex.lock().unwrap();

            if compressed_length == 0 {
                g.write_error = true;
            } else {
                let header = BlockHeader {
                    compressed_length: compressed_length as u32,
                    uncompressed_length: uncompressed_length as u32,
                };
                outputbuf[..size_of::<BlockHeader>()].copy_from_slice(crate::util::u8_slice(&header));

                // Wait for the write turn: no other worker may hold an
                // earlier unwritten block.
                while !g.write_error {
                    let someone_earlier = g
                        .thread_pos
                        .iter()
                        .flatten()
                        .any(|&pos| pos < my_pos);
                    if !someone_earlier {
                        break;
                    }
                    g = shared.cond_var.wait(g).unwrap();
                }

                if !g.write_error {
                    drop(g);
                    write_all(fd, &outputbuf[..size_of::<BlockHeader>() + compressed_length]);
                    g = shared.mutex.lock().unwrap();
                }
            }

            g.thread_pos[thread_index] = None;
            // Broadcast: the producer or a worker waiting for its turn may
            // both need waking.
            shared.cond_var.notify_all();
            continue;
        }

        if g.closing && (g.write_error || g.next_thread_pos == g.next_thread_end_pos) {
            break;
        }
        g = shared.cond_var.wait(g).unwrap();
    }
}

/// Compress `input` into `output`, returning the compressed byte count, or
/// 0 on failure. `output` must be large enough for worst-case expansion.
unsafe fn do_compress(input: &[u8], output: &mut [u8]) -> usize {
    let state = BrotliEncoderCreateInstance(None, None, std::ptr::null_mut());
    if state.is_null() {
        return 0;
    }
    if 0 == BrotliEncoderSetParameter(state, BROTLI_PARAM_QUALITY, BROTLI_LEVEL) {
        BrotliEncoderDestroyInstance(state);
        return 0;
    }

    let mut avail_in = input.len();
    let mut next_in = input.as_ptr();
    let mut avail_out = output.len();
    let mut next_out = output.as_mut_ptr();
    let mut total_out: usize = 0;

    let mut ok = BrotliEncoderCompressStream(
        state,
        BROTLI_OPERATION_PROCESS,
        &mut avail_in,
        &mut next_in,
        &mut avail_out,
        &mut next_out,
        &mut total_out,
    );
    if ok != 0 {
        ok = BrotliEncoderCompressStream(
            state,
            BROTLI_OPERATION_FINISH,
            &mut avail_in,
            &mut next_in,
            &mut avail_out,
            &mut next_out,
            &mut total_out,
        );
    }
    BrotliEncoderDestroyInstance(state);
    if ok == 0 {
        0
    } else {
        total_out
    }
}

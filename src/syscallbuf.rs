//! Tracer-side handling of the per-thread syscall buffer: parsing the ring
//! the preload library fills during recording, and writing recorded results
//! back into the tracee's ring during replay so the library's
//! conditional-move commit path selects them.

use crate::preload_interface::{
    record_extra_data_size, stored_record_size, syscallbuf_hdr, syscallbuf_record,
    SYSCALLBUF_HDR_SIZE, SYSCALLBUF_RECORD_HEADER_SIZE,
};
use crate::remote_ptr::{RemotePtr, Void};
use crate::task::Task;

/// One parsed record: header plus its inline out-parameter bytes.
#[derive(Clone, Debug)]
pub struct ParsedRecord {
    pub syscallno: u16,
    pub desched: bool,
    pub ret: i64,
    pub extra_data: Vec<u8>,
    /// Offset of the record header from the start of the record area.
    pub offset: usize,
}

/// Parse the committed records out of a snapshot of a tracee's syscallbuf.
/// `buf` holds the header followed by the record area.
///
/// Commit atomicity: `num_rec_bytes` is advanced only after a record is
/// fully formed, so this only trusts bytes below that watermark and rejects
/// a record whose claimed size runs past it (a torn commit would be a
/// preload bug, not a race, because the tracee is stopped).
pub fn parse_buffer(buf: &[u8]) -> Vec<ParsedRecord> {
    if buf.len() < SYSCALLBUF_HDR_SIZE {
        fatal!("syscallbuf snapshot smaller than its header");
    }
    let mut hdr = syscallbuf_hdr::default();
    crate::util::u8_slice_mut(&mut hdr).copy_from_slice(&buf[..SYSCALLBUF_HDR_SIZE]);

    let rec_area = &buf[SYSCALLBUF_HDR_SIZE..];
    let committed = hdr.num_rec_bytes as usize;
    if committed > rec_area.len() {
        fatal!(
            "syscallbuf num_rec_bytes {} exceeds buffer size {}",
            committed,
            rec_area.len()
        );
    }

    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < committed {
        if offset + SYSCALLBUF_RECORD_HEADER_SIZE > committed {
            fatal!("syscallbuf record header straddles commit watermark");
        }
        let mut rec = syscallbuf_record::default();
        crate::util::u8_slice_mut(&mut rec)
            .copy_from_slice(&rec_area[offset..offset + SYSCALLBUF_RECORD_HEADER_SIZE]);
        let size = rec.size as usize;
        if size < SYSCALLBUF_RECORD_HEADER_SIZE || offset + size > committed {
            fatal!(
                "syscallbuf record at offset {} has bad size {} (committed {})",
                offset,
                size,
                committed
            );
        }
        let extra = rec_area[offset + SYSCALLBUF_RECORD_HEADER_SIZE..offset + size].to_vec();
        records.push(ParsedRecord {
            syscallno: rec.syscallno,
            desched: rec.desched != 0,
            ret: rec.ret,
            extra_data: extra,
            offset,
        });
        offset += stored_record_size(rec.size) as usize;
    }
    records
}

/// Read and parse a tracee's current syscallbuf.
pub fn read_and_parse(t: &mut Task) -> Vec<ParsedRecord> {
    let child_hdr = t.syscallbuf_child;
    debug_assert!(!child_hdr.is_null());
    let size = t.syscallbuf_size;
    let buf = t.read_mem_vec(child_hdr.cast(), size);
    parse_buffer(&buf)
}

/// Replay-side: write one record (header, `ret`, and its extra data) into
/// the tracee's ring at the recorded offset. The library's commit sequence
/// reads `ret` through a conditional move keyed on `in_replay`, so the
/// executed instruction stream matches the recording exactly.
pub fn write_record_to_child(t: &mut Task, rec: &ParsedRecord) {
    let rec_area: RemotePtr<Void> =
        t.syscallbuf_child.cast::<Void>().byte_add(SYSCALLBUF_HDR_SIZE);
    let rec_addr = rec_area.byte_add(rec.offset);

    let header = syscallbuf_record {
        ret: rec.ret,
        syscallno: rec.syscallno,
        desched: rec.desched as u8,
        _padding: 0,
        size: (SYSCALLBUF_RECORD_HEADER_SIZE + rec.extra_data.len()) as u32,
    };
    t.write_bytes(rec_addr, crate::util::u8_slice(&header));
    if !rec.extra_data.is_empty() {
        t.write_bytes(
            rec_addr.byte_add(SYSCALLBUF_RECORD_HEADER_SIZE),
            &rec.extra_data,
        );
    }
}

/// Replay-side: after all records are written, advance the child's
/// `num_rec_bytes` watermark last, mirroring the recording-side commit
/// order.
pub fn write_commit_watermark(t: &mut Task, num_rec_bytes: u32) {
    let hdr_addr = t.syscallbuf_child;
    let mut hdr = t.read_val_mem(hdr_addr);
    hdr.num_rec_bytes = num_rec_bytes;
    t.write_val_mem(hdr_addr, &hdr);
}

/// Reset the ring to empty. Recorded as its own event later than the flush
/// so replay never clears data the preload library is still reading.
pub fn reset_buffer(t: &mut Task) {
    if t.syscallbuf_child.is_null() {
        return;
    }
    let hdr_addr = t.syscallbuf_child;
    let mut hdr = t.read_val_mem(hdr_addr);
    hdr.num_rec_bytes = 0;
    hdr.abort_commit = 0;
    t.write_val_mem(hdr_addr, &hdr);
}

/// Bytes of committed records, per the child's header.
pub fn committed_bytes(t: &mut Task) -> u32 {
    if t.syscallbuf_child.is_null() {
        return 0;
    }
    let hdr = t.read_val_mem(t.syscallbuf_child);
    hdr.num_rec_bytes
}

/// Whether the desched signal could currently be relevant for `t`, per the
/// ring header flag. Set before the counter is armed and cleared after it
/// is disarmed, so a stray desched signal outside that window is discarded.
pub fn desched_signal_may_be_relevant(t: &mut Task) -> bool {
    if t.syscallbuf_child.is_null() {
        return false;
    }
    let hdr = t.read_val_mem(t.syscallbuf_child);
    hdr.desched_signal_may_be_relevant != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preload_interface::SYSCALLBUF_HDR_SIZE;

    fn push_record(buf: &mut Vec<u8>, syscallno: u16, ret: i64, extra: &[u8]) {
        let rec = syscallbuf_record {
            ret,
            syscallno,
            desched: 0,
            _padding: 0,
            size: (SYSCALLBUF_RECORD_HEADER_SIZE + extra.len()) as u32,
        };
        buf.extend_from_slice(crate::util::u8_slice(&rec));
        buf.extend_from_slice(extra);
        // Ring packing pads records to 8 bytes.
        while (buf.len() - SYSCALLBUF_HDR_SIZE) % 8 != 0 {
            buf.push(0);
        }
    }

    fn make_buffer(records: &[(u16, i64, &[u8])], commit_all: bool) -> Vec<u8> {
        let mut buf = vec![0u8; SYSCALLBUF_HDR_SIZE];
        for (no, ret, extra) in records {
            push_record(&mut buf, *no, *ret, extra);
        }
        let committed = if commit_all {
            (buf.len() - SYSCALLBUF_HDR_SIZE) as u32
        } else {
            0
        };
        let mut hdr = syscallbuf_hdr::default();
        hdr.num_rec_bytes = committed;
        buf[..SYSCALLBUF_HDR_SIZE].copy_from_slice(crate::util::u8_slice(&hdr));
        buf
    }

    #[test]
    fn parses_committed_records_in_order() {
        let buf = make_buffer(
            &[
                (0, 17, b"read-payload"),
                (228, 0, &[0u8; 16]),
                (7, -11, b""),
            ],
            true,
        );
        let recs = parse_buffer(&buf);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].syscallno, 0);
        assert_eq!(recs[0].ret, 17);
        assert_eq!(recs[0].extra_data, b"read-payload");
        assert_eq!(recs[1].syscallno, 228);
        assert_eq!(recs[1].extra_data.len(), 16);
        assert_eq!(recs[2].ret, -11);
        // Offsets are 8-aligned and increasing.
        assert!(recs[0].offset < recs[1].offset && recs[1].offset < recs[2].offset);
        for r in &recs {
            assert_eq!(r.offset % 8, 0);
        }
    }

    #[test]
    fn uncommitted_records_are_invisible() {
        let buf = make_buffer(&[(0, 17, b"payload")], false);
        let recs = parse_buffer(&buf);
        assert!(recs.is_empty());
    }
}

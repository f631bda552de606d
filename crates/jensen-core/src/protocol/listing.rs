//! File catalog decoding.
//!
//! The recorder answers a file-list request with a variable-length record
//! stream that may arrive split across many bulk reads. The parser here is
//! re-entrant over a growing buffer: callers concatenate everything received
//! so far and parse again; there is no internal streaming state. A truncated
//! tail yields only the fully-parsed prefix and never errors.

use byteorder::{BigEndian, ByteOrder};

/// Marker opening the optional 6-byte listing header.
const LIST_HEADER_MARKER: [u8; 2] = [0xFF, 0xFF];

/// Fixed bytes following the filename: size(4) + reserved(6) + signature(16).
const ENTRY_TRAILER_LEN: usize = 26;

/// Observed average wire size of one record, used by the completion
/// heuristic only.
const AVG_ENTRY_LEN: usize = 100;

/// One catalog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File format version byte.
    pub version: u8,
    /// Filename with NUL padding dropped.
    pub name: String,
    /// File size in bytes.
    pub size: u32,
    /// Opaque 16-byte signature, kept as lowercase hex.
    pub signature: String,
}

/// Result of parsing a (possibly still growing) listing buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListing {
    /// Total count declared by the optional header, if present.
    pub declared_total: Option<u32>,
    pub entries: Vec<FileEntry>,
}

impl FileListing {
    /// Whether the declared count (if any) has been reached.
    pub fn is_complete(&self) -> bool {
        match self.declared_total {
            Some(total) => self.entries.len() as u32 >= total,
            None => false,
        }
    }
}

/// Parse as many complete records as the buffer holds.
pub fn parse_file_list(buf: &[u8]) -> FileListing {
    let mut pos = 0;
    let mut declared_total = None;

    if buf.len() >= 6 && buf[0..2] == LIST_HEADER_MARKER {
        declared_total = Some(BigEndian::read_u32(&buf[2..6]));
        pos = 6;
    }

    // The declared count sizes the allocation; cap it so a corrupt header
    // cannot drive a huge reservation.
    let cap = declared_total.unwrap_or(0).min(4096) as usize;
    let mut entries = Vec::with_capacity(cap);

    while pos < buf.len() {
        if let Some(total) = declared_total
            && entries.len() as u32 >= total
        {
            break;
        }
        let Some((entry, consumed)) = parse_entry(&buf[pos..]) else {
            // Incomplete tail; later chunks will complete it.
            break;
        };
        entries.push(entry);
        pos += consumed;
    }

    FileListing {
        declared_total,
        entries,
    }
}

/// Decode one record from the front of `buf`, or `None` if it is not fully
/// present yet.
fn parse_entry(buf: &[u8]) -> Option<(FileEntry, usize)> {
    if buf.len() < 4 {
        return None;
    }
    let version = buf[0];
    let name_len = read_u24(&buf[1..4]);
    if name_len + ENTRY_TRAILER_LEN > buf.len() - 4 {
        return None;
    }

    let mut pos = 4;
    let name = decode_name(&buf[pos..pos + name_len]);
    pos += name_len;

    let size = BigEndian::read_u32(&buf[pos..pos + 4]);
    pos += 4 + 6; // size + reserved

    let signature = hex(&buf[pos..pos + 16]);
    pos += 16;

    Some((
        FileEntry {
            version,
            name,
            size,
            signature,
        },
        pos,
    ))
}

/// Decide whether enough bytes have arrived to stop requesting more reads.
///
/// `estimated = (bytes - 6) / 100`, the observed average record size. This
/// is an I/O optimization only; [`parse_file_list`] over the full buffer is
/// always the source of truth.
pub fn listing_appears_complete(total_bytes: usize, expected: u32) -> bool {
    if total_bytes < 6 {
        return false;
    }
    ((total_bytes - 6) / AVG_ENTRY_LEN) as u32 >= expected
}

fn read_u24(bytes: &[u8]) -> usize {
    ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize
}

/// Filename bytes may carry interior NUL padding; drop the NULs instead of
/// treating the first one as a terminator.
fn decode_name(bytes: &[u8]) -> String {
    let cleaned: Vec<u8> = bytes.iter().copied().filter(|&b| b != 0).collect();
    String::from_utf8_lossy(&cleaned).into_owned()
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: u8, name: &[u8], size: u32, signature: [u8; 16]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(version);
        buf.extend_from_slice(&[
            (name.len() >> 16) as u8,
            (name.len() >> 8) as u8,
            name.len() as u8,
        ]);
        buf.extend_from_slice(name);
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&[0u8; 6]);
        buf.extend_from_slice(&signature);
        buf
    }

    fn listing_with_header(records: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = vec![0xFF, 0xFF];
        buf.extend_from_slice(&(records.len() as u32).to_be_bytes());
        for r in records {
            buf.extend_from_slice(r);
        }
        buf
    }

    /// Reference parser without preallocation or early-out, kept as the
    /// regression baseline for the optimized one.
    fn naive_parse(buf: &[u8]) -> FileListing {
        let mut pos = 0;
        let mut declared_total = None;
        if buf.len() >= 6 && buf[0..2] == [0xFF, 0xFF] {
            declared_total = Some(u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]));
            pos = 6;
        }
        let mut entries = Vec::new();
        loop {
            if let Some(total) = declared_total {
                if entries.len() as u32 >= total {
                    break;
                }
            }
            match parse_entry(&buf[pos..]) {
                Some((entry, consumed)) => {
                    entries.push(entry);
                    pos += consumed;
                }
                None => break,
            }
        }
        FileListing {
            declared_total,
            entries,
        }
    }

    #[test]
    fn header_and_records_roundtrip() {
        let records = vec![
            record(1, b"2024May12-0930-Rec01.hda", 48_213, [0xAB; 16]),
            record(2, b"2024May13-1100-Rec02.hda", 1_024, [0x01; 16]),
        ];
        let buf = listing_with_header(&records);
        let listing = parse_file_list(&buf);

        assert_eq!(listing.declared_total, Some(2));
        assert_eq!(listing.entries.len(), 2);
        assert!(listing.is_complete());
        assert_eq!(listing.entries[0].name, "2024May12-0930-Rec01.hda");
        assert_eq!(listing.entries[0].size, 48_213);
        assert_eq!(listing.entries[0].signature, "ab".repeat(16));
        assert_eq!(listing.entries[1].version, 2);
    }

    #[test]
    fn no_header_parses_until_exhausted() {
        let mut buf = record(1, b"a.hda", 10, [0; 16]);
        buf.extend(record(1, b"b.hda", 20, [0; 16]));
        let listing = parse_file_list(&buf);
        assert_eq!(listing.declared_total, None);
        assert_eq!(listing.entries.len(), 2);
        assert!(!listing.is_complete());
    }

    #[test]
    fn nul_padding_dropped_mid_name() {
        let buf = record(1, b"rec\x0001\x00.hda\x00\x00", 5, [0; 16]);
        let listing = parse_file_list(&buf);
        assert_eq!(listing.entries[0].name, "rec01.hda");
    }

    #[test]
    fn truncated_tail_keeps_parsed_prefix() {
        let full = record(1, b"keep.hda", 1, [7; 16]);
        let partial = record(1, b"lost.hda", 2, [8; 16]);
        for cut in 1..partial.len() {
            let mut buf = full.clone();
            buf.extend_from_slice(&partial[..cut]);
            let listing = parse_file_list(&buf);
            assert_eq!(listing.entries.len(), 1, "cut at {cut}");
            assert_eq!(listing.entries[0].name, "keep.hda");
        }
    }

    #[test]
    fn fragmented_reparse_matches_single_shot() {
        let records: Vec<Vec<u8>> = (0..40)
            .map(|i| {
                record(
                    1,
                    format!("2024May12-09{i:02}-Rec{i:02}.hda").as_bytes(),
                    i * 1000,
                    [i as u8; 16],
                )
            })
            .collect();
        let full = listing_with_header(&records);
        let expected = parse_file_list(&full);
        assert_eq!(expected.entries.len(), 40);

        // Re-parse after every simulated bulk read; each result must be a
        // prefix of the final one, and the final result identical.
        for chunk_len in [1, 7, 63, 512] {
            let mut acc: Vec<u8> = Vec::new();
            let mut last = parse_file_list(&acc);
            for chunk in full.chunks(chunk_len) {
                acc.extend_from_slice(chunk);
                last = parse_file_list(&acc);
                assert_eq!(
                    last.entries[..],
                    expected.entries[..last.entries.len()],
                    "chunk_len {chunk_len}"
                );
            }
            assert_eq!(last, expected, "chunk_len {chunk_len}");
        }
    }

    #[test]
    fn preallocated_and_naive_strategies_agree() {
        let records: Vec<Vec<u8>> = (0..25)
            .map(|i| record(i as u8, format!("f{i}.hda").as_bytes(), i, [i as u8; 16]))
            .collect();
        let with_header = listing_with_header(&records);
        let mut without_header = Vec::new();
        for r in &records {
            without_header.extend_from_slice(r);
        }

        for buf in [&with_header, &without_header] {
            assert_eq!(parse_file_list(buf), naive_parse(buf));
        }
        // Truncated inputs too
        for cut in [0, 3, 6, 50, with_header.len() - 1] {
            assert_eq!(
                parse_file_list(&with_header[..cut]),
                naive_parse(&with_header[..cut])
            );
        }
    }

    #[test]
    fn completion_heuristic_thresholds() {
        // expected=100 files: 600 bytes is clearly short, 10006 is exactly
        // at the estimate, 15000 is past it.
        assert!(!listing_appears_complete(600, 100));
        assert!(listing_appears_complete(10_006, 100));
        assert!(listing_appears_complete(15_000, 100));
        // Shorter than the 6-byte header can never classify as complete.
        assert!(!listing_appears_complete(5, 1));
    }

    #[test]
    fn declared_count_caps_parsing() {
        // Two records present, header declares one.
        let records = vec![
            record(1, b"a.hda", 1, [0; 16]),
            record(1, b"b.hda", 2, [0; 16]),
        ];
        let mut buf = vec![0xFF, 0xFF, 0, 0, 0, 1];
        for r in &records {
            buf.extend_from_slice(r);
        }
        let listing = parse_file_list(&buf);
        assert_eq!(listing.entries.len(), 1);
        assert!(listing.is_complete());
    }
}

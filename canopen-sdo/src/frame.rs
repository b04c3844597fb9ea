//! SDO frame layout: encoding outbound requests and decoding inbound
//! responses.
//!
//! Every SDO frame is exactly 8 bytes:
//! - byte 0: command specifier
//! - bytes 1-2: index (little endian)
//! - byte 3: subindex
//! - bytes 4-7: payload or size
//!
//! Segment frames reuse bytes 1-7 as payload.

use crate::abort;
use crate::transfer::{Direction, Mode, Transfer};

/// Base COB-ID of client to server frames.
pub const REQUEST_COB_ID_BASE: u16 = 0x600;
/// Base COB-ID of server to client frames.
pub const RESPONSE_COB_ID_BASE: u16 = 0x580;

/// Initiate expedited download; size bits are OR-ed in.
pub const INITIATE_DOWNLOAD_EXPEDITED: u8 = 0x23;
/// Initiate segmented download, size indicated in bytes 4-7.
pub const INITIATE_DOWNLOAD_SEGMENTED: u8 = 0x21;
/// Server acknowledge of an initiate download.
pub const INITIATE_DOWNLOAD_RESPONSE: u8 = 0x60;
/// Server acknowledge of a download segment; toggle bit is OR-ed in.
pub const DOWNLOAD_SEGMENT_RESPONSE: u8 = 0x20;
/// Initiate domain upload (read).
pub const INITIATE_UPLOAD_REQUEST: u8 = 0x40;
/// Upload segment request; toggle bit is OR-ed in.
pub const UPLOAD_SEGMENT_REQUEST: u8 = 0x60;
/// Abort transfer, code in bytes 4-7.
pub const ABORT_TRANSFER: u8 = 0x80;

const SPECIFIER_MASK: u8 = 0xE0;
const UPLOAD_RESPONSE_SPECIFIER: u8 = 0x40;
const UPLOAD_SEGMENT_SPECIFIER: u8 = 0x00;
const TOGGLE_BIT: u8 = 0x10;
const EXPEDITED_BIT: u8 = 0x02;
const SIZE_INDICATED_BIT: u8 = 0x01;
const LAST_SEGMENT_BIT: u8 = 0x01;

/// Maximum payload of an expedited frame.
pub const EXPEDITED_MAX: usize = 4;
/// Maximum payload of a segment frame.
pub const SEGMENT_MAX: usize = 7;

/// COB-ID a client uses to address `node_id`.
pub fn request_cob_id(node_id: u8) -> u16 {
    REQUEST_COB_ID_BASE + node_id as u16
}

/// COB-ID `node_id` answers on.
pub fn response_cob_id(node_id: u8) -> u16 {
    RESPONSE_COB_ID_BASE + node_id as u16
}

/// An 8-byte SDO frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SdoFrame([u8; 8]);

impl SdoFrame {
    /// Frame carrying a command and a multiplexer, payload zeroed.
    pub fn new(command: u8, index: u16, sub_index: u8) -> Self {
        let mut data = [0u8; 8];
        data[0] = command;
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[3] = sub_index;
        Self(data)
    }

    pub fn from_bytes(data: [u8; 8]) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn command(&self) -> u8 {
        self.0[0]
    }

    pub fn index(&self) -> u16 {
        u16::from_le_bytes([self.0[1], self.0[2]])
    }

    pub fn sub_index(&self) -> u8 {
        self.0[3]
    }
}

/// Build the first frame of a transfer.
pub fn encode_initiate(transfer: &Transfer) -> SdoFrame {
    match transfer.direction() {
        Direction::Upload => {
            SdoFrame::new(INITIATE_UPLOAD_REQUEST, transfer.index(), transfer.sub_index())
        }
        Direction::Download => {
            let size = transfer.data().len();
            match transfer.mode() {
                Some(Mode::Expedited) => {
                    // Bits 3-2: number of bytes that do NOT contain data
                    let command = INITIATE_DOWNLOAD_EXPEDITED | (((EXPEDITED_MAX - size) as u8) << 2);
                    let mut frame = SdoFrame::new(command, transfer.index(), transfer.sub_index());
                    frame.0[4..4 + size].copy_from_slice(transfer.data());
                    frame
                }
                _ => {
                    let mut frame = SdoFrame::new(
                        INITIATE_DOWNLOAD_SEGMENTED,
                        transfer.index(),
                        transfer.sub_index(),
                    );
                    frame.0[4..8].copy_from_slice(&(size as u32).to_le_bytes());
                    frame
                }
            }
        }
    }
}

/// Build the next download segment: the next `min(7, remaining)` unsent
/// bytes, flagged as last when they exhaust the data.
pub fn encode_segment(transfer: &Transfer) -> SdoFrame {
    let data = transfer.data();
    let sent = transfer.bytes_transferred();
    let count = SEGMENT_MAX.min(data.len() - sent);
    let last = sent + count == data.len();

    let mut frame = SdoFrame::default();
    frame.0[0] = (transfer.toggle() << 4) | (((SEGMENT_MAX - count) as u8) << 1) | last as u8;
    frame.0[1..1 + count].copy_from_slice(&data[sent..sent + count]);
    frame
}

/// Ask the server for the next upload segment.
pub fn encode_upload_segment_request(toggle: u8) -> SdoFrame {
    let mut frame = SdoFrame::default();
    frame.0[0] = UPLOAD_SEGMENT_REQUEST | ((toggle & 1) << 4);
    frame
}

pub fn encode_abort(index: u16, sub_index: u8, code: u32) -> SdoFrame {
    let mut frame = SdoFrame::new(ABORT_TRANSFER, index, sub_index);
    frame.0[4..8].copy_from_slice(&code.to_le_bytes());
    frame
}

/// Abort carried by an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortInfo {
    pub code: u32,
    pub reason: &'static str,
}

/// A decoded inbound SDO frame.
///
/// Only the command specifier and the multiplexer are interpreted eagerly.
/// The payload accessors are meaningful only for the response shape the
/// active transfer expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indication {
    pub command: u8,
    pub index: u16,
    pub sub_index: u8,
    pub abort: Option<AbortInfo>,
    data: [u8; 8],
}

/// Decode an inbound frame body.
pub fn decode(data: &[u8; 8]) -> Indication {
    let command = data[0];
    let abort = (command == ABORT_TRANSFER).then(|| {
        let code = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        AbortInfo { code, reason: abort::lookup(code) }
    });

    Indication {
        command,
        index: u16::from_le_bytes([data[1], data[2]]),
        sub_index: data[3],
        abort,
        data: *data,
    }
}

impl Indication {
    /// Whether the multiplexer (bytes 1-3) addresses `index:sub_index`.
    pub fn matches(&self, index: u16, sub_index: u8) -> bool {
        self.index == index && self.sub_index == sub_index
    }

    pub fn is_upload_response(&self) -> bool {
        self.command & SPECIFIER_MASK == UPLOAD_RESPONSE_SPECIFIER
    }

    pub fn is_upload_segment(&self) -> bool {
        self.command & SPECIFIER_MASK == UPLOAD_SEGMENT_SPECIFIER
    }

    /// `e` bit of an upload initiate response.
    pub fn is_expedited(&self) -> bool {
        self.command & EXPEDITED_BIT != 0
    }

    /// `s` bit of an upload initiate response.
    pub fn is_size_indicated(&self) -> bool {
        self.command & SIZE_INDICATED_BIT != 0
    }

    /// Data bytes of an expedited upload response. Without the size bit
    /// all four bytes are returned.
    pub fn expedited_payload(&self) -> &[u8] {
        let len = if self.is_size_indicated() {
            EXPEDITED_MAX - ((self.command >> 2) & 0x03) as usize
        } else {
            EXPEDITED_MAX
        };
        &self.data[4..4 + len]
    }

    /// Size announced in bytes 4-7.
    pub fn size(&self) -> u32 {
        u32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn toggle(&self) -> u8 {
        (self.command & TOGGLE_BIT) >> 4
    }

    /// Data bytes of a segment frame (`7 - n` bytes starting at byte 1).
    pub fn segment_payload(&self) -> &[u8] {
        let unused = ((self.command >> 1) & 0x07) as usize;
        &self.data[1..1 + SEGMENT_MAX - unused]
    }

    pub fn is_last_segment(&self) -> bool {
        self.command & LAST_SEGMENT_BIT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn download(raw: &[u8]) -> Transfer {
        Transfer::download(0x2000, 0x01, raw.to_vec(), Instant::now())
    }

    #[test]
    fn test_cob_ids() {
        assert_eq!(request_cob_id(4), 0x604);
        assert_eq!(response_cob_id(4), 0x584);
        assert_eq!(response_cob_id(0x7F), 0x5FF);
    }

    #[test]
    fn test_expedited_initiate_for_every_size() {
        for size in 1..=4usize {
            let raw: Vec<u8> = (1..=size as u8).collect();
            let frame = encode_initiate(&download(&raw));
            let bytes = frame.as_bytes();

            assert_eq!(bytes[0], 0x23 | (((4 - size) as u8) << 2));
            assert_eq!(&bytes[1..4], &[0x00, 0x20, 0x01]);
            assert_eq!(&bytes[4..4 + size], raw.as_slice());
            assert!(bytes[4 + size..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_segmented_initiate_carries_size() {
        let frame = encode_initiate(&download(&[0xAA; 20]));
        assert_eq!(frame.as_bytes(), &[0x21, 0x00, 0x20, 0x01, 20, 0, 0, 0]);
    }

    #[test]
    fn test_upload_initiate() {
        let transfer = Transfer::upload(0x1008, 0x00, Instant::now());
        let frame = encode_initiate(&transfer);
        assert_eq!(frame.as_bytes(), &[0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);
    }

    #[test]
    fn test_segment_layout() {
        let raw: Vec<u8> = (0..10).collect();
        let transfer = download(&raw);
        let frame = encode_segment(&transfer);

        // toggle 1, 7 bytes, not last
        assert_eq!(frame.command(), 0x10);
        assert_eq!(&frame.as_bytes()[1..8], &raw[0..7]);
    }

    #[test]
    fn test_upload_segment_request() {
        assert_eq!(encode_upload_segment_request(0).command(), 0x60);
        assert_eq!(encode_upload_segment_request(1).command(), 0x70);
    }

    #[test]
    fn test_abort_frame() {
        let frame = encode_abort(0x2000, 0x02, 0x0504_0000);
        assert_eq!(frame.as_bytes(), &[0x80, 0x00, 0x20, 0x02, 0x00, 0x00, 0x04, 0x05]);
    }

    #[test]
    fn test_decode_abort() {
        let ind = decode(&[0x80, 0x00, 0x20, 0x01, 0x00, 0x00, 0x02, 0x06]);
        assert_eq!(ind.command, ABORT_TRANSFER);
        assert_eq!(ind.index, 0x2000);
        assert_eq!(ind.sub_index, 0x01);
        assert_eq!(
            ind.abort,
            Some(AbortInfo { code: 0x0602_0000, reason: "Object does not exist" })
        );
    }

    #[test]
    fn test_decode_unknown_abort_uses_fallback() {
        let ind = decode(&[0x80, 0x00, 0x20, 0x01, 0xEF, 0xBE, 0xAD, 0xDE]);
        let abort = ind.abort.unwrap();
        assert_eq!(abort.code, 0xDEAD_BEEF);
        assert_eq!(abort.reason, abort::UNKNOWN_ABORT_CODE);
    }

    #[test]
    fn test_decode_expedited_upload_response() {
        // 2 bytes of data: n = 2
        let ind = decode(&[0x4B, 0x03, 0x20, 0x01, 0x31, 0x00, 0xFF, 0xFF]);
        assert!(ind.is_upload_response());
        assert!(ind.is_expedited());
        assert!(ind.matches(0x2003, 0x01));
        assert_eq!(ind.expedited_payload(), &[0x31, 0x00]);
        assert!(ind.abort.is_none());
    }

    #[test]
    fn test_decode_expedited_without_size() {
        let ind = decode(&[0x42, 0x00, 0x10, 0x00, 1, 2, 3, 4]);
        assert!(ind.is_expedited());
        assert!(!ind.is_size_indicated());
        assert_eq!(ind.expedited_payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_decode_upload_segment() {
        // toggle 1, n = 4 (3 bytes), last
        let ind = decode(&[0x19, b'a', b'b', b'c', 0, 0, 0, 0]);
        assert!(ind.is_upload_segment());
        assert_eq!(ind.toggle(), 1);
        assert!(ind.is_last_segment());
        assert_eq!(ind.segment_payload(), b"abc");
    }

    #[test]
    fn test_decode_segmented_upload_response_size() {
        let ind = decode(&[0x41, 0x08, 0x10, 0x00, 15, 0, 0, 0]);
        assert!(ind.is_upload_response());
        assert!(!ind.is_expedited());
        assert!(ind.is_size_indicated());
        assert_eq!(ind.size(), 15);
    }
}

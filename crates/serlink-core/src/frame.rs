//! Frame encoding, validation and classification
//!
//! Wire layout (after the synchronization byte, all multi-byte integers
//! little-endian):
//!
//! - I-frame: `[0x96][len:2][len:2][0x96][seq:2][payload][crc16:2][0x10]`
//!   The length field's high bit is the "more fragments follow" flag, the
//!   low 15 bits are the payload length. The length is duplicated as a
//!   cheap consistency check.
//! - U-frame: `[0x38][control-code][crc8][0x10]`, fixed 4 bytes.
//! - A-frame: `[0xE5]`, 1 byte.

use byteorder::{ByteOrder, LittleEndian};

use crate::checksum::{crc16, crc8};

/// Synchronization byte prefixed to every transmitted frame
pub const SYNC_MARK: u8 = 0xAA;
/// Information frame marker
pub const I_MARK: u8 = 0x96;
/// Control frame marker
pub const U_MARK: u8 = 0x38;
/// Acknowledgment frame marker
pub const A_MARK: u8 = 0xE5;
/// End-of-frame marker
pub const END_MARK: u8 = 0x10;

/// I-frame header length (marker, duplicated length field, marker)
pub const I_HEADER_LEN: usize = 6;
/// Offset of the sequence number field inside an I-frame
pub const I_SEQ_OFFSET: usize = 6;
/// Offset of the payload inside an I-frame
pub const I_PAYLOAD_OFFSET: usize = 8;
/// Total I-frame overhead: header + sequence + checksum + end marker
pub const I_FIXED_LEN: usize = 11;
/// Total U-frame length
pub const U_FRAME_LEN: usize = 4;

/// Largest frame the link will produce or accept
pub const MAX_FRAME_SIZE: usize = 0x1000;
/// Largest payload fragment carried by one I-frame
pub const MAX_FRAGMENT_SIZE: usize = MAX_FRAME_SIZE - I_FIXED_LEN;

const MORE_FLAG: u16 = 0x8000;
const LEN_MASK: u16 = 0x7FFF;

/// Control codes carried by U-frames
///
/// One-hot assignment; the confirm variant of each primitive is its code
/// shifted left by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Start = 0x01,
    StartConfirm = 0x02,
    Reset = 0x04,
    ResetConfirm = 0x08,
    Stop = 0x10,
    StopConfirm = 0x20,
    Test = 0x40,
    TestConfirm = 0x80,
}

impl ControlFrame {
    /// Wire code of this control frame
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire control code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ControlFrame::Start),
            0x02 => Some(ControlFrame::StartConfirm),
            0x04 => Some(ControlFrame::Reset),
            0x08 => Some(ControlFrame::ResetConfirm),
            0x10 => Some(ControlFrame::Stop),
            0x20 => Some(ControlFrame::StopConfirm),
            0x40 => Some(ControlFrame::Test),
            0x80 => Some(ControlFrame::TestConfirm),
            _ => None,
        }
    }

    /// The confirmation reply for an activation frame
    pub fn confirm(self) -> Option<ControlFrame> {
        match self {
            ControlFrame::Start => Some(ControlFrame::StartConfirm),
            ControlFrame::Reset => Some(ControlFrame::ResetConfirm),
            ControlFrame::Stop => Some(ControlFrame::StopConfirm),
            ControlFrame::Test => Some(ControlFrame::TestConfirm),
            _ => None,
        }
    }

    /// The activation frame this confirmation acknowledges
    pub fn confirms(self) -> Option<ControlFrame> {
        match self {
            ControlFrame::StartConfirm => Some(ControlFrame::Start),
            ControlFrame::ResetConfirm => Some(ControlFrame::Reset),
            ControlFrame::StopConfirm => Some(ControlFrame::Stop),
            ControlFrame::TestConfirm => Some(ControlFrame::Test),
            _ => None,
        }
    }

    /// Whether this is a confirmation frame
    pub fn is_confirm(self) -> bool {
        self.confirms().is_some()
    }
}

/// A validated incoming frame
#[derive(Debug, PartialEq, Eq)]
pub enum ReceivedFrame<'a> {
    /// Sequenced payload fragment
    Information {
        seq: u16,
        more: bool,
        payload: &'a [u8],
    },
    /// Connection-lifecycle or liveness primitive
    Control(ControlFrame),
    /// Acknowledgment of the most recently sent I-frame
    Ack,
}

/// Build a U-frame for the given control code
pub fn prepare_uframe(kind: ControlFrame) -> [u8; U_FRAME_LEN] {
    let code = kind.code();
    [U_MARK, code, crc8(&[code]), END_MARK]
}

/// Build the single-byte acknowledgment frame
pub fn prepare_ack() -> [u8; 1] {
    [A_MARK]
}

/// Build an I-frame around a payload fragment.
///
/// The sequence number field is left zeroed and the checksum is not yet
/// valid; both are filled in by [`seal_iframe`] immediately before
/// transmission. Returns `None` for an empty or oversized payload.
pub fn prepare_iframe(payload: &[u8], more: bool) -> Option<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_FRAGMENT_SIZE {
        return None;
    }

    let len_field = if more {
        payload.len() as u16 | MORE_FLAG
    } else {
        payload.len() as u16 & LEN_MASK
    };

    let mut frame = vec![0u8; payload.len() + I_FIXED_LEN];
    frame[0] = I_MARK;
    LittleEndian::write_u16(&mut frame[1..3], len_field);
    LittleEndian::write_u16(&mut frame[3..5], len_field);
    frame[5] = I_MARK;
    frame[I_PAYLOAD_OFFSET..I_PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);
    frame[payload.len() + I_FIXED_LEN - 1] = END_MARK;
    Some(frame)
}

/// Write the sequence number into an I-frame and recompute its checksum.
///
/// Called right before the frame goes out so that retransmissions and
/// freshly queued frames always carry the current sequence state.
pub fn seal_iframe(frame: &mut [u8], seq: u16) {
    debug_assert!(frame.len() >= I_FIXED_LEN && frame[0] == I_MARK);
    let payload_len = frame.len() - I_FIXED_LEN;
    LittleEndian::write_u16(&mut frame[I_SEQ_OFFSET..I_PAYLOAD_OFFSET], seq);
    let check = crc16(&frame[I_SEQ_OFFSET..I_PAYLOAD_OFFSET + payload_len]);
    LittleEndian::write_u16(
        &mut frame[I_PAYLOAD_OFFSET + payload_len..I_PAYLOAD_OFFSET + payload_len + 2],
        check,
    );
}

/// Validate a raw frame buffer and classify it.
///
/// Returns `None` for anything inconsistent: mismatched duplicate length
/// fields, a size that disagrees with the length field, an unknown control
/// code, or a checksum failure. The caller treats `None` as if nothing had
/// been received.
pub fn validate(buf: &[u8]) -> Option<ReceivedFrame<'_>> {
    match buf.first()? {
        &I_MARK => {
            if buf.len() < I_FIXED_LEN {
                return None;
            }
            if buf[1..3] != buf[3..5] || buf[5] != I_MARK {
                return None;
            }

            let len_field = LittleEndian::read_u16(&buf[1..3]);
            let payload_len = (len_field & LEN_MASK) as usize;
            if buf.len() != payload_len + I_FIXED_LEN {
                return None;
            }
            if buf[payload_len + I_FIXED_LEN - 1] != END_MARK {
                return None;
            }

            let body = &buf[I_SEQ_OFFSET..I_PAYLOAD_OFFSET + payload_len];
            let check = LittleEndian::read_u16(
                &buf[I_PAYLOAD_OFFSET + payload_len..I_PAYLOAD_OFFSET + payload_len + 2],
            );
            if crc16(body) != check {
                return None;
            }

            Some(ReceivedFrame::Information {
                seq: LittleEndian::read_u16(&buf[I_SEQ_OFFSET..I_PAYLOAD_OFFSET]),
                more: len_field & MORE_FLAG != 0,
                payload: &buf[I_PAYLOAD_OFFSET..I_PAYLOAD_OFFSET + payload_len],
            })
        }
        &U_MARK => {
            if buf.len() != U_FRAME_LEN || buf[3] != END_MARK {
                return None;
            }
            if crc8(&buf[1..2]) != buf[2] {
                return None;
            }
            ControlFrame::from_code(buf[1]).map(ReceivedFrame::Control)
        }
        &A_MARK => {
            if buf.len() != 1 {
                return None;
            }
            Some(ReceivedFrame::Ack)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sealed_iframe(payload: &[u8], seq: u16, more: bool) -> Vec<u8> {
        let mut frame = prepare_iframe(payload, more).expect("payload in range");
        seal_iframe(&mut frame, seq);
        frame
    }

    #[test]
    fn test_iframe_roundtrip() {
        let payload = b"telemetry sample 42";
        let frame = sealed_iframe(payload, 7, true);

        match validate(&frame) {
            Some(ReceivedFrame::Information { seq, more, payload: p }) => {
                assert_eq!(seq, 7);
                assert!(more);
                assert_eq!(p, payload);
            }
            other => panic!("expected information frame, got {:?}", other),
        }
    }

    #[test]
    fn test_iframe_roundtrip_no_more() {
        let frame = sealed_iframe(&[0x55], 1, false);
        match validate(&frame) {
            Some(ReceivedFrame::Information { seq, more, payload }) => {
                assert_eq!(seq, 1);
                assert!(!more);
                assert_eq!(payload, &[0x55]);
            }
            other => panic!("expected information frame, got {:?}", other),
        }
    }

    #[test]
    fn test_iframe_layout() {
        let frame = sealed_iframe(&[0xDE, 0xAD], 0x0102, false);
        assert_eq!(frame.len(), 2 + I_FIXED_LEN);
        assert_eq!(frame[0], I_MARK);
        assert_eq!(&frame[1..3], &[0x02, 0x00]);
        assert_eq!(&frame[3..5], &[0x02, 0x00]);
        assert_eq!(frame[5], I_MARK);
        // sequence field is little-endian and does not overlap the payload
        assert_eq!(&frame[6..8], &[0x02, 0x01]);
        assert_eq!(&frame[8..10], &[0xDE, 0xAD]);
        assert_eq!(*frame.last().unwrap(), END_MARK);
    }

    #[test]
    fn test_iframe_rejects_empty_and_oversized() {
        assert!(prepare_iframe(&[], false).is_none());
        assert!(prepare_iframe(&vec![0u8; MAX_FRAGMENT_SIZE + 1], false).is_none());
        assert!(prepare_iframe(&vec![0u8; MAX_FRAGMENT_SIZE], false).is_some());
    }

    #[test]
    fn test_iframe_bit_flip_rejected() {
        let frame = sealed_iframe(b"integrity", 3, false);

        // Flip one bit at a time in the header, sequence field, payload and
        // end marker; every single-bit corruption outside the checksum must
        // be caught.
        for byte in (0..frame.len() - 3).chain([frame.len() - 1]) {
            for bit in 0..8 {
                let mut corrupt = frame.clone();
                corrupt[byte] ^= 1 << bit;
                assert!(
                    validate(&corrupt).is_none(),
                    "bit {} of byte {} not caught",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn test_iframe_duplicate_length_mismatch() {
        let mut frame = sealed_iframe(b"abc", 1, false);
        frame[3] ^= 0x01;
        assert_eq!(validate(&frame), None);
    }

    #[test]
    fn test_uframe_bytes() {
        assert_eq!(
            prepare_uframe(ControlFrame::Start),
            [U_MARK, 0x01, 0x07, END_MARK]
        );
        assert_eq!(
            prepare_uframe(ControlFrame::Test),
            [U_MARK, 0x40, 0xC7, END_MARK]
        );
        assert_eq!(
            prepare_uframe(ControlFrame::TestConfirm),
            [U_MARK, 0x80, 0x89, END_MARK]
        );
    }

    #[test]
    fn test_uframe_roundtrip_all_codes() {
        for kind in [
            ControlFrame::Start,
            ControlFrame::StartConfirm,
            ControlFrame::Reset,
            ControlFrame::ResetConfirm,
            ControlFrame::Stop,
            ControlFrame::StopConfirm,
            ControlFrame::Test,
            ControlFrame::TestConfirm,
        ] {
            let frame = prepare_uframe(kind);
            assert_eq!(validate(&frame), Some(ReceivedFrame::Control(kind)));
        }
    }

    #[test]
    fn test_uframe_bad_checksum_rejected() {
        let mut frame = prepare_uframe(ControlFrame::Start);
        frame[2] ^= 0xFF;
        assert_eq!(validate(&frame), None);
    }

    #[test]
    fn test_uframe_bad_trailer_rejected() {
        let mut frame = prepare_uframe(ControlFrame::Start);
        frame[3] = 0x00;
        assert_eq!(validate(&frame), None);
    }

    #[test]
    fn test_uframe_unknown_code_rejected() {
        // valid checksum over an unassigned code
        let frame = [U_MARK, 0x03, crate::checksum::crc8(&[0x03]), END_MARK];
        assert_eq!(validate(&frame), None);
    }

    #[test]
    fn test_ack_frame() {
        assert_eq!(validate(&prepare_ack()), Some(ReceivedFrame::Ack));
    }

    #[test]
    fn test_unknown_marker_rejected() {
        assert_eq!(validate(&[0x00, 0x01, 0x02]), None);
        assert_eq!(validate(&[]), None);
    }

    #[test]
    fn test_confirm_pairing() {
        assert_eq!(ControlFrame::Start.confirm(), Some(ControlFrame::StartConfirm));
        assert_eq!(ControlFrame::StopConfirm.confirms(), Some(ControlFrame::Stop));
        assert_eq!(ControlFrame::StartConfirm.confirm(), None);
        assert_eq!(ControlFrame::Test.confirms(), None);
        assert!(ControlFrame::ResetConfirm.is_confirm());
        assert!(!ControlFrame::Reset.is_confirm());
    }
}

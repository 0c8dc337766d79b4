//! Live-data and comparison-peer wire framing
//!
//! All integers are little-endian. The live-data socket carries raw
//! frames and detected boxes; the comparison peer speaks a single
//! request/reply pair.

use crate::{Frame, FaceBox};

/// Raw frame message on the live-data socket.
pub const MSG_FRAME: u8 = 0x60;
/// Detected-boxes message on the live-data socket.
pub const MSG_AXIS: u8 = 0x61;
/// Comparison request to the peer.
pub const MSG_COMPARE_REQUEST: u8 = 0x70;
/// Comparison verdict from the peer.
pub const MSG_COMPARE_REPLY: u8 = 0x71;

/// `[0x60][u8 channels][u32 width][u32 height][u32 len][bytes]`
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + frame.data.len());
    out.push(MSG_FRAME);
    out.push(Frame::CHANNELS);
    out.extend_from_slice(&frame.width.to_le_bytes());
    out.extend_from_slice(&frame.height.to_le_bytes());
    out.extend_from_slice(&(frame.data.len() as u32).to_le_bytes());
    out.extend_from_slice(&frame.data);
    out
}

/// `[0x61][u32 len][JSON array of boxes]`
pub fn encode_boxes(boxes: &[FaceBox]) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(boxes)?;
    let mut out = Vec::with_capacity(5 + json.len());
    out.push(MSG_AXIS);
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// `[0x70][u8 channels][u32 w1][u32 h1][u32 len1][u32 w2][u32 h2][u32 len2]`
/// followed by both images' raw pixels.
pub fn encode_compare_request(live: &Frame, stored: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(26 + live.data.len() + stored.data.len());
    out.push(MSG_COMPARE_REQUEST);
    out.push(Frame::CHANNELS);
    for frame in [live, stored] {
        out.extend_from_slice(&frame.width.to_le_bytes());
        out.extend_from_slice(&frame.height.to_le_bytes());
        out.extend_from_slice(&(frame.data.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(&live.data);
    out.extend_from_slice(&stored.data);
    out
}

/// `[0x71][u8 match]`
pub fn decode_compare_reply(reply: &[u8; 2]) -> Option<bool> {
    if reply[0] == MSG_COMPARE_REPLY {
        Some(reply[1] != 0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_message_layout() {
        let frame = Frame::new(vec![1, 2, 3, 4, 5, 6], 2, 1);
        let encoded = encode_frame(&frame);
        assert_eq!(encoded[0], MSG_FRAME);
        assert_eq!(encoded[1], 3);
        assert_eq!(&encoded[2..6], &2u32.to_le_bytes());
        assert_eq!(&encoded[6..10], &1u32.to_le_bytes());
        assert_eq!(&encoded[10..14], &6u32.to_le_bytes());
        assert_eq!(&encoded[14..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn boxes_message_carries_json() {
        let boxes = [FaceBox {
            x: 1,
            y: 2,
            w: 3,
            h: 4,
        }];
        let encoded = encode_boxes(&boxes).expect("encode");
        assert_eq!(encoded[0], MSG_AXIS);
        let len = u32::from_le_bytes(encoded[1..5].try_into().expect("len")) as usize;
        assert_eq!(len, encoded.len() - 5);
        let decoded: Vec<FaceBox> = serde_json::from_slice(&encoded[5..]).expect("json");
        assert_eq!(decoded, boxes);
    }

    #[test]
    fn compare_request_packs_both_images() {
        let live = Frame::new(vec![9; 12], 2, 2);
        let stored = Frame::new(vec![8; 3], 1, 1);
        let encoded = encode_compare_request(&live, &stored);
        assert_eq!(encoded[0], MSG_COMPARE_REQUEST);
        assert_eq!(encoded[1], 3);
        assert_eq!(&encoded[2..6], &2u32.to_le_bytes());
        assert_eq!(&encoded[10..14], &12u32.to_le_bytes());
        assert_eq!(&encoded[14..18], &1u32.to_le_bytes());
        assert_eq!(&encoded[22..26], &3u32.to_le_bytes());
        assert_eq!(encoded.len(), 26 + 12 + 3);
        assert_eq!(&encoded[26..38], &[9; 12]);
        assert_eq!(&encoded[38..], &[8; 3]);
    }

    #[test]
    fn compare_reply_decoding() {
        assert_eq!(decode_compare_reply(&[MSG_COMPARE_REPLY, 1]), Some(true));
        assert_eq!(decode_compare_reply(&[MSG_COMPARE_REPLY, 0]), Some(false));
        assert_eq!(decode_compare_reply(&[MSG_FRAME, 1]), None);
    }
}

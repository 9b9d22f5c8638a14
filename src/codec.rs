//! Length-prefixed framing and structured (de)serialization of wire values.
//!
//! Every message on every channel is one frame: an 8-byte little-endian
//! unsigned length followed by exactly that many payload bytes. The payload
//! is a `bincode` encoding of the channel's request or response type, which
//! gives fixed-width little-endian integers, length-prefixed byte arrays and
//! strings, discriminant-then-body sum types and tag-then-body options. The
//! reader always consumes a whole frame before deserialising, so no partial
//! message state ever reaches the decoder.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BridgeError, CodecError, Result};

/// Default per-channel frame cap. Larger than any legitimate payload (the
/// biggest real traffic is a plugin state chunk); decoders reject frames
/// above the cap before allocating.
pub const DEFAULT_FRAME_CAP: u64 = 16 * 1024 * 1024;

/// Serialise a wire value to payload bytes.
pub fn encode<T: Serialize>(value: &T) -> std::result::Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(value)?)
}

/// Deserialise a wire value from payload bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> std::result::Result<T, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T, cap: u64) -> Result<()> {
    let payload = encode(value)?;
    let len = payload.len() as u64;
    if len > cap {
        return Err(BridgeError::Codec(CodecError::FrameTooLarge { len, cap }));
    }
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame and decode it.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R, cap: u64) -> Result<T> {
    let mut prefix = [0u8; 8];
    reader.read_exact(&mut prefix)?;
    let len = u64::from_le_bytes(prefix);
    if len > cap {
        return Err(BridgeError::Codec(CodecError::FrameTooLarge { len, cap }));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(decode(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Cursor;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    enum Sample {
        Empty,
        Bytes(Vec<u8>),
        Text(String),
        Pair { index: i32, value: f32 },
    }

    #[test]
    fn round_trips_every_variant() {
        let values = vec![
            Sample::Empty,
            Sample::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
            Sample::Text("hasCockosViewAsConfig".to_string()),
            Sample::Pair { index: 7, value: 0.25 },
        ];
        for value in values {
            let bytes = encode(&value).unwrap();
            let back: Sample = decode(&bytes).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Sample::Pair { index: 1, value: 2.0 }, DEFAULT_FRAME_CAP).unwrap();
        let back: Sample = read_frame(&mut Cursor::new(buf), DEFAULT_FRAME_CAP).unwrap();
        assert_eq!(back, Sample::Pair { index: 1, value: 2.0 });
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u64::MAX.to_le_bytes());
        let err = read_frame::<_, Sample>(&mut Cursor::new(buf), 64).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Codec(CodecError::FrameTooLarge { cap: 64, .. })
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_on_write() {
        let mut buf = Vec::new();
        let err =
            write_frame(&mut buf, &Sample::Bytes(vec![0u8; 1024]), 16).unwrap_err();
        assert!(matches!(err, BridgeError::Codec(CodecError::FrameTooLarge { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_discriminant_fails() {
        // A discriminant beyond the last `Sample` variant.
        let bytes = 17u32.to_le_bytes().to_vec();
        assert!(decode::<Sample>(&bytes).is_err());
    }

    #[test]
    fn invalid_utf8_fails() {
        let good = encode(&Sample::Text("ab".into())).unwrap();
        let mut bad = good.clone();
        let len = bad.len();
        bad[len - 1] = 0xff;
        bad[len - 2] = 0xfe;
        assert!(decode::<Sample>(&bad).is_err());
    }

    #[test]
    fn truncated_frame_fails() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Sample::Bytes(vec![1, 2, 3]), DEFAULT_FRAME_CAP).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(read_frame::<_, Sample>(&mut Cursor::new(buf), DEFAULT_FRAME_CAP).is_err());
    }
}

//! Call-sign fields.
//!
//! Stations are addressed by a flat call sign of at most 8 ASCII bytes,
//! NUL-padded on the wire. `CQCQCQ` addresses everyone.

use crate::error::{FrameError, Result};

/// Width of a call-sign field in the frame header.
pub const CALLSIGN_LEN: usize = 8;

/// The broadcast ("anyone") address.
pub const BROADCAST: &str = "CQCQCQ";

/// Returns true if `call` is the broadcast address.
pub fn is_broadcast(call: &str) -> bool {
    call == BROADCAST
}

/// Pack `call` into a NUL-padded 8-byte field.
pub fn pack(call: &str) -> Result<[u8; CALLSIGN_LEN]> {
    let bytes = call.as_bytes();
    if bytes.len() > CALLSIGN_LEN {
        return Err(FrameError::CallsignTooLong(call.to_string()));
    }
    if !bytes.iter().all(|b| b.is_ascii_graphic()) {
        return Err(FrameError::InvalidCallsign);
    }
    let mut field = [0u8; CALLSIGN_LEN];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// Unpack a NUL-padded field. Everything after the first NUL must be NUL.
pub fn unpack(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let (call, padding) = field.split_at(end);
    if !call.iter().all(|b| b.is_ascii_graphic()) || padding.iter().any(|&b| b != 0) {
        return Err(FrameError::InvalidCallsign);
    }
    Ok(String::from_utf8_lossy(call).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_pads_with_nul() {
        assert_eq!(&pack("N0CALL").unwrap(), b"N0CALL\0\0");
        assert_eq!(unpack(b"N0CALL\0\0").unwrap(), "N0CALL");
    }

    #[test]
    fn full_width_call_has_no_padding() {
        assert_eq!(unpack(&pack("KD7ABCDE").unwrap()).unwrap(), "KD7ABCDE");
    }

    #[test]
    fn rejects_long_or_unprintable_calls() {
        assert!(matches!(
            pack("TOOLONGCALL"),
            Err(FrameError::CallsignTooLong(_))
        ));
        assert!(matches!(pack("N0 CALL"), Err(FrameError::InvalidCallsign)));
        assert!(matches!(
            unpack(b"N0\x01CALL\0"),
            Err(FrameError::InvalidCallsign)
        ));
        assert!(matches!(
            unpack(b"N0\0CALL\0\0"),
            Err(FrameError::InvalidCallsign)
        ));
    }

    #[test]
    fn broadcast_detection() {
        assert!(is_broadcast("CQCQCQ"));
        assert!(!is_broadcast("N0CALL"));
    }
}

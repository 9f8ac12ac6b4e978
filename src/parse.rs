//! Binary decoders for sensor characteristic payloads.
//!
//! All public functions in this module are pure (no I/O, no allocation) and
//! are safe to call from any async or sync context.  Every decoder checks the
//! payload length before touching a byte, so a short buffer produces
//! [`DecodeError::MalformedPayload`] instead of a panic.
//!
//! | Function | Characteristic | Format |
//! |---|---|---|
//! | [`decode_device_id`] | device id | `i32` big-endian, 4 B |
//! | [`decode_ultrasonic_flag`] | ultrasonic detected | `u8`, `1` = detected |
//! | [`decode_peak_interval`] | peak-to-peak interval | `i64` LE timestamp + `f32` LE value, 12 B |
//!
//! Trailing bytes beyond the fixed layout are ignored.

use crate::error::DecodeError;
use crate::protocol::CharacteristicKind;
use crate::types::CharacteristicValue;

/// Length of a device-id payload.
pub const DEVICE_ID_LEN: usize = 4;

/// Minimum length of an ultrasonic-flag payload.
pub const ULTRASONIC_FLAG_LEN: usize = 1;

/// Length of a peak-interval payload (8-byte timestamp + 4-byte float).
pub const PEAK_INTERVAL_LEN: usize = 12;

/// Return the first `N` bytes of `data`, or a `MalformedPayload` error.
fn take<const N: usize>(data: &[u8], kind: CharacteristicKind) -> Result<[u8; N], DecodeError> {
    data.get(..N)
        .and_then(|head| head.try_into().ok())
        .ok_or(DecodeError::MalformedPayload {
            kind,
            expected: N,
            actual: data.len(),
        })
}

/// Decode the persistent device identifier.
///
/// ```
/// # use hrv_sonar::parse::decode_device_id;
/// assert_eq!(decode_device_id(&[0x00, 0x00, 0x01, 0x02]).unwrap(), 258);
/// assert_eq!(decode_device_id(&[0xFF, 0xFF, 0xFF, 0xFE]).unwrap(), -2);
/// assert!(decode_device_id(&[0x01, 0x02]).is_err());
/// ```
pub fn decode_device_id(data: &[u8]) -> Result<i32, DecodeError> {
    let raw = take::<DEVICE_ID_LEN>(data, CharacteristicKind::DeviceId)?;
    Ok(i32::from_be_bytes(raw))
}

/// Decode the ultrasonic detection flag: `true` iff the first byte is `1`.
pub fn decode_ultrasonic_flag(data: &[u8]) -> Result<bool, DecodeError> {
    let [flag] = take::<ULTRASONIC_FLAG_LEN>(data, CharacteristicKind::UltrasonicDetected)?;
    Ok(flag == 1)
}

/// Decode one peak-to-peak interval sample into `(timestamp, value)`.
///
/// Wire layout:
/// ```text
/// bytes 0..8  : i64 little-endian timestamp (sensor clock)
/// bytes 8..12 : f32 little-endian interval value
/// ```
pub fn decode_peak_interval(data: &[u8]) -> Result<(i64, f32), DecodeError> {
    let raw = take::<PEAK_INTERVAL_LEN>(data, CharacteristicKind::PeakInterval)?;
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&raw[..8]);
    let mut value = [0u8; 4];
    value.copy_from_slice(&raw[8..]);
    Ok((i64::from_le_bytes(ts), f32::from_le_bytes(value)))
}

/// Decode a payload according to the characteristic it arrived on.
pub fn decode_characteristic(
    kind: CharacteristicKind,
    data: &[u8],
) -> Result<CharacteristicValue, DecodeError> {
    match kind {
        CharacteristicKind::DeviceId => decode_device_id(data).map(CharacteristicValue::DeviceId),
        CharacteristicKind::UltrasonicDetected => {
            decode_ultrasonic_flag(data).map(CharacteristicValue::UltrasonicDetected)
        }
        CharacteristicKind::PeakInterval => decode_peak_interval(data)
            .map(|(timestamp, value)| CharacteristicValue::PeakInterval { timestamp, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval_bytes(timestamp: i64, value: f32) -> Vec<u8> {
        let mut buf = timestamp.to_le_bytes().to_vec();
        buf.extend_from_slice(&value.to_le_bytes());
        buf
    }

    #[test]
    fn device_id_recovers_encoded_integers() {
        for id in [0, 1, -1, 42, i32::MAX, i32::MIN, 0x1234_5678] {
            assert_eq!(decode_device_id(&id.to_be_bytes()), Ok(id));
        }
    }

    #[test]
    fn device_id_ignores_trailing_bytes() {
        assert_eq!(decode_device_id(&[0, 0, 0, 7, 0xAA, 0xBB]), Ok(7));
    }

    #[test]
    fn short_device_id_is_malformed() {
        for len in 0..DEVICE_ID_LEN {
            let data = vec![0xFF; len];
            assert_eq!(
                decode_device_id(&data),
                Err(DecodeError::MalformedPayload {
                    kind: CharacteristicKind::DeviceId,
                    expected: 4,
                    actual: len,
                })
            );
        }
    }

    #[test]
    fn ultrasonic_flag_only_accepts_one() {
        assert_eq!(decode_ultrasonic_flag(&[1]), Ok(true));
        assert_eq!(decode_ultrasonic_flag(&[0]), Ok(false));
        assert_eq!(decode_ultrasonic_flag(&[2]), Ok(false));
        assert_eq!(decode_ultrasonic_flag(&[0xFF, 1]), Ok(false));
        assert_eq!(decode_ultrasonic_flag(&[1, 0, 0]), Ok(true));
    }

    #[test]
    fn empty_ultrasonic_flag_is_malformed() {
        assert!(matches!(
            decode_ultrasonic_flag(&[]),
            Err(DecodeError::MalformedPayload { actual: 0, .. })
        ));
    }

    #[test]
    fn peak_interval_recovers_timestamp_and_value() {
        let cases = [
            (0_i64, 0.0_f32),
            (1_700_000_000_123, 812.5),
            (-5, -1.25),
            (i64::MAX, f32::MAX),
        ];
        for (timestamp, value) in cases {
            let (t, v) = decode_peak_interval(&interval_bytes(timestamp, value)).unwrap();
            assert_eq!(t, timestamp);
            assert_eq!(v.to_bits(), value.to_bits());
        }
    }

    #[test]
    fn peak_interval_is_little_endian() {
        let data = [
            0x01, 0x02, 0, 0, 0, 0, 0, 0, // 0x0201
            0x00, 0x00, 0x80, 0x3F, // 1.0f32
        ];
        assert_eq!(decode_peak_interval(&data), Ok((0x0201, 1.0)));
    }

    #[test]
    fn short_peak_interval_is_malformed() {
        let full = interval_bytes(1234, 1.5);
        for len in 0..PEAK_INTERVAL_LEN {
            assert_eq!(
                decode_peak_interval(&full[..len]),
                Err(DecodeError::MalformedPayload {
                    kind: CharacteristicKind::PeakInterval,
                    expected: 12,
                    actual: len,
                })
            );
        }
    }

    #[test]
    fn dispatch_follows_kind() {
        assert_eq!(
            decode_characteristic(CharacteristicKind::DeviceId, &9_i32.to_be_bytes()),
            Ok(CharacteristicValue::DeviceId(9))
        );
        assert_eq!(
            decode_characteristic(CharacteristicKind::UltrasonicDetected, &[1]),
            Ok(CharacteristicValue::UltrasonicDetected(true))
        );
        assert_eq!(
            decode_characteristic(CharacteristicKind::PeakInterval, &interval_bytes(10, 2.0)),
            Ok(CharacteristicValue::PeakInterval {
                timestamp: 10,
                value: 2.0
            })
        );
    }
}

//! GATT UUIDs, characteristic kinds, and radio constants for the HRV sensor
//! firmware.
//!
//! All UUIDs live in the sensor vendor namespace
//! `7a1eXXXX-5b3c-4d2e-9f10-a6c4e8b2d135`.  The values are fixed by the
//! sensor firmware and must not change.

use serde::Serialize;
use uuid::Uuid;

// ── Services ─────────────────────────────────────────────────────────────────

/// Identification service advertised by every sensor.
///
/// Used as the scan filter, and carries the device-id and ultrasonic
/// detection characteristics.
pub const IDENTIFICATION_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x7a1e0001_5b3c_4d2e_9f10_a6c4e8b2d135);

/// Heart-rate-variability service carrying the peak-to-peak interval stream.
pub const HRV_SERVICE_UUID: Uuid = Uuid::from_u128(0x7a1e0100_5b3c_4d2e_9f10_a6c4e8b2d135);

// ── Characteristics ──────────────────────────────────────────────────────────

/// Persistent device identifier (read once after connecting).
///
/// 4 bytes, big-endian `i32`.  See [`crate::parse::decode_device_id`].
pub const DEVICE_ID_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x7a1e0002_5b3c_4d2e_9f10_a6c4e8b2d135);

/// Ultrasonic detection outcome (notify).
///
/// 1 byte: `1` = pattern detected, anything else = not detected.
/// See [`crate::parse::decode_ultrasonic_flag`].
pub const ULTRASONIC_DETECTED_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x7a1e0003_5b3c_4d2e_9f10_a6c4e8b2d135);

/// Peak-to-peak interval sample (notify).
///
/// 12 bytes: little-endian `i64` timestamp followed by a little-endian `f32`.
/// See [`crate::parse::decode_peak_interval`].
pub const PEAK_INTERVAL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x7a1e0101_5b3c_4d2e_9f10_a6c4e8b2d135);

/// The three characteristic types the sensor exposes.
///
/// | Kind | Service | Access | Payload |
/// |---|---|---|---|
/// | `DeviceId` | identification | read | `i32` BE |
/// | `UltrasonicDetected` | identification | notify | `u8` flag |
/// | `PeakInterval` | HRV | notify | `i64` LE + `f32` LE |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CharacteristicKind {
    DeviceId,
    UltrasonicDetected,
    PeakInterval,
}

impl CharacteristicKind {
    /// Every kind, in the order they are set up after connecting.
    pub const ALL: [CharacteristicKind; 3] = [
        CharacteristicKind::DeviceId,
        CharacteristicKind::UltrasonicDetected,
        CharacteristicKind::PeakInterval,
    ];

    /// GATT UUID of this characteristic.
    pub fn uuid(self) -> Uuid {
        match self {
            CharacteristicKind::DeviceId => DEVICE_ID_CHARACTERISTIC,
            CharacteristicKind::UltrasonicDetected => ULTRASONIC_DETECTED_CHARACTERISTIC,
            CharacteristicKind::PeakInterval => PEAK_INTERVAL_CHARACTERISTIC,
        }
    }

    /// GATT service the characteristic belongs to.
    pub fn service(self) -> Uuid {
        match self {
            CharacteristicKind::DeviceId | CharacteristicKind::UltrasonicDetected => {
                IDENTIFICATION_SERVICE_UUID
            }
            CharacteristicKind::PeakInterval => HRV_SERVICE_UUID,
        }
    }

    /// Map a characteristic UUID back to its kind.
    ///
    /// Returns `None` for any UUID outside the three recognised ones; callers
    /// ignore such updates.
    ///
    /// ```
    /// # use hrv_sonar::protocol::{CharacteristicKind, PEAK_INTERVAL_CHARACTERISTIC};
    /// assert_eq!(
    ///     CharacteristicKind::from_uuid(PEAK_INTERVAL_CHARACTERISTIC),
    ///     Some(CharacteristicKind::PeakInterval)
    /// );
    /// assert_eq!(CharacteristicKind::from_uuid(uuid::Uuid::nil()), None);
    /// ```
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.uuid() == uuid)
    }

    /// `true` for characteristics delivered through notifications.
    pub fn is_notify(self) -> bool {
        !matches!(self, CharacteristicKind::DeviceId)
    }
}

// ── Radio constants ──────────────────────────────────────────────────────────

/// Path-loss exponent of the log-distance model used by [`estimate_distance`].
pub const PATH_LOSS_EXPONENT: f64 = 4.0;

/// Estimate the distance to a peripheral in metres from its advertised
/// transmit power and the measured RSSI (both in dBm).
///
/// `d = 10 ^ ((-tx_power - rssi) / (10 × n))` with `n` = [`PATH_LOSS_EXPONENT`].
///
/// ```
/// # use hrv_sonar::protocol::estimate_distance;
/// // RSSI equal to -tx_power → exactly one metre.
/// assert!((estimate_distance(-40, 40) - 1.0).abs() < 1e-12);
/// ```
pub fn estimate_distance(tx_power: i16, rssi: i16) -> f64 {
    let exponent = (-(tx_power as f64) - rssi as f64) / (10.0 * PATH_LOSS_EXPONENT);
    10f64.powf(exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_their_services() {
        assert_eq!(
            CharacteristicKind::DeviceId.service(),
            IDENTIFICATION_SERVICE_UUID
        );
        assert_eq!(
            CharacteristicKind::UltrasonicDetected.service(),
            IDENTIFICATION_SERVICE_UUID
        );
        assert_eq!(CharacteristicKind::PeakInterval.service(), HRV_SERVICE_UUID);
    }

    #[test]
    fn uuid_lookup_is_inverse_of_uuid() {
        for kind in CharacteristicKind::ALL {
            assert_eq!(CharacteristicKind::from_uuid(kind.uuid()), Some(kind));
        }
        assert_eq!(
            CharacteristicKind::from_uuid(IDENTIFICATION_SERVICE_UUID),
            None
        );
    }

    #[test]
    fn distance_grows_as_signal_weakens() {
        let near = estimate_distance(-59, -50);
        let far = estimate_distance(-59, -80);
        assert!(far > near);

        // -tx - rssi = 40 → 10^1
        assert!((estimate_distance(-20, -20) - 10.0).abs() < 1e-9);
    }
}

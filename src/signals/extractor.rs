use std::collections::HashMap;

use super::{ByteOrder, SignalDefinition, VehicleProfile};
use crate::error::SignalDecodeError;
use crate::segment::CanFrame;

/// A decoded physical value
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSample {
    pub name: String,
    /// Index within a multi-slot signal, 0 for single definitions
    pub slot: usize,
    pub time_ns: u64,
    pub value: f64,
}

#[derive(Debug, Clone)]
struct CompiledSignal {
    name: String,
    slot: usize,
    bus: Option<u8>,
    /// Bit positions, most significant first
    positions: Vec<u16>,
    min_length: usize,
    signed: bool,
    scale: f64,
    offset: f64,
}

/// Generic CAN decoder driven entirely by a `VehicleProfile`
#[derive(Debug, Clone)]
pub struct SignalExtractor {
    profile_name: String,
    by_address: HashMap<u32, Vec<CompiledSignal>>,
}

impl SignalExtractor {
    pub fn new(profile: &VehicleProfile) -> Self {
        let mut by_address: HashMap<u32, Vec<CompiledSignal>> = HashMap::new();
        for (name, spec) in &profile.signals {
            for (slot, def) in spec.definitions().iter().enumerate() {
                // Profiles are validated on load, so layouts always resolve
                let Some(positions) = bit_positions(def) else {
                    continue;
                };
                let needed = positions
                    .iter()
                    .map(|&p| p as usize / 8 + 1)
                    .max()
                    .unwrap_or(0);
                by_address.entry(def.address).or_default().push(CompiledSignal {
                    name: name.clone(),
                    slot,
                    bus: def.bus,
                    positions,
                    min_length: def.min_length.map(usize::from).unwrap_or(needed),
                    signed: def.signed,
                    scale: def.scale,
                    offset: def.offset,
                });
            }
        }
        Self {
            profile_name: profile.name.clone(),
            by_address,
        }
    }

    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    /// Decode every profile signal carried by `frame`.
    ///
    /// Frames the profile does not mention yield an empty list. A matching
    /// frame that fails validation is rejected as a whole.
    pub fn extract(
        &self,
        frame: &CanFrame,
        time_ns: u64,
    ) -> Result<Vec<SignalSample>, SignalDecodeError> {
        let Some(signals) = self.by_address.get(&frame.address) else {
            return Ok(Vec::new());
        };

        let mut samples = Vec::new();
        for signal in signals
            .iter()
            .filter(|s| s.bus.map_or(true, |bus| bus == frame.bus))
        {
            let error = |reason: String| SignalDecodeError {
                signal: signal.name.clone(),
                bus: frame.bus,
                address: frame.address,
                reason,
            };
            if frame.data.len() < signal.min_length {
                return Err(error(format!(
                    "payload is {} bytes, profile requires {}",
                    frame.data.len(),
                    signal.min_length
                )));
            }
            let raw = read_bits(&frame.data, &signal.positions).ok_or_else(|| {
                error(format!(
                    "bit layout reaches past the {}-byte payload",
                    frame.data.len()
                ))
            })?;
            let raw = if signal.signed {
                sign_extend(raw, signal.positions.len()) as f64
            } else {
                raw as f64
            };
            samples.push(SignalSample {
                name: signal.name.clone(),
                slot: signal.slot,
                time_ns,
                value: raw * signal.scale + signal.offset,
            });
        }
        Ok(samples)
    }
}

/// Bit positions covered by a definition, most significant bit first.
/// `None` when the layout overflows the position range.
pub(crate) fn bit_positions(def: &SignalDefinition) -> Option<Vec<u16>> {
    let length = u32::from(def.length);
    let start = u32::from(def.start_bit);
    let mut positions = Vec::with_capacity(length as usize);
    match def.byte_order {
        ByteOrder::LittleEndian => {
            let end = start.checked_add(length)?;
            for p in (start..end).rev() {
                positions.push(u16::try_from(p).ok()?);
            }
        }
        ByteOrder::BigEndian => {
            // Motorola sawtooth: walk down within a byte, then to bit 7 of the next
            let mut pos = start;
            for i in 0..length {
                positions.push(u16::try_from(pos).ok()?);
                if i + 1 < length {
                    pos = if pos % 8 == 0 { pos + 15 } else { pos - 1 };
                }
            }
        }
    }
    Some(positions)
}

fn read_bits(data: &[u8], positions: &[u16]) -> Option<u64> {
    let mut value = 0u64;
    for &p in positions {
        let byte = *data.get(p as usize / 8)?;
        let bit = (byte >> (p % 8)) & 1;
        value = (value << 1) | u64::from(bit);
    }
    Some(value)
}

fn sign_extend(raw: u64, bits: usize) -> i64 {
    if bits == 0 || bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits as u32;
    ((raw << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::tests::PROFILE_JSON;
    use crate::signals::{ProfileSet, SignalSpec, ODOMETER, STEERING_DRIVER_TORQUE};
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn extractor(name: &str) -> SignalExtractor {
        let set = ProfileSet::from_json(PROFILE_JSON).unwrap();
        SignalExtractor::new(set.get(name).unwrap())
    }

    #[test]
    fn test_little_endian_odometer() {
        let ex = extractor("hyundai_ioniq5");
        // 24 bits from bit 40: bytes 5..8, value 0x01_86_A0 = 100000 -> 10000.0 km
        let frame = CanFrame::new(0, 1264, vec![0, 0, 0, 0, 0, 0xA0, 0x86, 0x01]);
        let samples = ex.extract(&frame, 42).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, ODOMETER);
        assert_eq!(samples[0].time_ns, 42);
        assert_relative_eq!(samples[0].value, 10_000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_scale_and_offset() {
        let ex = extractor("hyundai_ioniq5");
        // raw 12 bits = 0x0AA0 = 2720 -> 27.20 - 20.48 = 6.72
        let frame = CanFrame::new(0, 593, vec![0xA0, 0xFA, 0, 0, 0, 0, 0, 0]);
        let samples = ex.extract(&frame, 0).unwrap();
        assert_eq!(samples[0].name, STEERING_DRIVER_TORQUE);
        assert_relative_eq!(samples[0].value, 6.72, epsilon = 1e-9);
    }

    #[test]
    fn test_big_endian_signed() {
        let ex = extractor("KIA_EV6");
        // MSB at bit 7: byte0 then the high nibble of byte1; 0xFFF signed = -1
        let frame = CanFrame::new(2, 593, vec![0xFF, 0xF0]);
        let samples = ex.extract(&frame, 0).unwrap();
        assert_relative_eq!(samples[0].value, -0.01, epsilon = 1e-12);

        let frame = CanFrame::new(2, 593, vec![0x12, 0x30]);
        let samples = ex.extract(&frame, 0).unwrap();
        assert_relative_eq!(samples[0].value, 0x123 as f64 * 0.01, epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_address_and_wrong_bus_are_dropped() {
        let ex = extractor("hyundai_ioniq5");
        assert!(ex.extract(&CanFrame::new(0, 0x7ff, vec![0; 8]), 0).unwrap().is_empty());
        // torque is pinned to bus 0
        assert!(ex.extract(&CanFrame::new(1, 593, vec![0; 8]), 0).unwrap().is_empty());
    }

    #[test]
    fn test_short_payload_is_decode_error() {
        let ex = extractor("hyundai_ioniq5");
        let err = ex.extract(&CanFrame::new(0, 593, vec![0xA0, 0x0A]), 0).unwrap_err();
        assert_eq!(err.signal, STEERING_DRIVER_TORQUE);
        assert_eq!(err.address, 593);
        assert!(err.reason.contains("requires 8"));
    }

    #[test]
    fn test_min_length_below_layout_still_checks_bits() {
        let mut signals = BTreeMap::new();
        signals.insert(
            "odometer".to_string(),
            SignalSpec::One(SignalDefinition {
                bus: None,
                address: 10,
                start_bit: 16,
                length: 8,
                byte_order: ByteOrder::LittleEndian,
                signed: false,
                scale: 1.0,
                offset: 0.0,
                min_length: Some(1),
            }),
        );
        let profile = VehicleProfile {
            name: "tiny".to_string(),
            fingerprints: Vec::new(),
            signals,
        };
        let ex = SignalExtractor::new(&profile);
        let err = ex.extract(&CanFrame::new(0, 10, vec![1, 2]), 0).unwrap_err();
        assert!(err.reason.contains("past"));
        let ok = ex.extract(&CanFrame::new(0, 10, vec![1, 2, 3]), 0).unwrap();
        assert_eq!(ok[0].value, 3.0);
    }

    #[test]
    fn test_multi_slot_signal() {
        let ex = extractor("hyundai_ioniq5");
        let samples = ex.extract(&CanFrame::new(3, 1265, vec![0b10]), 7).unwrap();
        assert_eq!(samples.len(), 2);
        let slot0 = samples.iter().find(|s| s.slot == 0).unwrap();
        let slot1 = samples.iter().find(|s| s.slot == 1).unwrap();
        assert_eq!(slot0.value, 0.0);
        assert_eq!(slot1.value, 1.0);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0x80, 8), -128);
        assert_eq!(sign_extend(0x7f, 8), 127);
        assert_eq!(sign_extend(u64::MAX, 64), -1);
        assert_eq!(sign_extend((1u64 << 63) - 1, 63), -1);
        assert_eq!(sign_extend(1u64 << 62, 63), -(1i64 << 62));
        assert_eq!(sign_extend(1, 1), -1);
    }
}

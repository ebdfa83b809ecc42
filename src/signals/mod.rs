//! Vehicle profiles: declarative CAN signal definitions selected by fingerprint.

pub mod extractor;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub use extractor::{SignalExtractor, SignalSample};

pub const STEERING_DRIVER_TORQUE: &str = "steering_driver_torque";
pub const ODOMETER: &str = "odometer";
pub const CRUISE_STATE: &str = "cruise_state";

/// Largest CAN-FD payload a signal may address
pub const MAX_FRAME_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel layout: start bit is the LSB, bits grow upward
    LittleEndian,
    /// Motorola layout (DBC convention): start bit is the MSB
    BigEndian,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalDefinition {
    /// `None` matches the address on any bus
    #[serde(default)]
    pub bus: Option<u8>,
    pub address: u32,
    pub start_bit: u16,
    pub length: u8,
    #[serde(default = "default_byte_order")]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Minimum payload length a frame must declare; defaults to the bytes
    /// the bit layout touches
    #[serde(default)]
    pub min_length: Option<u8>,
}

fn default_byte_order() -> ByteOrder {
    ByteOrder::LittleEndian
}

fn default_scale() -> f64 {
    1.0
}

/// One definition, or several slots (e.g. individual cruise buttons)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalSpec {
    One(SignalDefinition),
    Many(Vec<SignalDefinition>),
}

impl SignalSpec {
    pub fn definitions(&self) -> &[SignalDefinition] {
        match self {
            SignalSpec::One(def) => std::slice::from_ref(def),
            SignalSpec::Many(defs) => defs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleProfile {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub fingerprints: Vec<String>,
    pub signals: BTreeMap<String, SignalSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileFile {
    #[serde(default)]
    default_profile: Option<String>,
    #[serde(default)]
    profiles: BTreeMap<String, VehicleProfile>,
}

/// All profiles loaded for a run. Read-only after load.
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    profiles: BTreeMap<String, VehicleProfile>,
    by_fingerprint: HashMap<String, String>,
    default_profile: Option<String>,
}

/// How a drive's profile was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileMatch {
    Override,
    Fingerprint,
    Name,
    Default,
}

impl ProfileSet {
    /// Load the profile file. A missing file yields an empty set; anything
    /// malformed is a `ProfileConfig` error.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!(
                    "Vehicle profile config not found at {}; continuing without CAN decoding",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(e) => return Err(profile_error(path, e.to_string())),
        };
        Self::from_json(&text).map_err(|reason| profile_error(path, reason))
    }

    pub fn from_json(text: &str) -> Result<Self, String> {
        let file: ProfileFile = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let mut profiles = BTreeMap::new();
        let mut by_fingerprint = HashMap::new();

        for (name, mut profile) in file.profiles {
            profile.name = name.clone();
            validate_profile(&profile)?;
            for fingerprint in &profile.fingerprints {
                if let Some(other) = by_fingerprint.insert(fingerprint.clone(), name.clone()) {
                    return Err(format!(
                        "fingerprint {} claimed by both {} and {}",
                        fingerprint, other, name
                    ));
                }
            }
            profiles.insert(name, profile);
        }

        let default_profile = file.default_profile.filter(|name| !name.is_empty());
        if let Some(name) = &default_profile {
            if !profiles.contains_key(name) {
                return Err(format!("default_profile {} is not defined", name));
            }
        }

        Ok(Self {
            profiles,
            by_fingerprint,
            default_profile,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn get(&self, name: &str) -> Option<&VehicleProfile> {
        self.profiles.get(name)
    }

    /// Pick the profile for a drive: override, then fingerprint list, then a
    /// profile named after the fingerprint, then the default profile (only
    /// when the drive reported no fingerprint).
    pub fn resolve(
        &self,
        fingerprint: Option<&str>,
        override_name: Option<&str>,
    ) -> Option<(&VehicleProfile, ProfileMatch)> {
        if let Some(name) = override_name {
            return self.profiles.get(name).map(|p| (p, ProfileMatch::Override));
        }
        match fingerprint {
            Some(fp) => {
                if let Some(name) = self.by_fingerprint.get(fp) {
                    return self.profiles.get(name).map(|p| (p, ProfileMatch::Fingerprint));
                }
                self.profiles.get(fp).map(|p| (p, ProfileMatch::Name))
            }
            None => self
                .default_profile
                .as_deref()
                .and_then(|name| self.profiles.get(name))
                .map(|p| (p, ProfileMatch::Default)),
        }
    }
}

fn profile_error(path: &Path, reason: String) -> EngineError {
    EngineError::ProfileConfig {
        path: path.display().to_string(),
        reason,
    }
}

fn validate_profile(profile: &VehicleProfile) -> Result<(), String> {
    if profile.signals.is_empty() {
        return Err(format!("profile {} defines no signals", profile.name));
    }
    for (signal, spec) in &profile.signals {
        let defs = spec.definitions();
        if defs.is_empty() {
            return Err(format!("{}.{}: empty signal list", profile.name, signal));
        }
        for def in defs {
            validate_definition(def)
                .map_err(|reason| format!("{}.{}: {}", profile.name, signal, reason))?;
        }
    }
    Ok(())
}

fn validate_definition(def: &SignalDefinition) -> Result<(), String> {
    if def.length == 0 || def.length > 64 {
        return Err(format!("length {} outside 1..=64", def.length));
    }
    if !def.scale.is_finite() || !def.offset.is_finite() {
        return Err("scale and offset must be finite".to_string());
    }
    if let Some(min_length) = def.min_length {
        if min_length as usize > MAX_FRAME_BYTES {
            return Err(format!("min_length {} exceeds {}", min_length, MAX_FRAME_BYTES));
        }
    }
    match extractor::bit_positions(def) {
        Some(positions) if positions.iter().all(|&p| (p as usize) < MAX_FRAME_BYTES * 8) => Ok(()),
        _ => Err(format!(
            "bits start {} length {} fall outside a {}-byte frame",
            def.start_bit, def.length, MAX_FRAME_BYTES
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const PROFILE_JSON: &str = r#"{
        "default_profile": "",
        "profiles": {
            "hyundai_ioniq5": {
                "fingerprints": ["HYUNDAI_IONIQ_5", "HYUNDAI_IONIQ_5_2023"],
                "signals": {
                    "steering_driver_torque": {
                        "bus": 0, "address": 593, "start_bit": 0, "length": 12,
                        "scale": 0.01, "offset": -20.48, "min_length": 8
                    },
                    "odometer": {
                        "bus": 0, "address": 1264, "start_bit": 40, "length": 24, "scale": 0.1
                    },
                    "cruise_state": [
                        { "address": 1265, "start_bit": 0, "length": 1 },
                        { "address": 1265, "start_bit": 1, "length": 1 }
                    ]
                }
            },
            "KIA_EV6": {
                "signals": {
                    "steering_driver_torque": {
                        "address": 593, "start_bit": 7, "length": 12,
                        "byte_order": "big_endian", "signed": true, "scale": 0.01
                    }
                }
            }
        }
    }"#;

    #[test]
    fn test_load_and_resolve() {
        let set = ProfileSet::from_json(PROFILE_JSON).unwrap();
        assert_eq!(set.len(), 2);

        let (profile, how) = set.resolve(Some("HYUNDAI_IONIQ_5_2023"), None).unwrap();
        assert_eq!(profile.name, "hyundai_ioniq5");
        assert_eq!(how, ProfileMatch::Fingerprint);

        let (profile, how) = set.resolve(Some("KIA_EV6"), None).unwrap();
        assert_eq!(profile.name, "KIA_EV6");
        assert_eq!(how, ProfileMatch::Name);

        assert!(set.resolve(Some("TOYOTA_PRIUS"), None).is_none());
        assert!(set.resolve(None, None).is_none());

        let (profile, how) = set.resolve(Some("TOYOTA_PRIUS"), Some("KIA_EV6")).unwrap();
        assert_eq!(profile.name, "KIA_EV6");
        assert_eq!(how, ProfileMatch::Override);
    }

    #[test]
    fn test_default_profile_only_without_fingerprint() {
        let json = PROFILE_JSON.replace(r#""default_profile": """#, r#""default_profile": "KIA_EV6""#);
        let set = ProfileSet::from_json(&json).unwrap();
        assert_eq!(set.resolve(None, None).unwrap().1, ProfileMatch::Default);
        assert!(set.resolve(Some("TOYOTA_PRIUS"), None).is_none());
    }

    #[test]
    fn test_rejects_bad_definitions() {
        let bad_length = r#"{ "profiles": { "x": { "signals": {
            "odometer": { "address": 1, "start_bit": 0, "length": 0 } } } } }"#;
        assert!(ProfileSet::from_json(bad_length).unwrap_err().contains("length"));

        let out_of_frame = r#"{ "profiles": { "x": { "signals": {
            "odometer": { "address": 1, "start_bit": 510, "length": 8 } } } } }"#;
        assert!(ProfileSet::from_json(out_of_frame).unwrap_err().contains("outside"));

        let duplicate = r#"{ "profiles": {
            "a": { "fingerprints": ["FP"], "signals": { "odometer": { "address": 1, "start_bit": 0, "length": 8 } } },
            "b": { "fingerprints": ["FP"], "signals": { "odometer": { "address": 1, "start_bit": 0, "length": 8 } } } } }"#;
        assert!(ProfileSet::from_json(duplicate).unwrap_err().contains("claimed"));

        let unknown_default = r#"{ "default_profile": "nope", "profiles": {} }"#;
        assert!(ProfileSet::from_json(unknown_default).is_err());

        assert!(ProfileSet::from_json("{ broken").is_err());
    }

    #[test]
    fn test_rejects_misspelled_keys() {
        let misspelled_signal = r#"{ "profiles": { "x": { "signals": {
            "steering_driver_torque": { "address": 593, "start_bit": 0, "length": 16,
                "signd": true, "scael": 0.01 } } } } }"#;
        assert!(ProfileSet::from_json(misspelled_signal).is_err());

        let misspelled_profile = r#"{ "profiles": { "x": { "fingerprint": ["FP"], "signals": {
            "odometer": { "address": 1, "start_bit": 0, "length": 8 } } } } }"#;
        assert!(ProfileSet::from_json(misspelled_profile)
            .unwrap_err()
            .contains("fingerprint"));

        let misspelled_top = r#"{ "default": "x", "profiles": {} }"#;
        assert!(ProfileSet::from_json(misspelled_top).is_err());

        let slot_list = r#"{ "profiles": { "x": { "signals": {
            "cruise_state": [ { "address": 1, "start_bit": 0, "length": 1, "ofset": 1.0 } ] } } } }"#;
        assert!(ProfileSet::from_json(slot_list).is_err());
    }

    #[test]
    fn test_load_missing_file_is_empty_but_malformed_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let set = ProfileSet::load(&dir.path().join("missing.json")).unwrap();
        assert!(set.is_empty());

        let path = dir.path().join("profiles.json");
        fs::write(&path, "[1, 2").unwrap();
        let err = ProfileSet::load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProfileConfig);
    }
}

//! Log segments: one compressed file per (device, drive, segment index).

pub mod codec;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use codec::{encode_segment, encode_segment_with_version, SegmentDecoder};

/// Container magic: "DRLG"
pub const MAGIC: [u8; 4] = *b"DRLG";
/// Version written by `encode_segment`
pub const FORMAT_VERSION: u16 = 1;
pub const MIN_SUPPORTED_VERSION: u16 = 1;
/// magic + version + flags + start_mono_ns + record_count + body_len + crc
pub const HEADER_LEN: usize = 4 + 2 + 2 + 8 + 4 + 4 + 4;

pub const KIND_INIT_DATA: u8 = 1;
pub const KIND_CAR_PARAMS: u8 = 2;
pub const KIND_CAR_STATE: u8 = 3;
pub const KIND_CONTROLS_STATE: u8 = 4;
pub const KIND_CAN: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId {
    pub device_id: String,
    pub drive: String,
    pub index: u32,
}

impl SegmentId {
    pub fn new(device_id: impl Into<String>, drive: impl Into<String>, index: u32) -> Self {
        Self {
            device_id: device_id.into(),
            drive: drive.into(),
            index,
        }
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}--{}", self.device_id, self.drive, self.index)
    }
}

/// One decoded segment. Immutable once produced by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSegment {
    pub id: SegmentId,
    pub version: u16,
    /// Segment start on the drive's monotonic clock (ns)
    pub start_mono_ns: u64,
    pub records: Vec<DecodedRecord>,
}

impl LogSegment {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Drive clock value of a record in this segment
    pub fn drive_time_ns(&self, record: &DecodedRecord) -> u64 {
        self.start_mono_ns.saturating_add(record.offset_ns)
    }

    pub fn first_time_ns(&self) -> Option<u64> {
        self.records.first().map(|r| self.drive_time_ns(r))
    }

    pub fn last_time_ns(&self) -> Option<u64> {
        self.records.last().map(|r| self.drive_time_ns(r))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    /// Offset from segment start, exactly as encoded
    pub offset_ns: u64,
    pub payload: RecordPayload,
}

impl DecodedRecord {
    pub fn new(offset_ns: u64, payload: RecordPayload) -> Self {
        Self { offset_ns, payload }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    InitData(InitData),
    CarParams(CarParams),
    CarState(CarState),
    ControlsState(ControlsState),
    Can(Vec<CanFrame>),
    /// Record kind this build does not interpret; payload skipped
    Unknown { kind: u8 },
}

impl RecordPayload {
    pub fn kind(&self) -> u8 {
        match self {
            RecordPayload::InitData(_) => KIND_INIT_DATA,
            RecordPayload::CarParams(_) => KIND_CAR_PARAMS,
            RecordPayload::CarState(_) => KIND_CAR_STATE,
            RecordPayload::ControlsState(_) => KIND_CONTROLS_STATE,
            RecordPayload::Can(_) => KIND_CAN,
            RecordPayload::Unknown { kind } => *kind,
        }
    }
}

/// Software/hardware metadata written once at the start of a drive.
/// Empty strings mean "not reported".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitData {
    pub version: String,
    pub git_branch: String,
    pub git_commit: String,
    pub device_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarParams {
    pub fingerprint: String,
    pub openpilot_longitudinal: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CarState {
    /// Vehicle speed (m/s)
    pub v_ego: f32,
    pub steering_angle_deg: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlsState {
    pub enabled: bool,
    /// Reason code reported alongside a disengagement, 0 when none
    pub disengage_reason: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub bus: u8,
    pub address: u32,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(bus: u8, address: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            bus,
            address,
            data: data.into(),
        }
    }
}

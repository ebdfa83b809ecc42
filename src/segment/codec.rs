use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{
    CanFrame, CarParams, CarState, ControlsState, DecodedRecord, InitData, LogSegment,
    RecordPayload, SegmentId, FORMAT_VERSION, HEADER_LEN, KIND_CAN, KIND_CAR_PARAMS,
    KIND_CAR_STATE, KIND_CONTROLS_STATE, KIND_INIT_DATA, MAGIC,
};
use crate::config::DecoderConfig;
use crate::error::{EngineError, EngineResult};

/// Decodes gzip-compressed segment containers into typed records.
///
/// Decoding is all-or-nothing: a truncated or inconsistent file is an
/// error, never a shortened record list.
#[derive(Debug, Clone)]
pub struct SegmentDecoder {
    min_version: u16,
    max_version: u16,
}

impl SegmentDecoder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            min_version: config.min_version,
            max_version: config.max_version,
        }
    }

    pub fn decode_file(&self, id: SegmentId, path: &Path) -> EngineResult<LogSegment> {
        let compressed = fs::read(path).map_err(|source| EngineError::SegmentRead {
            path: path.to_path_buf(),
            source,
        })?;
        self.decode(id, &compressed)
    }

    pub fn decode(&self, id: SegmentId, compressed: &[u8]) -> EngineResult<LogSegment> {
        // Every gzip member is read so bytes appended after the first one
        // show up as a body length mismatch
        let mut raw = Vec::new();
        MultiGzDecoder::new(compressed)
            .read_to_end(&mut raw)
            .map_err(|e| EngineError::corrupt(id.to_string(), format!("gzip: {}", e)))?;

        let corrupt = |reason: String| EngineError::corrupt(id.to_string(), reason);

        if raw.len() < HEADER_LEN {
            return Err(corrupt(format!(
                "container too short: {} bytes, header needs {}",
                raw.len(),
                HEADER_LEN
            )));
        }

        let mut header = ByteReader::new(&raw[..HEADER_LEN]);
        let magic = header.bytes(4).map_err(&corrupt)?;
        if magic != MAGIC {
            return Err(corrupt(format!("bad magic {:02x?}", magic)));
        }
        let version = header.u16().map_err(&corrupt)?;
        if version < self.min_version || version > self.max_version {
            return Err(EngineError::UnsupportedVersion {
                segment: id.to_string(),
                version,
                min: self.min_version,
                max: self.max_version,
            });
        }
        let _flags = header.u16().map_err(&corrupt)?;
        let start_mono_ns = header.u64().map_err(&corrupt)?;
        let record_count = header.u32().map_err(&corrupt)? as usize;
        let body_len = header.u32().map_err(&corrupt)? as usize;
        let expected_crc = header.u32().map_err(&corrupt)?;

        let body = &raw[HEADER_LEN..];
        if body.len() != body_len {
            return Err(corrupt(format!(
                "declared body length {} but found {} bytes",
                body_len,
                body.len()
            )));
        }
        let actual_crc = crc32c::crc32c(body);
        if actual_crc != expected_crc {
            return Err(corrupt(format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                expected_crc, actual_crc
            )));
        }

        let mut reader = ByteReader::new(body);
        let mut records = Vec::with_capacity(record_count.min(1 << 20));
        let mut last_offset = 0u64;
        while !reader.is_empty() {
            if records.len() == record_count {
                return Err(corrupt(format!(
                    "more records than the declared {}",
                    record_count
                )));
            }
            let record = read_record(&mut reader).map_err(|e| {
                corrupt(format!("record {}: {}", records.len(), e))
            })?;
            if record.offset_ns < last_offset {
                return Err(corrupt(format!(
                    "record {} goes back in time ({} < {})",
                    records.len(),
                    record.offset_ns,
                    last_offset
                )));
            }
            last_offset = record.offset_ns;
            records.push(record);
        }
        if records.len() != record_count {
            return Err(corrupt(format!(
                "declared {} records but decoded {}",
                record_count,
                records.len()
            )));
        }

        Ok(LogSegment {
            id,
            version,
            start_mono_ns,
            records,
        })
    }
}

fn read_record(reader: &mut ByteReader<'_>) -> Result<DecodedRecord, String> {
    let kind = reader.u8()?;
    let offset_ns = reader.u64()?;
    let payload_len = reader.u32()? as usize;
    let payload_bytes = reader.bytes(payload_len)?;
    let mut payload = ByteReader::new(payload_bytes);

    let decoded = match kind {
        KIND_INIT_DATA => RecordPayload::InitData(InitData {
            version: payload.string()?,
            git_branch: payload.string()?,
            git_commit: payload.string()?,
            device_type: payload.string()?,
        }),
        KIND_CAR_PARAMS => {
            let fingerprint = payload.string()?;
            let flags = payload.u8()?;
            RecordPayload::CarParams(CarParams {
                fingerprint,
                openpilot_longitudinal: flags & 0x01 != 0,
            })
        }
        KIND_CAR_STATE => RecordPayload::CarState(CarState {
            v_ego: payload.f32()?,
            steering_angle_deg: payload.f32()?,
        }),
        KIND_CONTROLS_STATE => RecordPayload::ControlsState(ControlsState {
            enabled: payload.u8()? != 0,
            disengage_reason: payload.u16()?,
        }),
        KIND_CAN => {
            let count = payload.u16()? as usize;
            let mut frames = Vec::with_capacity(count);
            for _ in 0..count {
                let bus = payload.u8()?;
                let address = payload.u32()?;
                let len = payload.u8()? as usize;
                let data = payload.bytes(len)?.to_vec();
                frames.push(CanFrame { bus, address, data });
            }
            RecordPayload::Can(frames)
        }
        other => {
            log::debug!("Skipping unknown record kind {} ({} bytes)", other, payload_len);
            return Ok(DecodedRecord::new(offset_ns, RecordPayload::Unknown { kind: other }));
        }
    };

    if !payload.is_empty() {
        return Err(format!(
            "kind {} payload has {} trailing bytes",
            kind,
            payload.remaining()
        ));
    }
    Ok(DecodedRecord::new(offset_ns, decoded))
}

/// Encode records into a compressed segment container at the current version
pub fn encode_segment(start_mono_ns: u64, records: &[DecodedRecord]) -> io::Result<Vec<u8>> {
    encode_segment_with_version(FORMAT_VERSION, start_mono_ns, records)
}

pub fn encode_segment_with_version(
    version: u16,
    start_mono_ns: u64,
    records: &[DecodedRecord],
) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    for record in records {
        let payload = encode_payload(&record.payload)?;
        body.push(record.payload.kind());
        body.extend_from_slice(&record.offset_ns.to_le_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&payload);
    }

    let mut raw = Vec::with_capacity(HEADER_LEN + body.len());
    raw.extend_from_slice(&MAGIC);
    raw.extend_from_slice(&version.to_le_bytes());
    raw.extend_from_slice(&0u16.to_le_bytes());
    raw.extend_from_slice(&start_mono_ns.to_le_bytes());
    raw.extend_from_slice(&(records.len() as u32).to_le_bytes());
    raw.extend_from_slice(&(body.len() as u32).to_le_bytes());
    raw.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
    raw.extend_from_slice(&body);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    encoder.finish()
}

fn encode_payload(payload: &RecordPayload) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match payload {
        RecordPayload::InitData(init) => {
            put_string(&mut out, &init.version)?;
            put_string(&mut out, &init.git_branch)?;
            put_string(&mut out, &init.git_commit)?;
            put_string(&mut out, &init.device_type)?;
        }
        RecordPayload::CarParams(params) => {
            put_string(&mut out, &params.fingerprint)?;
            out.push(u8::from(params.openpilot_longitudinal));
        }
        RecordPayload::CarState(state) => {
            out.extend_from_slice(&state.v_ego.to_le_bytes());
            out.extend_from_slice(&state.steering_angle_deg.to_le_bytes());
        }
        RecordPayload::ControlsState(controls) => {
            out.push(u8::from(controls.enabled));
            out.extend_from_slice(&controls.disengage_reason.to_le_bytes());
        }
        RecordPayload::Can(frames) => {
            let count = u16::try_from(frames.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "too many CAN frames in one record")
            })?;
            out.extend_from_slice(&count.to_le_bytes());
            for frame in frames {
                let len = u8::try_from(frame.data.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "CAN payload longer than 255 bytes")
                })?;
                out.push(frame.bus);
                out.extend_from_slice(&frame.address.to_le_bytes());
                out.push(len);
                out.extend_from_slice(&frame.data);
            }
        }
        RecordPayload::Unknown { .. } => {}
    }
    Ok(out)
}

fn put_string(out: &mut Vec<u8>, value: &str) -> io::Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string field too long"))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Little-endian cursor over a byte slice
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], String> {
        if self.remaining() < len {
            return Err(format!(
                "unexpected end of data: need {} bytes, {} left",
                len,
                self.remaining()
            ));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, String> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, String> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| format!("invalid UTF-8 string: {}", e))
    }
}

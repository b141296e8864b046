//! Binary wire protocol: packet types, framing, and the streaming codec.
//!
//! Compatibility target is the Gearman protocol as documented at
//! gearman.org/protocol: a 12-byte header (4-byte magic, 4-byte big-endian
//! type, 4-byte big-endian payload length) followed by a payload whose
//! fields are separated by NUL bytes.

mod codec;

pub use codec::{decode, encode, CodecError};

/// Header size; also the minimum length of any valid packet.
pub const HEADER_LEN: usize = 12;

/// Payloads above this size are rejected as malformed rather than buffered.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

pub const MAGIC_REQUEST: &[u8; 4] = b"\0REQ";
pub const MAGIC_RESPONSE: &[u8; 4] = b"\0RES";

/// Packet direction marker from the 4-byte magic prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    pub fn as_bytes(&self) -> &'static [u8; 4] {
        match self {
            Magic::Request => MAGIC_REQUEST,
            Magic::Response => MAGIC_RESPONSE,
        }
    }
}

/// Packet type codes from the published Gearman protocol.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    CanDo = 1,
    CantDo = 2,
    ResetAbilities = 3,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    StatusRes = 20,
    SubmitJobHigh = 21,
    SetClientId = 22,
    CanDoTimeout = 23,
    WorkException = 25,
    OptionReq = 26,
    OptionRes = 27,
    WorkData = 28,
    WorkWarning = 29,
    GrabJobUniq = 30,
    JobAssignUniq = 31,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
    SubmitJobSched = 35,
    SubmitJobEpoch = 36,
}

impl TryFrom<u32> for PacketType {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, CodecError> {
        use PacketType::*;
        Ok(match value {
            1 => CanDo,
            2 => CantDo,
            3 => ResetAbilities,
            4 => PreSleep,
            6 => Noop,
            7 => SubmitJob,
            8 => JobCreated,
            9 => GrabJob,
            10 => NoJob,
            11 => JobAssign,
            12 => WorkStatus,
            13 => WorkComplete,
            14 => WorkFail,
            15 => GetStatus,
            16 => EchoReq,
            17 => EchoRes,
            18 => SubmitJobBg,
            19 => Error,
            20 => StatusRes,
            21 => SubmitJobHigh,
            22 => SetClientId,
            23 => CanDoTimeout,
            25 => WorkException,
            26 => OptionReq,
            27 => OptionRes,
            28 => WorkData,
            29 => WorkWarning,
            30 => GrabJobUniq,
            31 => JobAssignUniq,
            32 => SubmitJobHighBg,
            33 => SubmitJobLow,
            34 => SubmitJobLowBg,
            35 => SubmitJobSched,
            36 => SubmitJobEpoch,
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

impl PacketType {
    /// True for every SUBMIT_JOB_* variant.
    pub fn is_submit(&self) -> bool {
        use PacketType::*;
        matches!(
            self,
            SubmitJob
                | SubmitJobLow
                | SubmitJobHigh
                | SubmitJobBg
                | SubmitJobLowBg
                | SubmitJobHighBg
                | SubmitJobSched
                | SubmitJobEpoch
        )
    }
}

/// One decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub ptype: PacketType,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn request(ptype: PacketType, data: Vec<u8>) -> Self {
        Self {
            magic: Magic::Request,
            ptype,
            data,
        }
    }

    pub fn response(ptype: PacketType, data: Vec<u8>) -> Self {
        Self {
            magic: Magic::Response,
            ptype,
            data,
        }
    }

    /// Split the payload on NUL into exactly `n` fields. The final field
    /// keeps any embedded NUL bytes (it is the opaque data field).
    pub fn fields(&self, n: usize) -> Result<Vec<&[u8]>, CodecError> {
        let parts: Vec<&[u8]> = self.data.splitn(n, |b| *b == 0).collect();
        if parts.len() != n {
            return Err(CodecError::FieldCount {
                ptype: self.ptype,
                expected: n,
                got: parts.len(),
            });
        }
        Ok(parts)
    }

    /// Join payload fields with NUL separators into one exact-size buffer.
    pub fn join(fields: &[&[u8]]) -> Vec<u8> {
        let total = fields.iter().map(|f| f.len()).sum::<usize>() + fields.len().saturating_sub(1);
        let mut data = Vec::with_capacity(total);
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                data.push(0);
            }
            data.extend_from_slice(field);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_codes_round_trip() {
        for code in [1u32, 4, 7, 11, 13, 20, 23, 31, 36] {
            let pt = PacketType::try_from(code).unwrap();
            assert_eq!(pt as u32, code);
        }
    }

    #[test]
    fn unknown_and_reserved_codes_rejected() {
        assert!(PacketType::try_from(0).is_err());
        assert!(PacketType::try_from(5).is_err());
        assert!(PacketType::try_from(24).is_err());
        assert!(PacketType::try_from(99).is_err());
    }

    #[test]
    fn join_and_split_fields() {
        let data = Packet::join(&[b"h1", b"square", b"5\x00raw"]);
        let packet = Packet::response(PacketType::JobAssign, data);
        let fields = packet.fields(3).unwrap();
        assert_eq!(fields[0], b"h1");
        assert_eq!(fields[1], b"square");
        // trailing field keeps embedded NULs
        assert_eq!(fields[2], b"5\x00raw");
    }

    #[test]
    fn missing_fields_rejected() {
        let packet = Packet::response(PacketType::JobAssign, b"only-handle".to_vec());
        assert!(packet.fields(3).is_err());
    }
}

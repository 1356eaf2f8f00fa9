//! Fixed-layout message headers.
//!
//! All integers are little-endian.
//!
//! - plain:    `[u32 msg][u64 target_job][u64 source_job]` (20 bytes)
//! - extended: `[u32 msg][u8 size=36][u16 version=2][u64 target_job][u64 source_job]`
//!   `[u8 canary][u64 steam_id][i32 session_id]` (36 bytes)
//! - protobuf: `[u32 msg|PROTO_BIT][u32 header_len][CMsgProtoBufHeader]`
//! - GC plain: `[u16 version=1][u64 target_job][u64 source_job]` (18 bytes)
//! - GC protobuf: `[u32 msg|PROTO_BIT][u32 header_len][CMsgGcProtoBufHeader]`

use prost::Message;

use crate::enums::{clear_proto_bit, is_proto, set_proto_bit, EMsg, EResult};
use crate::error::{CmError, CmResult};
use crate::protobufs::gc::CMsgGcProtoBufHeader;
use crate::protobufs::{CMsgProtoBufHeader, JOB_ID_NONE};

pub const EXTENDED_HEADER_SIZE: u8 = 36;
pub const EXTENDED_HEADER_VERSION: u16 = 2;
pub const EXTENDED_HEADER_CANARY: u8 = 239;
pub const GC_HEADER_VERSION: u16 = 1;

/// Little-endian cursor over a header buffer.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> CmResult<[u8; N]> {
        let end = self.pos + N;
        let slice = self.data.get(self.pos..end).ok_or_else(|| {
            CmError::Framing(format!(
                "header truncated: need {end} bytes, have {}",
                self.data.len()
            ))
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    fn bytes(&mut self, len: usize) -> CmResult<&'a [u8]> {
        let end = self.pos + len;
        let slice = self.data.get(self.pos..end).ok_or_else(|| {
            CmError::Framing(format!(
                "protobuf header truncated: need {len} bytes, have {}",
                self.data.len().saturating_sub(self.pos)
            ))
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CmResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> CmResult<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> CmResult<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn i32(&mut self) -> CmResult<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> CmResult<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }
}

/// Read the raw message id (protobuf bit included) at the front of a frame.
pub fn peek_msg(data: &[u8]) -> CmResult<u32> {
    Reader::new(data).u32()
}

/// Plain 20-byte header used by the legacy channel-encrypt messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHdr {
    pub msg: u32,
    pub job_id_target: u64,
    pub job_id_source: u64,
}

impl MsgHdr {
    pub const SIZE: usize = 20;

    pub fn new(msg: EMsg) -> Self {
        Self {
            msg: msg.into(),
            job_id_target: JOB_ID_NONE,
            job_id_source: JOB_ID_NONE,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.msg.to_le_bytes());
        out.extend_from_slice(&self.job_id_target.to_le_bytes());
        out.extend_from_slice(&self.job_id_source.to_le_bytes());
    }

    /// Parse from the front of `data`, returning the header and bytes consumed.
    pub fn parse(data: &[u8]) -> CmResult<(Self, usize)> {
        let mut r = Reader::new(data);
        let header = Self {
            msg: r.u32()?,
            job_id_target: r.u64()?,
            job_id_source: r.u64()?,
        };
        Ok((header, r.pos))
    }
}

/// Extended 36-byte header carrying peer and session ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedMsgHdr {
    pub msg: u32,
    pub job_id_target: u64,
    pub job_id_source: u64,
    pub canary: u8,
    pub steam_id: u64,
    pub session_id: i32,
}

impl ExtendedMsgHdr {
    pub const SIZE: usize = EXTENDED_HEADER_SIZE as usize;

    pub fn new(msg: EMsg) -> Self {
        Self {
            msg: msg.into(),
            job_id_target: JOB_ID_NONE,
            job_id_source: JOB_ID_NONE,
            canary: EXTENDED_HEADER_CANARY,
            steam_id: 0,
            session_id: 0,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.msg.to_le_bytes());
        out.push(EXTENDED_HEADER_SIZE);
        out.extend_from_slice(&EXTENDED_HEADER_VERSION.to_le_bytes());
        out.extend_from_slice(&self.job_id_target.to_le_bytes());
        out.extend_from_slice(&self.job_id_source.to_le_bytes());
        out.push(self.canary);
        out.extend_from_slice(&self.steam_id.to_le_bytes());
        out.extend_from_slice(&self.session_id.to_le_bytes());
    }

    pub fn parse(data: &[u8]) -> CmResult<(Self, usize)> {
        let mut r = Reader::new(data);
        let msg = r.u32()?;
        let size = r.u8()?;
        let version = r.u16()?;
        if size != EXTENDED_HEADER_SIZE {
            return Err(CmError::Framing(format!(
                "extended header size {size}, expected {EXTENDED_HEADER_SIZE}"
            )));
        }
        if version != EXTENDED_HEADER_VERSION {
            return Err(CmError::Framing(format!(
                "extended header version {version}, expected {EXTENDED_HEADER_VERSION}"
            )));
        }
        let header = Self {
            msg,
            job_id_target: r.u64()?,
            job_id_source: r.u64()?,
            canary: r.u8()?,
            steam_id: r.u64()?,
            session_id: r.i32()?,
        };
        Ok((header, r.pos))
    }
}

/// Protobuf-wrapped header. `msg` is stored without the protobuf bit.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoMsgHdr {
    pub msg: u32,
    pub proto: CMsgProtoBufHeader,
}

impl ProtoMsgHdr {
    /// Fixed prefix before the serialized sub-header.
    pub const PREFIX_SIZE: usize = 8;

    pub fn new(msg: EMsg) -> Self {
        Self {
            msg: msg.into(),
            proto: CMsgProtoBufHeader::default(),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let proto = self.proto.encode_to_vec();
        out.extend_from_slice(&set_proto_bit(self.msg).to_le_bytes());
        out.extend_from_slice(&(proto.len() as u32).to_le_bytes());
        out.extend_from_slice(&proto);
    }

    pub fn parse(data: &[u8]) -> CmResult<(Self, usize)> {
        let mut r = Reader::new(data);
        let raw = r.u32()?;
        if !is_proto(raw) {
            return Err(CmError::Framing(format!(
                "message {raw} is missing the protobuf bit"
            )));
        }
        let len = r.u32()? as usize;
        let proto = CMsgProtoBufHeader::decode(r.bytes(len)?)
            .map_err(|e| CmError::Framing(format!("bad protobuf header: {e}")))?;
        Ok((
            Self {
                msg: clear_proto_bit(raw),
                proto,
            },
            r.pos,
        ))
    }
}

/// Any client-protocol header.
#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    Plain(MsgHdr),
    Extended(ExtendedMsgHdr),
    Proto(ProtoMsgHdr),
}

impl Header {
    /// Pick and parse the header shape from the leading message id.
    pub fn parse(data: &[u8]) -> CmResult<(Self, usize)> {
        let raw = peek_msg(data)?;
        if is_proto(raw) {
            let (h, n) = ProtoMsgHdr::parse(data)?;
            return Ok((Header::Proto(h), n));
        }
        let plain = EMsg::try_from(raw)
            .map(EMsg::uses_plain_header)
            .unwrap_or(false);
        if plain {
            let (h, n) = MsgHdr::parse(data)?;
            Ok((Header::Plain(h), n))
        } else {
            let (h, n) = ExtendedMsgHdr::parse(data)?;
            Ok((Header::Extended(h), n))
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            Header::Plain(h) => h.write(out),
            Header::Extended(h) => h.write(out),
            Header::Proto(h) => h.write(out),
        }
    }

    /// Message id with the protobuf bit cleared.
    pub fn msg(&self) -> u32 {
        match self {
            Header::Plain(h) => h.msg,
            Header::Extended(h) => h.msg,
            Header::Proto(h) => h.msg,
        }
    }

    pub fn is_proto(&self) -> bool {
        matches!(self, Header::Proto(_))
    }

    pub fn job_id_source(&self) -> u64 {
        match self {
            Header::Plain(h) => h.job_id_source,
            Header::Extended(h) => h.job_id_source,
            Header::Proto(h) => h.proto.jobid_source(),
        }
    }

    pub fn job_id_target(&self) -> u64 {
        match self {
            Header::Plain(h) => h.job_id_target,
            Header::Extended(h) => h.job_id_target,
            Header::Proto(h) => h.proto.jobid_target(),
        }
    }

    pub fn set_job_id_source(&mut self, job: u64) {
        match self {
            Header::Plain(h) => h.job_id_source = job,
            Header::Extended(h) => h.job_id_source = job,
            Header::Proto(h) => h.proto.jobid_source = Some(job),
        }
    }

    pub fn set_job_id_target(&mut self, job: u64) {
        match self {
            Header::Plain(h) => h.job_id_target = job,
            Header::Extended(h) => h.job_id_target = job,
            Header::Proto(h) => h.proto.jobid_target = Some(job),
        }
    }

    /// Peer id, for the header shapes that carry one.
    pub fn steam_id(&self) -> Option<u64> {
        match self {
            Header::Plain(_) => None,
            Header::Extended(h) => Some(h.steam_id),
            Header::Proto(h) => h.proto.steamid,
        }
    }

    pub fn session_id(&self) -> Option<i32> {
        match self {
            Header::Plain(_) => None,
            Header::Extended(h) => Some(h.session_id),
            Header::Proto(h) => h.proto.client_sessionid,
        }
    }

    /// Stamp peer and session ids; a no-op on the plain header.
    pub fn stamp_session(&mut self, steam_id: u64, session_id: i32) {
        match self {
            Header::Plain(_) => {}
            Header::Extended(h) => {
                h.steam_id = steam_id;
                h.session_id = session_id;
            }
            Header::Proto(h) => {
                h.proto.steamid = Some(steam_id);
                h.proto.client_sessionid = Some(session_id);
            }
        }
    }

    /// The unified-message method name, if any.
    pub fn target_job_name(&self) -> Option<&str> {
        match self {
            Header::Proto(h) => h.proto.target_job_name.as_deref(),
            _ => None,
        }
    }

    pub fn eresult(&self) -> EResult {
        match self {
            Header::Proto(h) => EResult::from(h.proto.eresult()),
            _ => EResult::Ok,
        }
    }

    /// Set the result code; a no-op on the headers without one.
    pub fn set_eresult(&mut self, eresult: EResult) {
        if let Header::Proto(h) = self {
            h.proto.eresult = Some(eresult.into());
        }
    }
}

/// Plain GC header (no message id, no peer/session fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcMsgHdr {
    pub header_version: u16,
    pub job_id_target: u64,
    pub job_id_source: u64,
}

impl Default for GcMsgHdr {
    fn default() -> Self {
        Self {
            header_version: GC_HEADER_VERSION,
            job_id_target: JOB_ID_NONE,
            job_id_source: JOB_ID_NONE,
        }
    }
}

impl GcMsgHdr {
    pub const SIZE: usize = 18;

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header_version.to_le_bytes());
        out.extend_from_slice(&self.job_id_target.to_le_bytes());
        out.extend_from_slice(&self.job_id_source.to_le_bytes());
    }

    pub fn parse(data: &[u8]) -> CmResult<(Self, usize)> {
        let mut r = Reader::new(data);
        let header = Self {
            header_version: r.u16()?,
            job_id_target: r.u64()?,
            job_id_source: r.u64()?,
        };
        Ok((header, r.pos))
    }
}

/// Protobuf-wrapped GC header. `msg` is stored without the protobuf bit.
#[derive(Debug, Clone, PartialEq)]
pub struct GcProtoMsgHdr {
    pub msg: u32,
    pub proto: CMsgGcProtoBufHeader,
}

impl GcProtoMsgHdr {
    pub fn new(msg: u32) -> Self {
        Self {
            msg: clear_proto_bit(msg),
            proto: CMsgGcProtoBufHeader::default(),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let proto = self.proto.encode_to_vec();
        out.extend_from_slice(&set_proto_bit(self.msg).to_le_bytes());
        out.extend_from_slice(&(proto.len() as u32).to_le_bytes());
        out.extend_from_slice(&proto);
    }

    pub fn parse(data: &[u8]) -> CmResult<(Self, usize)> {
        let mut r = Reader::new(data);
        let raw = r.u32()?;
        if !is_proto(raw) {
            return Err(CmError::Framing(format!(
                "GC message {raw} is missing the protobuf bit"
            )));
        }
        let len = r.u32()? as usize;
        let proto = CMsgGcProtoBufHeader::decode(r.bytes(len)?)
            .map_err(|e| CmError::Framing(format!("bad GC protobuf header: {e}")))?;
        Ok((
            Self {
                msg: clear_proto_bit(raw),
                proto,
            },
            r.pos,
        ))
    }
}

/// Any GC header.
#[derive(Debug, Clone, PartialEq)]
pub enum GcHeader {
    Plain(GcMsgHdr),
    Proto(GcProtoMsgHdr),
}

impl GcHeader {
    /// Parse a GC header. `msgtype` is the raw id from the tunneling body and
    /// decides the shape.
    pub fn parse(msgtype: u32, data: &[u8]) -> CmResult<(Self, usize)> {
        if is_proto(msgtype) {
            let (h, n) = GcProtoMsgHdr::parse(data)?;
            if h.msg != clear_proto_bit(msgtype) {
                return Err(CmError::Framing(format!(
                    "GC payload id {} does not match tunneled id {}",
                    h.msg,
                    clear_proto_bit(msgtype)
                )));
            }
            Ok((GcHeader::Proto(h), n))
        } else {
            let (h, n) = GcMsgHdr::parse(data)?;
            Ok((GcHeader::Plain(h), n))
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            GcHeader::Plain(h) => h.write(out),
            GcHeader::Proto(h) => h.write(out),
        }
    }

    pub fn is_proto(&self) -> bool {
        matches!(self, GcHeader::Proto(_))
    }

    pub fn job_id_source(&self) -> u64 {
        match self {
            GcHeader::Plain(h) => h.job_id_source,
            GcHeader::Proto(h) => h.proto.job_id_source(),
        }
    }

    pub fn job_id_target(&self) -> u64 {
        match self {
            GcHeader::Plain(h) => h.job_id_target,
            GcHeader::Proto(h) => h.proto.job_id_target(),
        }
    }

    pub fn set_job_id_source(&mut self, job: u64) {
        match self {
            GcHeader::Plain(h) => h.job_id_source = job,
            GcHeader::Proto(h) => h.proto.job_id_source = Some(job),
        }
    }

    pub fn set_job_id_target(&mut self, job: u64) {
        match self {
            GcHeader::Plain(h) => h.job_id_target = job,
            GcHeader::Proto(h) => h.proto.job_id_target = Some(job),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(header: Header) {
        let mut buf = Vec::new();
        header.write(&mut buf);
        let (parsed, consumed) = Header::parse(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed, header);
    }

    #[test]
    fn plain_header_layout() {
        let header = MsgHdr {
            msg: EMsg::ChannelEncryptRequest.into(),
            job_id_target: 7,
            job_id_source: u64::MAX,
        };
        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(buf.len(), MsgHdr::SIZE);
        assert_eq!(&buf[..4], &1303u32.to_le_bytes());
        round_trip(Header::Plain(header));
    }

    #[test]
    fn extended_header_layout() {
        let header = ExtendedMsgHdr {
            msg: EMsg::ClientLogOnResponse.into(),
            job_id_target: 1,
            job_id_source: 2,
            canary: EXTENDED_HEADER_CANARY,
            steam_id: 76561197960287930,
            session_id: -12345,
        };
        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(buf.len(), ExtendedMsgHdr::SIZE);
        assert_eq!(buf[4], 36);
        assert_eq!(&buf[5..7], &2u16.to_le_bytes());
        round_trip(Header::Extended(header));
    }

    #[test]
    fn extended_header_rejects_bad_size_and_version() {
        let mut buf = Vec::new();
        ExtendedMsgHdr::new(EMsg::ClientLogOnResponse).write(&mut buf);

        let mut bad_size = buf.clone();
        bad_size[4] = 35;
        assert!(matches!(ExtendedMsgHdr::parse(&bad_size), Err(CmError::Framing(_))));

        let mut bad_version = buf.clone();
        bad_version[5] = 3;
        assert!(matches!(ExtendedMsgHdr::parse(&bad_version), Err(CmError::Framing(_))));
    }

    #[test]
    fn proto_header_round_trip() {
        let mut header = ProtoMsgHdr::new(EMsg::ServiceMethodCallFromClient);
        header.proto.steamid = Some(76561197960287930);
        header.proto.client_sessionid = Some(99);
        header.proto.jobid_source = Some(42);
        header.proto.target_job_name = Some("Player.GetGameBadgeLevels#1".into());
        let mut buf = Vec::new();
        header.write(&mut buf);
        assert!(is_proto(peek_msg(&buf).unwrap()));
        round_trip(Header::Proto(header));
    }

    #[test]
    fn proto_header_defaults_job_ids() {
        let header = Header::Proto(ProtoMsgHdr::new(EMsg::ClientHeartBeat));
        assert_eq!(header.job_id_source(), JOB_ID_NONE);
        assert_eq!(header.job_id_target(), JOB_ID_NONE);
        assert_eq!(header.eresult(), EResult::Fail);
    }

    #[test]
    fn short_buffers_are_framing_errors() {
        assert!(matches!(Header::parse(&[1, 2, 3, 4, 5]), Err(CmError::Framing(_))));
        assert!(matches!(MsgHdr::parse(&[0; 19]), Err(CmError::Framing(_))));
        assert!(matches!(GcMsgHdr::parse(&[0; 17]), Err(CmError::Framing(_))));

        // Declared protobuf header length runs past the buffer.
        let mut buf = set_proto_bit(751).to_le_bytes().to_vec();
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(&[0; 10]);
        assert!(matches!(Header::parse(&buf), Err(CmError::Framing(_))));
    }

    #[test]
    fn stamp_session_skips_plain_header() {
        let mut plain = Header::Plain(MsgHdr::new(EMsg::ChannelEncryptResponse));
        plain.stamp_session(1, 2);
        assert_eq!(plain.steam_id(), None);

        let mut ext = Header::Extended(ExtendedMsgHdr::new(EMsg::ClientLogOff));
        ext.stamp_session(1, 2);
        assert_eq!(ext.steam_id(), Some(1));
        assert_eq!(ext.session_id(), Some(2));
    }

    #[test]
    fn gc_headers_round_trip() {
        let plain = GcMsgHdr {
            header_version: GC_HEADER_VERSION,
            job_id_target: 3,
            job_id_source: 4,
        };
        let mut buf = Vec::new();
        plain.write(&mut buf);
        assert_eq!(buf.len(), GcMsgHdr::SIZE);
        let (parsed, n) = GcHeader::parse(4004, &buf).unwrap();
        assert_eq!(n, GcMsgHdr::SIZE);
        assert_eq!(parsed, GcHeader::Plain(plain));

        let mut proto = GcProtoMsgHdr::new(4004);
        proto.proto.job_id_source = Some(17);
        let mut buf = Vec::new();
        proto.write(&mut buf);
        let (parsed, n) = GcHeader::parse(set_proto_bit(4004), &buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(parsed.job_id_source(), 17);
        assert_eq!(parsed, GcHeader::Proto(proto));
    }

    #[test]
    fn gc_proto_header_id_mismatch() {
        let mut buf = Vec::new();
        GcProtoMsgHdr::new(4004).write(&mut buf);
        assert!(GcHeader::parse(set_proto_bit(4006), &buf).is_err());
    }
}

//! Client-protocol envelopes and the static body registry.
//!
//! Parsing is two-phase: the header is decoded first to learn the message id
//! (and, for service methods, the job-name-target), then the body type is
//! picked from the registry below and decoded fresh into a [`CmBody`] variant.

use prost::Message;
use tracing::debug;

use crate::enums::{EMsg, EResult};
use crate::error::{CmError, CmResult};
use crate::header::{Header, MsgHdr, ProtoMsgHdr};
use crate::protobufs::*;
use crate::structs::StructBody;

/// Suffix appended to a method name to key its response body.
pub const RESPONSE_SUFFIX: &str = "_Response";

/// Registry lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BodyKey {
    Msg(EMsg),
    /// Unified method name, suffixed with `_Response` for responses.
    Method(String),
}

impl BodyKey {
    /// Compute the key for an incoming message.
    ///
    /// Service-method ids are keyed by the header's job-name-target; `None` is
    /// returned when such a message arrives without one.
    pub fn for_header(emsg: EMsg, header: &Header) -> Option<Self> {
        if !emsg.is_service_method() {
            return Some(BodyKey::Msg(emsg));
        }
        let name = header.target_job_name()?;
        if emsg == EMsg::ServiceMethodResponse {
            Some(BodyKey::Method(format!("{name}{RESPONSE_SUFFIX}")))
        } else {
            Some(BodyKey::Method(name.to_string()))
        }
    }
}

/// Typed access to a body stored inside [`CmBody`].
pub trait FromCmBody: Sized {
    fn from_body(body: &CmBody) -> Option<&Self>;
}

macro_rules! cm_bodies {
    (
        messages { $( $mvariant:ident($mty:ty) => $mkey:pat ),* $(,)? }
        methods { $( $svariant:ident($sty:ty) => $skey:literal ),* $(,)? }
    ) => {
        /// Every protobuf body the registry knows how to decode.
        #[derive(Debug, Clone, PartialEq)]
        pub enum CmBody {
            $( $mvariant($mty), )*
            $( $svariant($sty), )*
        }

        impl CmBody {
            /// Decode the body registered for `key`, or `None` if there is none.
            pub fn decode(key: &BodyKey, data: &[u8]) -> Option<Result<Self, prost::DecodeError>> {
                match key {
                    BodyKey::Msg(msg) => match msg {
                        $( $mkey => Some(<$mty>::decode(data).map(CmBody::$mvariant)), )*
                        #[allow(unreachable_patterns)]
                        _ => None,
                    },
                    BodyKey::Method(name) => match name.as_str() {
                        $( $skey => Some(<$sty>::decode(data).map(CmBody::$svariant)), )*
                        _ => None,
                    },
                }
            }

            pub fn encode_to_vec(&self) -> Vec<u8> {
                match self {
                    $( CmBody::$mvariant(m) => m.encode_to_vec(), )*
                    $( CmBody::$svariant(m) => m.encode_to_vec(), )*
                }
            }

            /// The method name a service body is registered under.
            pub fn method_name(&self) -> Option<&'static str> {
                match self {
                    $( CmBody::$svariant(_) => Some($skey), )*
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }

        $(
            impl FromCmBody for $mty {
                fn from_body(body: &CmBody) -> Option<&Self> {
                    match body {
                        CmBody::$mvariant(m) => Some(m),
                        _ => None,
                    }
                }
            }

            impl From<$mty> for CmBody {
                fn from(m: $mty) -> Self {
                    CmBody::$mvariant(m)
                }
            }
        )*

        $(
            impl FromCmBody for $sty {
                fn from_body(body: &CmBody) -> Option<&Self> {
                    match body {
                        CmBody::$svariant(m) => Some(m),
                        _ => None,
                    }
                }
            }

            impl From<$sty> for CmBody {
                fn from(m: $sty) -> Self {
                    CmBody::$svariant(m)
                }
            }
        )*
    };
}

cm_bodies! {
    messages {
        Multi(CMsgMulti) => EMsg::Multi,
        ClientHeartBeat(CMsgClientHeartBeat) => EMsg::ClientHeartBeat,
        ClientHello(CMsgClientHello) => EMsg::ClientHello,
        ClientLogon(CMsgClientLogon) => EMsg::ClientLogon,
        ClientLogonResponse(CMsgClientLogonResponse) => EMsg::ClientLogOnResponse,
        ClientLogOff(CMsgClientLogOff) => EMsg::ClientLogOff,
        ClientLoggedOff(CMsgClientLoggedOff) => EMsg::ClientLoggedOff,
        ClientCmList(CMsgClientCmList) => EMsg::ClientCMList,
        ClientServerUnavailable(CMsgClientServerUnavailable) => EMsg::ClientServerUnavailable,
        GcClient(CMsgGcClient) => EMsg::ClientToGC | EMsg::ClientFromGC,
    }
    methods {
        PlayerGetGameBadgeLevelsRequest(CPlayerGetGameBadgeLevelsRequest) => "Player.GetGameBadgeLevels#1",
        PlayerGetGameBadgeLevelsResponse(CPlayerGetGameBadgeLevelsResponse) => "Player.GetGameBadgeLevels#1_Response",
        FriendMessagesIncomingMessage(CFriendMessagesIncomingMessageNotification) => "FriendMessagesClient.IncomingMessage#1",
    }
}

/// Envelope payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Proto(CmBody),
    Struct(StructBody),
    /// No decoder is registered; the bytes are kept as they arrived.
    Raw(Vec<u8>),
}

/// A message id paired with its header and decoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Message id with the protobuf bit cleared.
    pub msg: u32,
    pub header: Header,
    pub body: Body,
}

impl Envelope {
    /// Parse one frame. Header problems are `Framing` errors; a registered
    /// decoder that fails yields a `Decode` error. Unregistered bodies are
    /// kept raw.
    pub fn parse(data: &[u8]) -> CmResult<Self> {
        let (header, consumed) = Header::parse(data)?;
        let msg = header.msg();
        let payload = &data[consumed..];

        let emsg = match EMsg::try_from(msg) {
            Ok(emsg) => emsg,
            Err(_) => {
                debug!(msg, len = payload.len(), "no decoder for unknown message id");
                return Ok(Self {
                    msg,
                    header,
                    body: Body::Raw(payload.to_vec()),
                });
            }
        };

        let body = if header.is_proto() {
            match BodyKey::for_header(emsg, &header) {
                Some(key) => match CmBody::decode(&key, payload) {
                    Some(decoded) => Body::Proto(decoded.map_err(|e| {
                        CmError::Decode(format!("{key:?}: {e}"))
                    })?),
                    None => {
                        debug!(?key, "no decoder registered");
                        Body::Raw(payload.to_vec())
                    }
                },
                None => {
                    debug!(?emsg, "service message without a method name");
                    Body::Raw(payload.to_vec())
                }
            }
        } else {
            match StructBody::decode(emsg, payload) {
                Some(decoded) => Body::Struct(decoded?),
                None => {
                    debug!(?emsg, "no struct layout registered");
                    Body::Raw(payload.to_vec())
                }
            }
        };

        Ok(Self { msg, header, body })
    }

    /// A protobuf-wrapped message.
    pub fn proto(emsg: EMsg, body: impl Into<CmBody>) -> Self {
        Self {
            msg: emsg.into(),
            header: Header::Proto(ProtoMsgHdr::new(emsg)),
            body: Body::Proto(body.into()),
        }
    }

    /// A unified service message addressed to `method`.
    pub fn service_call(emsg: EMsg, method: &str, body: impl Into<CmBody>) -> Self {
        let mut header = ProtoMsgHdr::new(emsg);
        header.proto.target_job_name = Some(method.to_string());
        Self {
            msg: emsg.into(),
            header: Header::Proto(header),
            body: Body::Proto(body.into()),
        }
    }

    /// A legacy struct message behind the plain header.
    pub fn legacy(body: StructBody) -> Self {
        let emsg = body.emsg();
        Self {
            msg: emsg.into(),
            header: Header::Plain(MsgHdr::new(emsg)),
            body: Body::Struct(body),
        }
    }

    pub fn emsg(&self) -> Option<EMsg> {
        EMsg::try_from(self.msg).ok()
    }

    pub fn is_proto(&self) -> bool {
        self.header.is_proto()
    }

    /// The decoded protobuf body, if it is a `T`.
    pub fn body<T: FromCmBody>(&self) -> Option<&T> {
        match &self.body {
            Body::Proto(b) => T::from_body(b),
            _ => None,
        }
    }

    pub fn job_id_source(&self) -> u64 {
        self.header.job_id_source()
    }

    pub fn job_id_target(&self) -> u64 {
        self.header.job_id_target()
    }

    pub fn eresult(&self) -> EResult {
        self.header.eresult()
    }

    /// Serialize header and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.header.write(&mut out);
        match &self.body {
            Body::Proto(b) => out.extend_from_slice(&b.encode_to_vec()),
            Body::Struct(b) => b.write(&mut out),
            Body::Raw(b) => out.extend_from_slice(b),
        }
        out
    }
}

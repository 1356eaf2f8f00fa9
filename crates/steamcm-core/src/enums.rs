//! Numeric message ids and result codes used on the CM wire.
//!
//! The top bit of a message id marks a protobuf-carrying message; it has to be
//! stripped before the id is matched against [`EMsg`].

use serde::{Deserialize, Serialize};

/// Bit set on a message id when the message carries a protobuf header.
pub const PROTO_BIT: u32 = 0x8000_0000;

/// Set the protobuf bit on a raw message id.
pub fn set_proto_bit(msg: u32) -> u32 {
    msg | PROTO_BIT
}

/// Clear the protobuf bit from a raw message id.
pub fn clear_proto_bit(msg: u32) -> u32 {
    msg & !PROTO_BIT
}

/// Whether a raw message id carries the protobuf bit.
pub fn is_proto(msg: u32) -> bool {
    msg & PROTO_BIT != 0
}

/// Client-protocol message ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum EMsg {
    Invalid = 0,
    Multi = 1,

    DestJobFailed = 113,
    ServiceMethod = 146,
    ServiceMethodResponse = 147,
    ServiceMethodCallFromClient = 151,
    ServiceMethodSendToClient = 152,

    ClientHeartBeat = 703,
    ClientLogOff = 706,
    ClientLogOnResponse = 751,
    ClientLoggedOff = 757,
    ClientCMList = 783,

    ChannelEncryptRequest = 1303,
    ChannelEncryptResponse = 1304,
    ChannelEncryptResult = 1305,

    ClientToGC = 5452,
    ClientFromGC = 5453,
    ClientServerUnavailable = 5500,
    ClientLogon = 5514,

    ServiceMethodCallFromClientNonAuthed = 9804,
    ClientHello = 9805,
}

impl EMsg {
    /// Ids whose body type is chosen by the header's job-name-target rather
    /// than by the id itself.
    pub fn is_service_method(self) -> bool {
        matches!(
            self,
            EMsg::ServiceMethod
                | EMsg::ServiceMethodResponse
                | EMsg::ServiceMethodCallFromClient
                | EMsg::ServiceMethodCallFromClientNonAuthed
                | EMsg::ServiceMethodSendToClient
        )
    }

    /// Legacy messages framed with the plain 20-byte header.
    pub fn uses_plain_header(self) -> bool {
        matches!(
            self,
            EMsg::ChannelEncryptRequest | EMsg::ChannelEncryptResponse | EMsg::ChannelEncryptResult
        )
    }
}

impl From<EMsg> for u32 {
    fn from(m: EMsg) -> u32 {
        m as u32
    }
}

impl TryFrom<u32> for EMsg {
    type Error = String;
    fn try_from(v: u32) -> Result<Self, String> {
        match clear_proto_bit(v) {
            0 => Ok(Self::Invalid),
            1 => Ok(Self::Multi),
            113 => Ok(Self::DestJobFailed),
            146 => Ok(Self::ServiceMethod),
            147 => Ok(Self::ServiceMethodResponse),
            151 => Ok(Self::ServiceMethodCallFromClient),
            152 => Ok(Self::ServiceMethodSendToClient),
            703 => Ok(Self::ClientHeartBeat),
            706 => Ok(Self::ClientLogOff),
            751 => Ok(Self::ClientLogOnResponse),
            757 => Ok(Self::ClientLoggedOff),
            783 => Ok(Self::ClientCMList),
            1303 => Ok(Self::ChannelEncryptRequest),
            1304 => Ok(Self::ChannelEncryptResponse),
            1305 => Ok(Self::ChannelEncryptResult),
            5452 => Ok(Self::ClientToGC),
            5453 => Ok(Self::ClientFromGC),
            5500 => Ok(Self::ClientServerUnavailable),
            5514 => Ok(Self::ClientLogon),
            9804 => Ok(Self::ServiceMethodCallFromClientNonAuthed),
            9805 => Ok(Self::ClientHello),
            other => Err(format!("unknown message id: {other}")),
        }
    }
}

/// Result codes carried in headers and response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum EResult {
    Invalid,
    Ok,
    Fail,
    NoConnection,
    InvalidPassword,
    LoggedInElsewhere,
    InvalidProtocolVersion,
    InvalidParam,
    Busy,
    InvalidState,
    AccessDenied,
    Timeout,
    Banned,
    AccountNotFound,
    InvalidSteamId,
    ServiceUnavailable,
    NotLoggedOn,
    Pending,
    LimitExceeded,
    Revoked,
    Expired,
    TryAnotherCM,
    RateLimitExceeded,
    AccountLoginDeniedThrottle,
    /// A code this library has no name for.
    Other(i32),
}

impl EResult {
    /// Rejections that a credential refresh can fix.
    pub fn is_credential_failure(self) -> bool {
        matches!(
            self,
            EResult::InvalidPassword | EResult::AccessDenied | EResult::Expired | EResult::Revoked
        )
    }

    /// Rejections that mean "this server cannot take you, try another one".
    pub fn is_server_unavailable(self) -> bool {
        matches!(
            self,
            EResult::TryAnotherCM | EResult::ServiceUnavailable | EResult::Busy | EResult::Timeout
        )
    }
}

impl From<EResult> for i32 {
    fn from(r: EResult) -> i32 {
        match r {
            EResult::Invalid => 0,
            EResult::Ok => 1,
            EResult::Fail => 2,
            EResult::NoConnection => 3,
            EResult::InvalidPassword => 5,
            EResult::LoggedInElsewhere => 6,
            EResult::InvalidProtocolVersion => 7,
            EResult::InvalidParam => 8,
            EResult::Busy => 10,
            EResult::InvalidState => 11,
            EResult::AccessDenied => 15,
            EResult::Timeout => 16,
            EResult::Banned => 17,
            EResult::AccountNotFound => 18,
            EResult::InvalidSteamId => 19,
            EResult::ServiceUnavailable => 20,
            EResult::NotLoggedOn => 21,
            EResult::Pending => 22,
            EResult::LimitExceeded => 25,
            EResult::Revoked => 26,
            EResult::Expired => 27,
            EResult::TryAnotherCM => 48,
            EResult::RateLimitExceeded => 84,
            EResult::AccountLoginDeniedThrottle => 87,
            EResult::Other(v) => v,
        }
    }
}

impl From<i32> for EResult {
    fn from(v: i32) -> Self {
        match v {
            0 => Self::Invalid,
            1 => Self::Ok,
            2 => Self::Fail,
            3 => Self::NoConnection,
            5 => Self::InvalidPassword,
            6 => Self::LoggedInElsewhere,
            7 => Self::InvalidProtocolVersion,
            8 => Self::InvalidParam,
            10 => Self::Busy,
            11 => Self::InvalidState,
            15 => Self::AccessDenied,
            16 => Self::Timeout,
            17 => Self::Banned,
            18 => Self::AccountNotFound,
            19 => Self::InvalidSteamId,
            20 => Self::ServiceUnavailable,
            21 => Self::NotLoggedOn,
            22 => Self::Pending,
            25 => Self::LimitExceeded,
            26 => Self::Revoked,
            27 => Self::Expired,
            48 => Self::TryAnotherCM,
            84 => Self::RateLimitExceeded,
            87 => Self::AccountLoginDeniedThrottle,
            other => Self::Other(other),
        }
    }
}

//! Protobuf bodies and headers used by the gateway core.
//!
//! Only the messages the connection machinery itself needs are defined here,
//! plus a few service methods that exercise the job-name lookup path.

/// Job id meaning "no job".
pub const JOB_ID_NONE: u64 = u64::MAX;

/// Header carried by every protobuf-wrapped client message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgProtoBufHeader {
    #[prost(fixed64, optional, tag = "1")]
    pub steamid: Option<u64>,
    #[prost(int32, optional, tag = "2")]
    pub client_sessionid: Option<i32>,
    #[prost(uint32, optional, tag = "3")]
    pub routing_appid: Option<u32>,
    #[prost(fixed64, optional, tag = "10", default = "18446744073709551615")]
    pub jobid_source: Option<u64>,
    #[prost(fixed64, optional, tag = "11", default = "18446744073709551615")]
    pub jobid_target: Option<u64>,
    #[prost(string, optional, tag = "12")]
    pub target_job_name: Option<String>,
    #[prost(int32, optional, tag = "13", default = "2")]
    pub eresult: Option<i32>,
    #[prost(string, optional, tag = "14")]
    pub error_message: Option<String>,
    #[prost(int32, optional, tag = "24")]
    pub seq_num: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgMulti {
    #[prost(uint32, optional, tag = "1")]
    pub size_unzipped: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub message_body: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgClientHeartBeat {
    #[prost(bool, optional, tag = "1")]
    pub send_reply: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgClientHello {
    #[prost(uint32, optional, tag = "1")]
    pub protocol_version: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgClientLogon {
    #[prost(uint32, optional, tag = "1")]
    pub protocol_version: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub cell_id: Option<u32>,
    #[prost(string, optional, tag = "6")]
    pub client_language: Option<String>,
    #[prost(uint32, optional, tag = "7")]
    pub client_os_type: Option<u32>,
    #[prost(bool, optional, tag = "8")]
    pub should_remember_password: Option<bool>,
    #[prost(fixed64, optional, tag = "22")]
    pub client_supplied_steam_id: Option<u64>,
    #[prost(uint32, optional, tag = "33")]
    pub chat_mode: Option<u32>,
    #[prost(string, optional, tag = "50")]
    pub account_name: Option<String>,
    #[prost(string, optional, tag = "99")]
    pub machine_name: Option<String>,
    #[prost(string, optional, tag = "108")]
    pub access_token: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgClientLogonResponse {
    #[prost(int32, optional, tag = "1", default = "2")]
    pub eresult: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub legacy_out_of_game_heartbeat_seconds: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub heartbeat_seconds: Option<i32>,
    #[prost(fixed32, optional, tag = "5")]
    pub rtime32_server_time: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub account_flags: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub cell_id: Option<u32>,
    #[prost(string, optional, tag = "8")]
    pub email_domain: Option<String>,
    #[prost(int32, optional, tag = "10")]
    pub eresult_extended: Option<i32>,
    #[prost(fixed64, optional, tag = "20")]
    pub client_supplied_steamid: Option<u64>,
    #[prost(string, optional, tag = "21")]
    pub ip_country_code: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgClientLogOff {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgClientLoggedOff {
    #[prost(int32, optional, tag = "1", default = "2")]
    pub eresult: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgClientCmList {
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub cm_addresses: Vec<u32>,
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub cm_ports: Vec<u32>,
    #[prost(string, repeated, tag = "3")]
    pub cm_websocket_addresses: Vec<String>,
    #[prost(uint32, optional, tag = "4")]
    pub percent_default_to_websocket: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgClientServerUnavailable {
    #[prost(uint64, optional, tag = "1")]
    pub jobid_sent: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub emsg_sent: Option<u32>,
    #[prost(int32, optional, tag = "3")]
    pub eserver_type_unavailable: Option<i32>,
}

/// Body of `ClientToGC` / `ClientFromGC`: a GC message tunneled for one app.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CMsgGcClient {
    #[prost(uint32, optional, tag = "1")]
    pub appid: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub msgtype: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub payload: Option<Vec<u8>>,
    #[prost(fixed64, optional, tag = "4")]
    pub steamid: Option<u64>,
    #[prost(string, optional, tag = "5")]
    pub gcname: Option<String>,
    #[prost(uint32, optional, tag = "6")]
    pub ip: Option<u32>,
}

// ── Unified service methods ───────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CPlayerGetGameBadgeLevelsRequest {
    #[prost(uint32, optional, tag = "1")]
    pub appid: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CPlayerGetGameBadgeLevelsResponse {
    #[prost(int32, optional, tag = "1")]
    pub player_level: Option<i32>,
    #[prost(message, repeated, tag = "2")]
    pub badges: Vec<CPlayerBadge>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CPlayerBadge {
    #[prost(int32, optional, tag = "1")]
    pub level: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub series: Option<i32>,
    #[prost(uint32, optional, tag = "3")]
    pub border_color: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CFriendMessagesIncomingMessageNotification {
    #[prost(fixed64, optional, tag = "1")]
    pub steamid_friend: Option<u64>,
    #[prost(int32, optional, tag = "2")]
    pub chat_entry_type: Option<i32>,
    #[prost(bool, optional, tag = "3")]
    pub from_limited_account: Option<bool>,
    #[prost(string, optional, tag = "4")]
    pub message: Option<String>,
    #[prost(fixed32, optional, tag = "5")]
    pub rtime32_server_timestamp: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub ordinal: Option<u32>,
    #[prost(bool, optional, tag = "7")]
    pub local_echo: Option<bool>,
    #[prost(string, optional, tag = "8")]
    pub message_no_bbcode: Option<String>,
}

/// Messages of the GC sub-protocol shared by every app.
pub mod gc {
    /// Header of a protobuf-wrapped GC message. No session fields travel here.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CMsgGcProtoBufHeader {
        #[prost(fixed64, optional, tag = "1")]
        pub client_steam_id: Option<u64>,
        #[prost(uint32, optional, tag = "3")]
        pub source_app_id: Option<u32>,
        #[prost(fixed64, optional, tag = "10", default = "18446744073709551615")]
        pub job_id_source: Option<u64>,
        #[prost(fixed64, optional, tag = "11", default = "18446744073709551615")]
        pub job_id_target: Option<u64>,
        #[prost(string, optional, tag = "12")]
        pub target_job_name: Option<String>,
        #[prost(int32, optional, tag = "13", default = "2")]
        pub eresult: Option<i32>,
        #[prost(string, optional, tag = "14")]
        pub error_message: Option<String>,
        #[prost(uint32, optional, tag = "201")]
        pub gc_dir_index_source: Option<u32>,
    }

    pub const EMSG_GC_CLIENT_WELCOME: u32 = 4004;
    pub const EMSG_GC_CLIENT_HELLO: u32 = 4006;
    pub const EMSG_GC_CLIENT_CONNECTION_STATUS: u32 = 4009;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CMsgClientHello {
        #[prost(uint32, optional, tag = "1")]
        pub version: Option<u32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CMsgClientWelcome {
        #[prost(uint32, optional, tag = "1")]
        pub version: Option<u32>,
        #[prost(bytes = "vec", optional, tag = "2")]
        pub game_data: Option<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CMsgConnectionStatus {
        #[prost(int32, optional, tag = "1")]
        pub status: Option<i32>,
        #[prost(uint32, optional, tag = "2")]
        pub client_session_need: Option<u32>,
        #[prost(int32, optional, tag = "3")]
        pub queue_position: Option<i32>,
        #[prost(int32, optional, tag = "4")]
        pub queue_size: Option<i32>,
        #[prost(int32, optional, tag = "5")]
        pub wait_seconds: Option<i32>,
    }
}

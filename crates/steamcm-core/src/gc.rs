//! Game Coordinator envelopes.
//!
//! A GC message rides inside a `ClientFromGC` / `ClientToGC` body. Its numeric
//! id space is partitioned per app, so every lookup is keyed by
//! `(app_id, msg)`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use prost::Message;

use crate::enums::{clear_proto_bit, set_proto_bit};
use crate::error::{CmError, CmResult};
use crate::header::{GcHeader, GcMsgHdr, GcProtoMsgHdr};
use crate::protobufs::gc::{
    CMsgClientHello, CMsgClientWelcome, CMsgConnectionStatus, EMSG_GC_CLIENT_CONNECTION_STATUS,
    EMSG_GC_CLIENT_HELLO, EMSG_GC_CLIENT_WELCOME,
};
use crate::protobufs::CMsgGcClient;

/// A decoded GC body, downcast with [`GcEnvelope::body`].
pub type GcBody = Arc<dyn Any + Send + Sync>;

type GcDecoder = Arc<dyn Fn(&[u8]) -> Result<GcBody, prost::DecodeError> + Send + Sync>;

/// Decoder table keyed by `(app_id, msg)`, built explicitly before use.
#[derive(Clone, Default)]
pub struct GcRegistry {
    decoders: HashMap<(u32, u32), GcDecoder>,
}

impl GcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the app-independent hello/welcome/status messages
    /// registered for `app_id`.
    pub fn with_base_messages(app_id: u32) -> Self {
        let mut registry = Self::new();
        registry.register_base_messages(app_id);
        registry
    }

    pub fn register_base_messages(&mut self, app_id: u32) {
        self.register::<CMsgClientHello>(app_id, EMSG_GC_CLIENT_HELLO);
        self.register::<CMsgClientWelcome>(app_id, EMSG_GC_CLIENT_WELCOME);
        self.register::<CMsgConnectionStatus>(app_id, EMSG_GC_CLIENT_CONNECTION_STATUS);
    }

    /// Register `T` as the body of `msg` for `app_id`.
    pub fn register<T>(&mut self, app_id: u32, msg: u32)
    where
        T: Message + Default + Send + Sync + 'static,
    {
        let decoder: GcDecoder = Arc::new(|data: &[u8]| {
            T::decode(data).map(|m| Arc::new(m) as GcBody)
        });
        self.decoders.insert((app_id, clear_proto_bit(msg)), decoder);
    }

    pub fn contains(&self, app_id: u32, msg: u32) -> bool {
        self.decoders.contains_key(&(app_id, clear_proto_bit(msg)))
    }

    fn decode(&self, app_id: u32, msg: u32, data: &[u8]) -> Option<Result<GcBody, prost::DecodeError>> {
        self.decoders.get(&(app_id, msg)).map(|d| d(data))
    }
}

impl fmt::Debug for GcRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.decoders.keys().collect();
        keys.sort();
        f.debug_struct("GcRegistry").field("decoders", &keys).finish()
    }
}

/// A GC message scoped to the app that owns it.
#[derive(Clone)]
pub struct GcEnvelope {
    pub app_id: u32,
    /// GC message id with the protobuf bit cleared.
    pub msg: u32,
    pub header: GcHeader,
    /// Encoded body bytes.
    pub payload: Vec<u8>,
    decoded: Option<GcBody>,
}

impl GcEnvelope {
    /// Unwrap the GC message carried by a `ClientFromGC` body.
    ///
    /// Fails when the header is malformed, when nothing is registered for
    /// `(app_id, msg)`, or when the registered decoder rejects the body.
    pub fn parse(outer: &CMsgGcClient, registry: &GcRegistry) -> CmResult<Self> {
        let app_id = outer.appid.unwrap_or_default();
        let msgtype = outer.msgtype.unwrap_or_default();
        let data = outer.payload.as_deref().unwrap_or_default();

        let (header, consumed) = GcHeader::parse(msgtype, data)?;
        let msg = clear_proto_bit(msgtype);
        let payload = data[consumed..].to_vec();

        let decoded = registry
            .decode(app_id, msg, &payload)
            .ok_or_else(|| {
                CmError::Decode(format!("no GC decoder for app {app_id} message {msg}"))
            })?
            .map_err(|e| CmError::Decode(format!("GC app {app_id} message {msg}: {e}")))?;

        Ok(Self {
            app_id,
            msg,
            header,
            payload,
            decoded: Some(decoded),
        })
    }

    /// An outgoing protobuf GC message.
    pub fn proto<T: Message>(app_id: u32, msg: u32, body: &T) -> Self {
        Self {
            app_id,
            msg: clear_proto_bit(msg),
            header: GcHeader::Proto(GcProtoMsgHdr::new(msg)),
            payload: body.encode_to_vec(),
            decoded: None,
        }
    }

    /// An outgoing non-protobuf GC message with a pre-encoded body.
    pub fn plain(app_id: u32, msg: u32, payload: Vec<u8>) -> Self {
        Self {
            app_id,
            msg: clear_proto_bit(msg),
            header: GcHeader::Plain(GcMsgHdr::default()),
            payload,
            decoded: None,
        }
    }

    /// The decoded body, if it is a `T`.
    pub fn body<T: 'static>(&self) -> Option<&T> {
        self.decoded.as_deref().and_then(|b| b.downcast_ref::<T>())
    }

    pub fn is_proto(&self) -> bool {
        self.header.is_proto()
    }

    pub fn job_id_source(&self) -> u64 {
        self.header.job_id_source()
    }

    pub fn job_id_target(&self) -> u64 {
        self.header.job_id_target()
    }

    /// The raw id as it travels in the tunneling body.
    pub fn wire_msg(&self) -> u32 {
        if self.is_proto() {
            set_proto_bit(self.msg)
        } else {
            self.msg
        }
    }

    /// Header followed by body bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + GcMsgHdr::SIZE);
        self.header.write(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Wrap into the tunneling body sent as `ClientToGC`.
    pub fn to_gc_client(&self) -> CMsgGcClient {
        CMsgGcClient {
            appid: Some(self.app_id),
            msgtype: Some(self.wire_msg()),
            payload: Some(self.to_bytes()),
            ..Default::default()
        }
    }
}

impl fmt::Debug for GcEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcEnvelope")
            .field("app_id", &self.app_id)
            .field("msg", &self.msg)
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .field("decoded", &self.decoded.is_some())
            .finish()
    }
}

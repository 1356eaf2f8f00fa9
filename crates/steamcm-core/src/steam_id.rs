//! 64-bit peer identifiers.
//!
//! Layout: `[universe:8][type:4][instance:20][account_id:32]`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Account type nibble for individual users.
pub const TYPE_INDIVIDUAL: u8 = 1;
/// Universe byte for the public universe.
pub const UNIVERSE_PUBLIC: u8 = 1;
/// Default instance for desktop individual accounts.
pub const INSTANCE_DESKTOP: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SteamId(pub u64);

impl SteamId {
    pub fn new(account_id: u32, instance: u32, account_type: u8, universe: u8) -> Self {
        let raw = (u64::from(universe) << 56)
            | (u64::from(account_type & 0xf) << 52)
            | (u64::from(instance & 0xf_ffff) << 32)
            | u64::from(account_id);
        Self(raw)
    }

    /// An individual account in the public universe.
    pub fn individual(account_id: u32) -> Self {
        Self::new(account_id, INSTANCE_DESKTOP, TYPE_INDIVIDUAL, UNIVERSE_PUBLIC)
    }

    pub fn account_id(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    pub fn instance(self) -> u32 {
        ((self.0 >> 32) & 0xf_ffff) as u32
    }

    pub fn account_type(self) -> u8 {
        ((self.0 >> 52) & 0xf) as u8
    }

    pub fn universe(self) -> u8 {
        (self.0 >> 56) as u8
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for SteamId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for SteamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[U:{}:{}]", self.universe(), self.account_id())
    }
}

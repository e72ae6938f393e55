use core::fmt;
use core::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Identifier of a mesh participant. Assigned by the mesh backend, usually
/// derived from the station MAC address.
pub type NodeId = u32;

/// Port the mesh protocol listens on.
pub const MESH_PORT: u16 = 5555;

/// Radio channel the mesh access point is brought up on.
pub const MESH_CHANNEL: u8 = 6;

/// WiFi mode the mesh stack is initialised in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiMode {
    /// Access point only
    Ap,
    /// Station only
    Sta,
    /// Access point for the mesh plus a station link to an upstream router
    ApSta,
}

/// A single category of backend debug output
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugMsgType {
    Error,
    Startup,
    MeshStatus,
    Connection,
    Sync,
    STime,
    Communication,
    General,
    MsgTypes,
    Remote,
    Application,
    Debug,
}

impl DebugMsgType {
    pub const ALL: [DebugMsgType; 12] = [
        DebugMsgType::Error,
        DebugMsgType::Startup,
        DebugMsgType::MeshStatus,
        DebugMsgType::Connection,
        DebugMsgType::Sync,
        DebugMsgType::STime,
        DebugMsgType::Communication,
        DebugMsgType::General,
        DebugMsgType::MsgTypes,
        DebugMsgType::Remote,
        DebugMsgType::Application,
        DebugMsgType::Debug,
    ];

    /// Bit of this category inside a [`DebugMsgTypes`] mask
    pub const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub const fn name(self) -> &'static str {
        match self {
            DebugMsgType::Error => "ERROR",
            DebugMsgType::Startup => "STARTUP",
            DebugMsgType::MeshStatus => "MESH_STATUS",
            DebugMsgType::Connection => "CONNECTION",
            DebugMsgType::Sync => "SYNC",
            DebugMsgType::STime => "S_TIME",
            DebugMsgType::Communication => "COMMUNICATION",
            DebugMsgType::General => "GENERAL",
            DebugMsgType::MsgTypes => "MSG_TYPES",
            DebugMsgType::Remote => "REMOTE",
            DebugMsgType::Application => "APPLICATION",
            DebugMsgType::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for DebugMsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of enabled debug categories. Bit layout matches painlessMesh, so a
/// mask can be handed straight to a native backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DebugMsgTypes(u16);

impl DebugMsgTypes {
    pub const ERROR: Self = Self(DebugMsgType::Error.bit());
    pub const STARTUP: Self = Self(DebugMsgType::Startup.bit());
    pub const MESH_STATUS: Self = Self(DebugMsgType::MeshStatus.bit());
    pub const CONNECTION: Self = Self(DebugMsgType::Connection.bit());
    pub const SYNC: Self = Self(DebugMsgType::Sync.bit());
    pub const S_TIME: Self = Self(DebugMsgType::STime.bit());
    pub const COMMUNICATION: Self = Self(DebugMsgType::Communication.bit());
    pub const GENERAL: Self = Self(DebugMsgType::General.bit());
    pub const MSG_TYPES: Self = Self(DebugMsgType::MsgTypes.bit());
    pub const REMOTE: Self = Self(DebugMsgType::Remote.bit());
    pub const APPLICATION: Self = Self(DebugMsgType::Application.bit());
    pub const DEBUG: Self = Self(DebugMsgType::Debug.bit());

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self((1 << DebugMsgType::ALL.len()) - 1)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u16) -> Self {
        Self(bits & Self::all().0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn enables(self, ty: DebugMsgType) -> bool {
        self.0 & ty.bit() != 0
    }

    /// Categories present in this set, lowest bit first
    pub fn iter(self) -> impl Iterator<Item = DebugMsgType> {
        DebugMsgType::ALL
            .into_iter()
            .filter(move |ty| self.enables(*ty))
    }
}

impl From<DebugMsgType> for DebugMsgTypes {
    fn from(ty: DebugMsgType) -> Self {
        Self(ty.bit())
    }
}

impl FromIterator<DebugMsgType> for DebugMsgTypes {
    fn from_iter<I: IntoIterator<Item = DebugMsgType>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::empty(), |acc, ty| acc | Self::from(ty))
    }
}

impl BitOr for DebugMsgTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DebugMsgTypes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for DebugMsgTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        for (i, ty) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(ty.name())?;
        }
        Ok(())
    }
}

// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use derive_new::new;
use std::{convert::TryFrom, fmt};
use thiserror::Error;

/// Error raised by a user callback (slave setup function, EoE frame callback).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of a user callback.
pub type CallbackResult = std::result::Result<(), BoxError>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not open network interface {0}")]
    Connection(String),
    #[error("The network interface is not open")]
    NotInitialized,
    #[error("No slaves found (result {0})")]
    NoSlavesFound(i32),
    #[error("There is no slave at position {0}")]
    NoSuchSlave(u16),
    #[error(transparent)]
    Sdo(#[from] SdoAbort),
    #[error(transparent)]
    SdoInfo(#[from] SdoInfoFault),
    #[error(transparent)]
    Mailbox(#[from] MailboxFault),
    #[error(transparent)]
    Packet(#[from] PacketFault),
    #[error(transparent)]
    Foe(#[from] FoeFault),
    #[error(transparent)]
    Emergency(#[from] Emergency),
    #[error("Slave {slave}: EEPROM error: {desc}")]
    Eeprom { slave: u16, desc: String },
    #[error("{} error(s) occurred during process data mapping", .0.len())]
    ConfigMap(Vec<Error>),
    #[error("Setup function of slave {slave} failed: {source}")]
    SetupFunc { slave: u16, source: BoxError },
    #[error("Working counter is {0}")]
    Wkc(i32),
    #[error("Slave {slave}: invalid EoE receive data")]
    EoeInvalidRxData { slave: u16 },
    #[error("Slave {slave} is in state {actual}, but {expected} is required")]
    InvalidState {
        slave: u16,
        expected: SlaveState,
        actual: SlaveState,
    },
    #[error("Invalid AL state 0x{0:X}")]
    InvalidAlState(u16),
    #[error("IO map needs {required} bytes, but only {capacity} are available")]
    IoMapOverflow { required: usize, capacity: usize },
    #[error("{0}")]
    InvalidArgument(String),
}

impl Error {
    /// Position of the slave that caused the error, if it is slave-specific.
    pub fn slave_pos(&self) -> Option<u16> {
        match self {
            Error::NoSuchSlave(slave)
            | Error::Eeprom { slave, .. }
            | Error::SetupFunc { slave, .. }
            | Error::EoeInvalidRxData { slave }
            | Error::InvalidState { slave, .. } => Some(*slave),
            Error::Sdo(e) => Some(e.slave),
            Error::SdoInfo(e) => Some(e.slave),
            Error::Mailbox(e) => Some(e.slave),
            Error::Packet(e) => Some(e.slave),
            Error::Foe(e) => Some(e.slave),
            Error::Emergency(e) => Some(e.slave),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An SDO abort reported by a slave.
#[derive(Debug, Clone, PartialEq, Eq, Error, new)]
#[error("Slave {slave}: SDO abort 0x{abort_code:08X} on 0x{index:04X}:{sub_index}: {desc}")]
pub struct SdoAbort {
    pub slave: u16,
    pub index: u16,
    pub sub_index: u8,
    pub abort_code: u32,
    pub desc: String,
}

/// An error while browsing the object dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Error, new)]
#[error("Slave {slave}: SDO info error 0x{abort_code:08X} on 0x{index:04X}:{sub_index}: {desc}")]
pub struct SdoInfoFault {
    pub slave: u16,
    pub index: u16,
    pub sub_index: u8,
    pub abort_code: u32,
    pub desc: String,
}

/// A mailbox protocol error reply.
#[derive(Debug, Clone, PartialEq, Eq, Error, new)]
#[error("Slave {slave}: mailbox error 0x{error_code:04X}: {desc}")]
pub struct MailboxFault {
    pub slave: u16,
    pub error_code: u16,
    pub desc: String,
}

/// An unexpected or undersized mailbox answer.
#[derive(Debug, Clone, PartialEq, Eq, Error, new)]
#[error("Slave {slave}: packet error {error_code} on 0x{index:04X}:{sub_index}: {desc}")]
pub struct PacketFault {
    pub slave: u16,
    pub index: u16,
    pub sub_index: u8,
    pub error_code: u16,
    pub desc: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoeFaultKind {
    /// Error code sent by the slave.
    Slave(u32),
    BufferTooSmall,
    PacketNumber,
    FileNotFound,
}

impl fmt::Display for FoeFaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FoeFaultKind::Slave(code) => write!(f, "slave error 0x{:08X}", code),
            FoeFaultKind::BufferTooSmall => f.write_str("buffer too small"),
            FoeFaultKind::PacketNumber => f.write_str("unexpected packet number"),
            FoeFaultKind::FileNotFound => f.write_str("file not found"),
        }
    }
}

/// A failed file access (FoE) transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error, new)]
#[error("Slave {slave}: FoE {kind}")]
pub struct FoeFault {
    pub slave: u16,
    pub kind: FoeFaultKind,
}

/// A CoE emergency message sent by a slave.
///
/// Not necessarily an error the caller has to handle; it is dispatched to the
/// slave's emergency callbacks when there are any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, new)]
#[error("Slave {slave}: emergency 0x{error_code:04X} (register 0x{error_reg:02X}, data {b1:02X} {w1:04X} {w2:04X})")]
pub struct Emergency {
    pub slave: u16,
    pub error_code: u16,
    pub error_reg: u8,
    pub b1: u8,
    pub w1: u16,
    pub w2: u16,
}

/// Codes of [`PacketFault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketErrorCode {
    UnexpectedFrameReturned = 1,
    DataContainerTooSmallForType = 3,
}

impl PacketErrorCode {
    pub fn desc(code: u16) -> &'static str {
        match code {
            1 => "Unexpected frame returned",
            3 => "Data container too small for type",
            _ => "Unknown",
        }
    }
}

/// Application layer state of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlState {
    None = 0,
    Init = 1,
    PreOp = 2,
    Boot = 3,
    SafeOp = 4,
    Op = 8,
}

impl TryFrom<u16> for AlState {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            0 => AlState::None,
            1 => AlState::Init,
            2 => AlState::PreOp,
            3 => AlState::Boot,
            4 => AlState::SafeOp,
            8 => AlState::Op,
            x => return Err(Error::InvalidAlState(x)),
        })
    }
}

impl fmt::Display for AlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlState::None => "NONE",
            AlState::Init => "INIT",
            AlState::PreOp => "PREOP",
            AlState::Boot => "BOOT",
            AlState::SafeOp => "SAFEOP",
            AlState::Op => "OP",
        })
    }
}

/// Error indication (when read) or error acknowledge (when written).
pub const STATE_ERROR: u16 = 0x10;
pub const STATE_ACK: u16 = STATE_ERROR;

/// State as stored in a slave record: an [`AlState`] plus the error/ack bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveState {
    pub state: AlState,
    pub error: bool,
}

impl SlaveState {
    pub const fn new(state: AlState) -> Self {
        Self {
            state,
            error: false,
        }
    }

    /// The state with the error bit set; written to a slave this acknowledges
    /// the error.
    pub const fn ack(state: AlState) -> Self {
        Self { state, error: true }
    }

    pub fn raw(self) -> u16 {
        self.state as u16 | if self.error { STATE_ERROR } else { 0 }
    }
}

impl From<AlState> for SlaveState {
    fn from(state: AlState) -> Self {
        SlaveState::new(state)
    }
}

impl TryFrom<u16> for SlaveState {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        let state = AlState::try_from(value & !STATE_ERROR)
            .map_err(|_| Error::InvalidAlState(value))?;
        Ok(SlaveState {
            state,
            error: value & STATE_ERROR != 0,
        })
    }
}

impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error {
            write!(f, "{}+ERROR", self.state)
        } else {
            write!(f, "{}", self.state)
        }
    }
}

/// Cached identity of a slave, read once at enumeration.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct SlaveIdentity {
    pub name: String,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision: u32,
    pub serial: u32,
}

/// A location in the process data image.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, new)]
pub struct PdRegion {
    /// Byte offset into the IO map.
    pub offset: usize,
    pub bytes: usize,
    pub bits: u16,
}

impl PdRegion {
    /// Number of bytes a caller sees: sub-byte regions still occupy one byte.
    pub fn len(&self) -> usize {
        if self.bytes == 0 && self.bits > 0 {
            1
        } else {
            self.bytes
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Word offsets of well known items in the slave information interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiiOffset {
    Manufacturer = 0x08,
    ProductCode = 0x0A,
    Revision = 0x0C,
    SerialNumber = 0x0E,
    BootRxMailbox = 0x14,
    BootTxMailbox = 0x16,
    StdRxMailbox = 0x18,
    StdTxMailbox = 0x1A,
}

impl From<SiiOffset> for u16 {
    fn from(offset: SiiOffset) -> Self {
        offset as u16
    }
}

/// Mailbox direction, seen from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mailbox {
    /// Master to slave, sync manager 0.
    Out,
    /// Slave to master, sync manager 1.
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watchdog {
    Pdi,
    ProcessData,
}

/// ESC registers touched directly by this crate.
pub(crate) mod reg {
    pub const WD_DIV: u16 = 0x0400;
    pub const WD_TIME_PDI: u16 = 0x0410;
    pub const WD_TIME_PROCESSDATA: u16 = 0x0420;
    pub const SM0: u16 = 0x0800;
    pub const SM1: u16 = 0x0808;
}

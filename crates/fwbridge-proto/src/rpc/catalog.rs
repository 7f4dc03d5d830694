//! Opcode table and typed messages for the binary RPC protocol.
//!
//! All integers are little-endian and fixed width. The layouts are a
//! bit-exact contract with the stub firmware.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, Result};
use crate::message::FieldValue;
use crate::rpc::types::{EXCEPTION_VECTOR_COUNT, MAX_UNTYPED_TRANSFER, PAGE_SIZE};

/// Direction of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

/// Every opcode in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    ReadMemory = 0x01,
    WriteMemory = 0x02,
    GetRegister = 0x03,
    SetRegister = 0x04,
    ReadUntypedMemory = 0x05,
    WriteUntypedMemory = 0x06,
    CodeletExecute = 0x07,
    InsertPage = 0x10,
    ExtractPage = 0x11,
    UnmapPage = 0x12,
    SetMemoryMap = 0x13,
    GetDirtyPages = 0x14,
    SetExceptionConfig = 0x20,
    ClearException = 0x21,
    ResumeVm = 0x40,
    QueryState = 0x41,
    ContinueFromPagefault = 0x42,
    State = 0x81,
    ReplyState = 0x82,
    ReplyReadMemory = 0x90,
    ReplyGetRegister = 0x91,
    ReplyExtractPage = 0x92,
    ReplyGetDirtyPages = 0x93,
    ReplyReadUntypedMemory = 0x94,
    ReplyCodeletExecutionFinished = 0x95,
    InfoException = 0xA0,
    PageFault = 0xA4,
    ReplyOk = 0xB1,
    ReplyError = 0xB2,
}

impl Opcode {
    pub const ALL: [Opcode; 29] = [
        Opcode::ReadMemory,
        Opcode::WriteMemory,
        Opcode::GetRegister,
        Opcode::SetRegister,
        Opcode::ReadUntypedMemory,
        Opcode::WriteUntypedMemory,
        Opcode::CodeletExecute,
        Opcode::InsertPage,
        Opcode::ExtractPage,
        Opcode::UnmapPage,
        Opcode::SetMemoryMap,
        Opcode::GetDirtyPages,
        Opcode::SetExceptionConfig,
        Opcode::ClearException,
        Opcode::ResumeVm,
        Opcode::QueryState,
        Opcode::ContinueFromPagefault,
        Opcode::State,
        Opcode::ReplyState,
        Opcode::ReplyReadMemory,
        Opcode::ReplyGetRegister,
        Opcode::ReplyExtractPage,
        Opcode::ReplyGetDirtyPages,
        Opcode::ReplyReadUntypedMemory,
        Opcode::ReplyCodeletExecutionFinished,
        Opcode::InfoException,
        Opcode::PageFault,
        Opcode::ReplyOk,
        Opcode::ReplyError,
    ];

    /// Look up an opcode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as u8 == byte)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Look up an opcode by its symbolic name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Symbolic name used in logs and by the stub's own tooling.
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadMemory => "AVATAR_RPC_HTD_READ_MEMORY",
            Self::WriteMemory => "AVATAR_RPC_HTD_WRITE_MEMORY",
            Self::GetRegister => "AVATAR_RPC_HTD_GET_REGISTER",
            Self::SetRegister => "AVATAR_RPC_HTD_SET_REGISTER",
            Self::ReadUntypedMemory => "AVATAR_RPC_HTD_READ_UNTYPED_MEMORY",
            Self::WriteUntypedMemory => "AVATAR_RPC_HTD_WRITE_UNTYPED_MEMORY",
            Self::CodeletExecute => "AVATAR_RPC_HTD_CODELET_EXECUTE",
            Self::InsertPage => "AVATAR_RPC_HTD_INSERT_PAGE",
            Self::ExtractPage => "AVATAR_RPC_HTD_EXTRACT_PAGE",
            Self::UnmapPage => "AVATAR_RPC_HTD_UNMAP_PAGE",
            Self::SetMemoryMap => "AVATAR_RPC_HTD_SET_MEMORY_MAP",
            Self::GetDirtyPages => "AVATAR_RPC_HTD_GET_DIRTY_PAGES",
            Self::SetExceptionConfig => "AVATAR_RPC_HTD_SET_EXCEPTION_CONFIG",
            Self::ClearException => "AVATAR_RPC_HTD_CLEAR_EXCEPTION",
            Self::ResumeVm => "AVATAR_RPC_HTD_RESUME_VM",
            Self::QueryState => "AVATAR_RPC_HTD_QUERY_STATE",
            Self::ContinueFromPagefault => "AVATAR_RPC_HTD_CONTINUE_FROM_PAGEFAULT",
            Self::State => "AVATAR_RPC_DTH_STATE",
            Self::ReplyState => "AVATAR_RPC_DTH_REPLY_STATE",
            Self::ReplyReadMemory => "AVATAR_RPC_DTH_REPLY_READ_MEMORY",
            Self::ReplyGetRegister => "AVATAR_RPC_DTH_REPLY_GET_REGISTER",
            Self::ReplyExtractPage => "AVATAR_RPC_DTH_REPLY_EXTRACT_PAGE",
            Self::ReplyGetDirtyPages => "AVATAR_RPC_DTH_REPLY_GET_DIRTY_PAGES",
            Self::ReplyReadUntypedMemory => "AVATAR_RPC_DTH_REPLY_READ_UNTYPED_MEMORY",
            Self::ReplyCodeletExecutionFinished => {
                "AVATAR_RPC_DTH_REPLY_CODELET_EXECUTION_FINISHED"
            }
            Self::InfoException => "AVATAR_RPC_DTH_INFO_EXCEPTION",
            Self::PageFault => "AVATAR_RPC_DTH_PAGEFAULT",
            Self::ReplyOk => "AVATAR_RPC_DTH_REPLY_OK",
            Self::ReplyError => "AVATAR_RPC_DTH_REPLY_ERROR",
        }
    }

    pub fn direction(self) -> Direction {
        if self.as_byte() & 0x80 == 0 {
            Direction::HostToDevice
        } else {
            Direction::DeviceToHost
        }
    }

    /// Device-originated messages that are not replies to a command.
    pub fn is_notification(self) -> bool {
        matches!(self, Self::State | Self::PageFault | Self::InfoException)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtoError;

    fn try_from(byte: u8) -> Result<Self> {
        Self::from_byte(byte).ok_or(ProtoError::UnknownOpcode(byte))
    }
}

/// One SET_MEMORY_MAP region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub start: u32,
    pub end: u32,
    pub flags: u32,
}

/// A binary RPC message, host-to-device or device-to-host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    ReadMemory {
        address: u32,
        size: u8,
    },
    /// `value` occupies `size` bytes on the wire (1, 2 or 4).
    WriteMemory {
        address: u32,
        size: u8,
        value: u32,
    },
    GetRegister {
        register: u8,
    },
    SetRegister {
        register: u8,
        value: u32,
    },
    ReadUntypedMemory {
        address: u32,
        size: u8,
    },
    /// Length-prefixed; at most 255 bytes.
    WriteUntypedMemory {
        address: u32,
        data: Bytes,
    },
    CodeletExecute {
        address: u32,
    },
    /// `data` is exactly one page.
    InsertPage {
        page_address: u32,
        data: Bytes,
    },
    ExtractPage {
        page_address: u32,
    },
    UnmapPage {
        page_address: u32,
    },
    SetMemoryMap {
        entries: Vec<MemoryMapEntry>,
    },
    GetDirtyPages,
    SetExceptionConfig {
        config: u32,
        irq_squelch: u16,
        fiq_squelch: u16,
        vectors: [u32; EXCEPTION_VECTOR_COUNT],
    },
    ClearException {
        exception: u8,
    },
    ResumeVm,
    QueryState,
    ContinueFromPagefault,
    State {
        state: u8,
    },
    ReplyState {
        state: u8,
    },
    /// `size` bytes of `value` travel on the wire; the rest are zero.
    ReplyReadMemory {
        size: u8,
        value: u32,
    },
    ReplyGetRegister {
        value: u32,
    },
    ReplyExtractPage {
        data: Bytes,
    },
    ReplyGetDirtyPages {
        addresses: Vec<u32>,
    },
    ReplyReadUntypedMemory {
        data: Bytes,
    },
    ReplyCodeletExecutionFinished,
    InfoException {
        exception: u8,
    },
    PageFault {
        page_address: u32,
    },
    ReplyOk,
    ReplyError {
        error: u8,
    },
}

/// Bounds-checked little-endian field reader.
struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
    opcode: u8,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8], opcode: u8) -> Self {
        Self {
            data,
            pos: 0,
            opcode,
        }
    }

    fn take(&mut self, field: &'static str, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let slice = self.data.get(self.pos..end).ok_or(ProtoError::OutOfData {
            field,
            opcode: self.opcode,
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        Ok(self.take(field, 1)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16> {
        let b = self.take(field, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32> {
        let b = self.take(field, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Zero-extend `len` little-endian bytes (at most four).
    fn sized(&mut self, field: &'static str, len: u8) -> Result<u32> {
        if len > 4 {
            return Err(ProtoError::InvalidField {
                field,
                reason: format!("size {len} exceeds 4 bytes"),
            });
        }
        let b = self.take(field, usize::from(len))?;
        let mut word = [0u8; 4];
        word[..b.len()].copy_from_slice(b);
        Ok(u32::from_le_bytes(word))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }
}

fn check_access_size(size: u8) -> Result<()> {
    if matches!(size, 1 | 2 | 4) {
        Ok(())
    } else {
        Err(ProtoError::InvalidField {
            field: "size",
            reason: format!("access size must be 1, 2 or 4, got {size}"),
        })
    }
}

fn check_page(data: &[u8]) -> Result<()> {
    if data.len() == PAGE_SIZE {
        Ok(())
    } else {
        Err(ProtoError::InvalidField {
            field: "data",
            reason: format!("page must be {PAGE_SIZE} bytes, got {}", data.len()),
        })
    }
}

fn count_u8(field: &'static str, len: usize) -> Result<u8> {
    u8::try_from(len).map_err(|_| ProtoError::InvalidField {
        field,
        reason: format!("{len} exceeds {MAX_UNTYPED_TRANSFER}"),
    })
}

impl RpcMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ReadMemory { .. } => Opcode::ReadMemory,
            Self::WriteMemory { .. } => Opcode::WriteMemory,
            Self::GetRegister { .. } => Opcode::GetRegister,
            Self::SetRegister { .. } => Opcode::SetRegister,
            Self::ReadUntypedMemory { .. } => Opcode::ReadUntypedMemory,
            Self::WriteUntypedMemory { .. } => Opcode::WriteUntypedMemory,
            Self::CodeletExecute { .. } => Opcode::CodeletExecute,
            Self::InsertPage { .. } => Opcode::InsertPage,
            Self::ExtractPage { .. } => Opcode::ExtractPage,
            Self::UnmapPage { .. } => Opcode::UnmapPage,
            Self::SetMemoryMap { .. } => Opcode::SetMemoryMap,
            Self::GetDirtyPages => Opcode::GetDirtyPages,
            Self::SetExceptionConfig { .. } => Opcode::SetExceptionConfig,
            Self::ClearException { .. } => Opcode::ClearException,
            Self::ResumeVm => Opcode::ResumeVm,
            Self::QueryState => Opcode::QueryState,
            Self::ContinueFromPagefault => Opcode::ContinueFromPagefault,
            Self::State { .. } => Opcode::State,
            Self::ReplyState { .. } => Opcode::ReplyState,
            Self::ReplyReadMemory { .. } => Opcode::ReplyReadMemory,
            Self::ReplyGetRegister { .. } => Opcode::ReplyGetRegister,
            Self::ReplyExtractPage { .. } => Opcode::ReplyExtractPage,
            Self::ReplyGetDirtyPages { .. } => Opcode::ReplyGetDirtyPages,
            Self::ReplyReadUntypedMemory { .. } => Opcode::ReplyReadUntypedMemory,
            Self::ReplyCodeletExecutionFinished => Opcode::ReplyCodeletExecutionFinished,
            Self::InfoException { .. } => Opcode::InfoException,
            Self::PageFault { .. } => Opcode::PageFault,
            Self::ReplyOk => Opcode::ReplyOk,
            Self::ReplyError { .. } => Opcode::ReplyError,
        }
    }

    pub fn name(&self) -> &'static str {
        self.opcode().name()
    }

    /// Decode one unframed message (opcode byte followed by its fields).
    ///
    /// Trailing bytes beyond the declared fields are ignored.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (&opcode_byte, body) = frame.split_first().ok_or(ProtoError::OutOfData {
            field: "opcode",
            opcode: 0,
        })?;
        let opcode = Opcode::try_from(opcode_byte)?;
        let mut r = FieldReader::new(body, opcode_byte);

        let message = match opcode {
            Opcode::ReadMemory => Self::ReadMemory {
                address: r.u32("address")?,
                size: r.u8("size")?,
            },
            Opcode::WriteMemory => {
                let address = r.u32("address")?;
                let size = r.u8("size")?;
                check_access_size(size)?;
                let value = r.sized("value", size)?;
                Self::WriteMemory {
                    address,
                    size,
                    value,
                }
            }
            Opcode::GetRegister => Self::GetRegister {
                register: r.u8("register")?,
            },
            Opcode::SetRegister => Self::SetRegister {
                register: r.u8("register")?,
                value: r.u32("value")?,
            },
            Opcode::ReadUntypedMemory => Self::ReadUntypedMemory {
                address: r.u32("address")?,
                size: r.u8("size")?,
            },
            Opcode::WriteUntypedMemory => {
                let address = r.u32("address")?;
                let len = r.u8("size")?;
                let data = Bytes::copy_from_slice(r.take("data", usize::from(len))?);
                Self::WriteUntypedMemory { address, data }
            }
            Opcode::CodeletExecute => Self::CodeletExecute {
                address: r.u32("address")?,
            },
            Opcode::InsertPage => Self::InsertPage {
                page_address: r.u32("page_address")?,
                data: Bytes::copy_from_slice(r.take("data", PAGE_SIZE)?),
            },
            Opcode::ExtractPage => Self::ExtractPage {
                page_address: r.u32("page_address")?,
            },
            Opcode::UnmapPage => Self::UnmapPage {
                page_address: r.u32("page_address")?,
            },
            Opcode::SetMemoryMap => {
                let count = r.u8("count")?;
                let mut entries = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    entries.push(MemoryMapEntry {
                        start: r.u32("start")?,
                        end: r.u32("end")?,
                        flags: r.u32("flags")?,
                    });
                }
                Self::SetMemoryMap { entries }
            }
            Opcode::GetDirtyPages => Self::GetDirtyPages,
            Opcode::SetExceptionConfig => {
                let config = r.u32("config")?;
                let irq_squelch = r.u16("irq_squelch")?;
                let fiq_squelch = r.u16("fiq_squelch")?;
                let mut vectors = [0u32; EXCEPTION_VECTOR_COUNT];
                for vector in &mut vectors {
                    *vector = r.u32("exception_vectors")?;
                }
                Self::SetExceptionConfig {
                    config,
                    irq_squelch,
                    fiq_squelch,
                    vectors,
                }
            }
            Opcode::ClearException => Self::ClearException {
                exception: r.u8("exception")?,
            },
            Opcode::ResumeVm => Self::ResumeVm,
            Opcode::QueryState => Self::QueryState,
            Opcode::ContinueFromPagefault => Self::ContinueFromPagefault,
            Opcode::State => Self::State {
                state: r.u8("state")?,
            },
            Opcode::ReplyState => Self::ReplyState {
                state: r.u8("state")?,
            },
            Opcode::ReplyReadMemory => {
                let size = r.u8("size")?;
                let value = r.sized("value", size)?;
                Self::ReplyReadMemory { size, value }
            }
            Opcode::ReplyGetRegister => Self::ReplyGetRegister {
                value: r.u32("value")?,
            },
            Opcode::ReplyExtractPage => Self::ReplyExtractPage {
                data: Bytes::copy_from_slice(r.take("data", PAGE_SIZE)?),
            },
            Opcode::ReplyGetDirtyPages => {
                let count = r.u8("count")?;
                let mut addresses = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    addresses.push(r.u32("addresses")?);
                }
                Self::ReplyGetDirtyPages { addresses }
            }
            Opcode::ReplyReadUntypedMemory => Self::ReplyReadUntypedMemory {
                data: Bytes::copy_from_slice(r.rest()),
            },
            Opcode::ReplyCodeletExecutionFinished => Self::ReplyCodeletExecutionFinished,
            Opcode::InfoException => Self::InfoException {
                exception: r.u8("exception")?,
            },
            Opcode::PageFault => Self::PageFault {
                page_address: r.u32("page_address")?,
            },
            Opcode::ReplyOk => Self::ReplyOk,
            Opcode::ReplyError => Self::ReplyError {
                error: r.u8("error")?,
            },
        };
        Ok(message)
    }

    /// Append the unframed message (opcode and fields) to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.opcode().as_byte());
        match self {
            Self::ReadMemory { address, size } | Self::ReadUntypedMemory { address, size } => {
                dst.put_u32_le(*address);
                dst.put_u8(*size);
            }
            Self::WriteMemory {
                address,
                size,
                value,
            } => {
                check_access_size(*size)?;
                dst.put_u32_le(*address);
                dst.put_u8(*size);
                dst.put_slice(&value.to_le_bytes()[..usize::from(*size)]);
            }
            Self::GetRegister { register } => dst.put_u8(*register),
            Self::SetRegister { register, value } => {
                dst.put_u8(*register);
                dst.put_u32_le(*value);
            }
            Self::WriteUntypedMemory { address, data } => {
                let len = count_u8("data", data.len())?;
                dst.put_u32_le(*address);
                dst.put_u8(len);
                dst.put_slice(data);
            }
            Self::CodeletExecute { address } => dst.put_u32_le(*address),
            Self::InsertPage { page_address, data } => {
                check_page(data)?;
                dst.put_u32_le(*page_address);
                dst.put_slice(data);
            }
            Self::ExtractPage { page_address }
            | Self::UnmapPage { page_address }
            | Self::PageFault { page_address } => dst.put_u32_le(*page_address),
            Self::SetMemoryMap { entries } => {
                dst.put_u8(count_u8("entries", entries.len())?);
                for entry in entries {
                    dst.put_u32_le(entry.start);
                    dst.put_u32_le(entry.end);
                    dst.put_u32_le(entry.flags);
                }
            }
            Self::SetExceptionConfig {
                config,
                irq_squelch,
                fiq_squelch,
                vectors,
            } => {
                dst.put_u32_le(*config);
                dst.put_u16_le(*irq_squelch);
                dst.put_u16_le(*fiq_squelch);
                for vector in vectors {
                    dst.put_u32_le(*vector);
                }
            }
            Self::ClearException { exception } | Self::InfoException { exception } => {
                dst.put_u8(*exception)
            }
            Self::State { state } | Self::ReplyState { state } => dst.put_u8(*state),
            Self::ReplyReadMemory { size, value } => {
                if *size > 4 {
                    return Err(ProtoError::InvalidField {
                        field: "size",
                        reason: format!("size {size} exceeds 4 bytes"),
                    });
                }
                dst.put_u8(*size);
                dst.put_slice(&value.to_le_bytes()[..usize::from(*size)]);
            }
            Self::ReplyGetRegister { value } => dst.put_u32_le(*value),
            Self::ReplyExtractPage { data } => {
                check_page(data)?;
                dst.put_slice(data);
            }
            Self::ReplyGetDirtyPages { addresses } => {
                dst.put_u8(count_u8("addresses", addresses.len())?);
                for address in addresses {
                    dst.put_u32_le(*address);
                }
            }
            Self::ReplyReadUntypedMemory { data } => dst.put_slice(data),
            Self::ReplyError { error } => dst.put_u8(*error),
            Self::GetDirtyPages
            | Self::ResumeVm
            | Self::QueryState
            | Self::ContinueFromPagefault
            | Self::ReplyCodeletExecutionFinished
            | Self::ReplyOk => {}
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode(&mut dst)?;
        Ok(dst.freeze())
    }

    /// Ordered field list for display.
    pub fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        match self {
            Self::ReadMemory { address, size } | Self::ReadUntypedMemory { address, size } => {
                vec![("address", (*address).into()), ("size", (*size).into())]
            }
            Self::WriteMemory {
                address,
                size,
                value,
            } => vec![
                ("address", (*address).into()),
                ("size", (*size).into()),
                ("value", (*value).into()),
            ],
            Self::GetRegister { register } => vec![("register", (*register).into())],
            Self::SetRegister { register, value } => {
                vec![("register", (*register).into()), ("value", (*value).into())]
            }
            Self::WriteUntypedMemory { address, data } => vec![
                ("address", (*address).into()),
                ("data", FieldValue::Bytes(data.clone())),
            ],
            Self::CodeletExecute { address } => vec![("address", (*address).into())],
            Self::InsertPage { page_address, data } => vec![
                ("page_address", (*page_address).into()),
                ("data", FieldValue::Bytes(data.clone())),
            ],
            Self::ExtractPage { page_address }
            | Self::UnmapPage { page_address }
            | Self::PageFault { page_address } => vec![("page_address", (*page_address).into())],
            Self::SetMemoryMap { entries } => vec![(
                "entries",
                FieldValue::List(
                    entries
                        .iter()
                        .map(|e| {
                            FieldValue::Map(vec![
                                ("start".to_string(), e.start.into()),
                                ("end".to_string(), e.end.into()),
                                ("flags".to_string(), e.flags.into()),
                            ])
                        })
                        .collect(),
                ),
            )],
            Self::SetExceptionConfig {
                config,
                irq_squelch,
                fiq_squelch,
                vectors,
            } => vec![
                ("config", (*config).into()),
                ("irq_squelch", (*irq_squelch).into()),
                ("fiq_squelch", (*fiq_squelch).into()),
                (
                    "exception_vectors",
                    FieldValue::List(vectors.iter().map(|v| (*v).into()).collect()),
                ),
            ],
            Self::ClearException { exception } | Self::InfoException { exception } => {
                vec![("exception", (*exception).into())]
            }
            Self::State { state } | Self::ReplyState { state } => {
                vec![("state", (*state).into())]
            }
            Self::ReplyReadMemory { size, value } => {
                vec![("size", (*size).into()), ("value", (*value).into())]
            }
            Self::ReplyGetRegister { value } => vec![("value", (*value).into())],
            Self::ReplyExtractPage { data } | Self::ReplyReadUntypedMemory { data } => {
                vec![("data", FieldValue::Bytes(data.clone()))]
            }
            Self::ReplyGetDirtyPages { addresses } => vec![(
                "addresses",
                FieldValue::List(addresses.iter().map(|a| (*a).into()).collect()),
            )],
            Self::ReplyError { error } => vec![("error", (*error).into())],
            Self::GetDirtyPages
            | Self::ResumeVm
            | Self::QueryState
            | Self::ContinueFromPagefault
            | Self::ReplyCodeletExecutionFinished
            | Self::ReplyOk => Vec::new(),
        }
    }
}

impl fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name())?;
        for (i, (name, value)) in self.fields().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match value {
                FieldValue::Int(v) => write!(f, "{name} = 0x{v:x}")?,
                FieldValue::Bytes(b) => {
                    write!(f, "{name} = {}", crate::message::hex_string(b))?
                }
                other => write!(f, "{name} = {other:?}")?,
            }
        }
        f.write_str(")")
    }
}

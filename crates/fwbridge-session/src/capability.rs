//! Per-capability backend interfaces.
//!
//! A backend implements the subset it supports and hands the trait objects to
//! [`DebugSessionBuilder`](crate::DebugSessionBuilder).

use crate::error::{Result, SessionError};

/// ARM core register names in register-number order.
pub const ARM_REGISTERS: [&str; 17] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc", "cpsr",
];

/// Memory access. Addresses and values are widened to `u64`; backends
/// reject what their wire format cannot carry.
pub trait MemoryAccess: Send + Sync {
    /// Read 1, 2 or 4 bytes as one access.
    fn read_typed(&self, address: u64, size: u8) -> Result<u64>;

    fn write_typed(&self, address: u64, size: u8, value: u64) -> Result<()>;

    /// Read a block of bytes. Defaults to one byte-wide access per byte.
    fn read_untyped(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        (0..len as u64)
            .map(|offset| self.read_typed(address + offset, 1).map(|b| b as u8))
            .collect()
    }

    fn write_untyped(&self, address: u64, data: &[u8]) -> Result<()> {
        for (offset, byte) in data.iter().enumerate() {
            self.write_typed(address + offset as u64, 1, u64::from(*byte))?;
        }
        Ok(())
    }
}

pub trait RegisterAccess: Send + Sync {
    fn get_register(&self, name: &str) -> Result<u64>;

    fn set_register(&self, name: &str, value: u64) -> Result<()>;

    /// Read a register by number, using the ARM numbering by default.
    fn get_register_by_number(&self, number: usize) -> Result<u64> {
        let name = ARM_REGISTERS
            .get(number)
            .ok_or_else(|| SessionError::UnknownRegister(number.to_string()))?;
        self.get_register(name)
    }
}

/// How a breakpoint is planted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakpointOptions {
    /// Use the Thumb breakpoint encoding.
    pub thumb: bool,
    /// Remove after the first hit.
    pub temporary: bool,
    pub hardware: bool,
}

impl BreakpointOptions {
    pub fn thumb() -> Self {
        Self {
            thumb: true,
            ..Self::default()
        }
    }

    pub fn hardware() -> Self {
        Self {
            hardware: true,
            ..Self::default()
        }
    }
}

/// A planted breakpoint as the backend identifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BreakpointId {
    pub address: u64,
    /// Debugger-assigned number, for backends that number breakpoints.
    pub number: Option<u32>,
}

impl BreakpointId {
    pub fn at(address: u64) -> Self {
        Self {
            address,
            number: None,
        }
    }
}

pub trait BreakpointControl: Send + Sync {
    fn insert_breakpoint(&self, address: u64, options: &BreakpointOptions)
        -> Result<BreakpointId>;

    fn remove_breakpoint(&self, id: &BreakpointId) -> Result<()>;
}

pub trait ExecutionControl: Send + Sync {
    /// Resume execution. Returns once the target acknowledged the resume.
    fn cont(&self) -> Result<()>;

    /// Execute a single instruction.
    fn step(&self) -> Result<()> {
        Err(SessionError::Unsupported("step"))
    }

    /// Stop a running target.
    fn halt(&self) -> Result<()> {
        Err(SessionError::Unsupported("halt"))
    }
}

/// Checksum of a memory range computed on the debugger side.
pub trait ChecksumQuery: Send + Sync {
    fn checksum(&self, address: u64, size: u64) -> Result<u64>;
}

pub(crate) fn check_typed_size(size: u8) -> Result<()> {
    match size {
        1 | 2 | 4 => Ok(()),
        _ => Err(SessionError::Proto(fwbridge_proto::ProtoError::InvalidField {
            field: "size",
            reason: format!("typed access of {size} bytes"),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeTarget;

    #[test]
    fn untyped_defaults_go_bytewise() {
        let target = FakeTarget::new();
        target
            .write_untyped(0x100, &[1, 2, 3])
            .expect("should write bytes");
        assert_eq!(target.read_typed(0x101, 1).expect("should read"), 2);
        assert_eq!(
            target.read_untyped(0x100, 3).expect("should read bytes"),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn register_numbers_follow_arm_order() {
        let target = FakeTarget::new();
        target.set_register("pc", 0x8000).expect("should set pc");
        target.set_register("cpsr", 0x1d3).expect("should set cpsr");
        assert_eq!(target.get_register_by_number(15).expect("should read"), 0x8000);
        assert_eq!(target.get_register_by_number(16).expect("should read"), 0x1d3);
        let err = target
            .get_register_by_number(17)
            .expect_err("should reject");
        assert!(matches!(err, SessionError::UnknownRegister(n) if n == "17"));
    }

    #[test]
    fn typed_sizes() {
        assert!(check_typed_size(4).is_ok());
        assert!(check_typed_size(3).is_err());
    }
}

//! In-memory backend for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::bus::lock;
use crate::capability::{
    check_typed_size, BreakpointControl, BreakpointId, BreakpointOptions, ChecksumQuery,
    ExecutionControl, MemoryAccess, RegisterAccess, ARM_REGISTERS,
};
use crate::error::{Result, SessionError};

#[derive(Default)]
pub(crate) struct FakeTarget {
    pub memory: Mutex<BTreeMap<u64, u8>>,
    pub registers: Mutex<HashMap<String, u64>>,
    pub breakpoints: Mutex<Vec<BreakpointId>>,
    pub resumed: Mutex<u32>,
    next_number: Mutex<u32>,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resumed(&self) -> u32 {
        *lock(&self.resumed)
    }
}

impl MemoryAccess for FakeTarget {
    fn read_typed(&self, address: u64, size: u8) -> Result<u64> {
        check_typed_size(size)?;
        let memory = lock(&self.memory);
        Ok((0..u64::from(size)).fold(0, |acc, i| {
            acc | u64::from(*memory.get(&(address + i)).unwrap_or(&0)) << (8 * i)
        }))
    }

    fn write_typed(&self, address: u64, size: u8, value: u64) -> Result<()> {
        check_typed_size(size)?;
        let mut memory = lock(&self.memory);
        for i in 0..u64::from(size) {
            memory.insert(address + i, (value >> (8 * i)) as u8);
        }
        Ok(())
    }
}

impl RegisterAccess for FakeTarget {
    fn get_register(&self, name: &str) -> Result<u64> {
        if !ARM_REGISTERS.contains(&name) {
            return Err(SessionError::UnknownRegister(name.to_string()));
        }
        Ok(*lock(&self.registers).get(name).unwrap_or(&0))
    }

    fn set_register(&self, name: &str, value: u64) -> Result<()> {
        if !ARM_REGISTERS.contains(&name) {
            return Err(SessionError::UnknownRegister(name.to_string()));
        }
        lock(&self.registers).insert(name.to_string(), value);
        Ok(())
    }
}

impl BreakpointControl for FakeTarget {
    fn insert_breakpoint(
        &self,
        address: u64,
        _options: &BreakpointOptions,
    ) -> Result<BreakpointId> {
        let mut next = lock(&self.next_number);
        *next += 1;
        let id = BreakpointId {
            address,
            number: Some(*next),
        };
        lock(&self.breakpoints).push(id);
        Ok(id)
    }

    fn remove_breakpoint(&self, id: &BreakpointId) -> Result<()> {
        let mut breakpoints = lock(&self.breakpoints);
        let before = breakpoints.len();
        breakpoints.retain(|b| b != id);
        if breakpoints.len() == before {
            return Err(SessionError::NoSuchBreakpoint(id.address));
        }
        Ok(())
    }
}

impl ExecutionControl for FakeTarget {
    fn cont(&self) -> Result<()> {
        *lock(&self.resumed) += 1;
        Ok(())
    }
}

impl ChecksumQuery for FakeTarget {
    fn checksum(&self, address: u64, size: u64) -> Result<u64> {
        let memory = lock(&self.memory);
        Ok((address..address + size)
            .map(|a| u64::from(*memory.get(&a).unwrap_or(&0)))
            .sum())
    }
}

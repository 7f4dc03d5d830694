//! Constants shared with the stub firmware.

/// Size of one page moved by INSERT_PAGE / EXTRACT_PAGE.
pub const PAGE_SIZE: usize = 64;

/// Largest untyped memory transfer carried by a single message.
pub const MAX_UNTYPED_TRANSFER: usize = 255;

/// Number of exception vectors in SET_EXCEPTION_CONFIG.
pub const EXCEPTION_VECTOR_COUNT: usize = 8;

pub mod exception_flags {
    pub const IRQ_FORWARD: u32 = 0x00001;
    pub const FIQ_FORWARD: u32 = 0x00002;
    pub const SVC_FORWARD: u32 = 0x00004;
    pub const UND_FORWARD: u32 = 0x00008;
    pub const DAB_FORWARD: u32 = 0x00010;
    pub const PAB_FORWARD: u32 = 0x00020;
    pub const IRQ_PRINT: u32 = 0x00100;
    pub const FIQ_PRINT: u32 = 0x00200;
    pub const SVC_PRINT: u32 = 0x00400;
    pub const UND_PRINT: u32 = 0x00800;
    pub const DAB_PRINT: u32 = 0x01000;
    pub const PAB_PRINT: u32 = 0x02000;
    pub const INTERRUPTS_DISABLE: u32 = 0x10000;
}

pub mod remote_error {
    pub const NONE: u8 = 0;
    pub const CHECKSUM: u8 = 1;
    pub const OUT_OF_BOUNDS: u8 = 2;
    pub const NOT_FOUND: u8 = 3;
    pub const OUT_OF_MEMORY: u8 = 4;
}

/// Symbolic name of a remote error code.
pub fn remote_error_name(code: u8) -> &'static str {
    match code {
        remote_error::NONE => "AVATAR_ERROR_NONE",
        remote_error::CHECKSUM => "AVATAR_ERROR_CHECKSUM",
        remote_error::OUT_OF_BOUNDS => "AVATAR_ERROR_OUT_OF_BOUNDS",
        remote_error::NOT_FOUND => "AVATAR_ERROR_NOT_FOUND",
        remote_error::OUT_OF_MEMORY => "AVATAR_ERROR_OUT_OF_MEMORY",
        _ => "AVATAR_ERROR_UNKNOWN",
    }
}

/// Bits of the VM state byte carried by STATE / REPLY_STATE.
pub mod vm_state {
    pub const RUNNING: u8 = 0x01;
    pub const PAGE_MISS: u8 = 0x02;
    pub const BREAKPOINT: u8 = 0x04;
    pub const EMULATE_INSTRUCTION: u8 = 0x08;
    pub const EXCEPTION: u8 = 0x10;
}

/// ARM register numbers understood by GET_REGISTER / SET_REGISTER.
pub mod arm_reg {
    pub const R0: u8 = 0;
    pub const R12: u8 = 12;
    pub const SP: u8 = 13;
    pub const LR: u8 = 14;
    pub const PC: u8 = 15;
    pub const CPSR: u8 = 16;
}

/// Map an ARM register name (`r0`..`r15`, `sp`, `lr`, `pc`, `cpsr`) to its
/// number. Names are case-insensitive.
pub fn arm_register_number(name: &str) -> Option<u8> {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "sp" => Some(arm_reg::SP),
        "lr" => Some(arm_reg::LR),
        "pc" => Some(arm_reg::PC),
        "cpsr" => Some(arm_reg::CPSR),
        other => other
            .strip_prefix('r')
            .and_then(|n| n.parse::<u8>().ok())
            .filter(|n| *n <= arm_reg::PC),
    }
}

/// Flags of a SET_MEMORY_MAP entry.
pub mod memory_map_flags {
    pub const READ: u32 = 0x01;
    pub const WRITE: u32 = 0x02;
    pub const EXECUTE: u32 = 0x04;
    /// The region has an entry in the page table.
    pub const PAGING: u32 = 0x08;
    /// Accesses to the region are recorded in the trace buffer.
    pub const TRACE: u32 = 0x10;
}

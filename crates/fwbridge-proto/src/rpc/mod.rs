//! Binary RPC protocol spoken with the on-target stub.

pub mod catalog;
pub mod client;
pub mod types;

pub use catalog::{Direction, MemoryMapEntry, Opcode, RpcMessage};
pub use client::{
    ExceptionHandler, NotificationSink, PageFaultHandler, RpcClient, RpcConfig, RpcHandlers,
    RESPONSE_TIMEOUT,
};
pub use types::{arm_register_number, remote_error_name, MAX_UNTYPED_TRANSFER, PAGE_SIZE};

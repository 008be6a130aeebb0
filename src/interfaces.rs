//! Requests exchanged between simulated processors and memory models.
//!
//! A [`MemRequest`] is both a request and, once answered, its response: the answering side turns it around with
//! [`into_response()`](MemRequest::into_response), keeping the id so the requester can match the two. Requests are
//! [`Serialize`], so they can cross a rank boundary as part of an activity or travel through a
//! [`tunnel`](crate::tunnel) to a memory model in another process. Dispatching the response back to whoever issued the
//! request is the caller's business.

use crate::serialization::{Serialize, Serializer};
use crate::Error;
use std::sync::atomic::{AtomicU64, Ordering};

/// A memory address. All addresses are 64-bit.
pub type Addr = u64;

/// Identifier matching a response to its request.
pub type RequestId = u64;

/// Bit flags qualifying a request.
pub type RequestFlags = u32;

/// The request must not be cached.
pub const F_NONCACHEABLE: RequestFlags = 1 << 1;
/// The request is locked. A locked read should soon be followed by a locked write that unlocks.
pub const F_LOCKED: RequestFlags = 1 << 2;
/// Load-linked / store-conditional request.
pub const F_LLSC: RequestFlags = 1 << 3;
/// Response to a load-linked / store-conditional request.
pub const F_LLSC_RESP: RequestFlags = 1 << 4;

/// What a [`MemRequest`] asks for, or answers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    #[default]
    Read,
    Write,
    ReadResp,
    WriteResp,
}

impl Command {
    pub fn is_response(self) -> bool {
        matches!(self, Command::ReadResp | Command::WriteResp)
    }

    /// The command answering this one. Responses answer themselves.
    pub fn response(self) -> Self {
        match self {
            Command::Read | Command::ReadResp => Command::ReadResp,
            Command::Write | Command::WriteResp => Command::WriteResp,
        }
    }

    fn code(self) -> u32 {
        match self {
            Command::Read => 0,
            Command::Write => 1,
            Command::ReadResp => 2,
            Command::WriteResp => 3,
        }
    }

    fn from_code(code: u32) -> crate::Result<Self> {
        match code {
            0 => Ok(Command::Read),
            1 => Ok(Command::Write),
            2 => Ok(Command::ReadResp),
            3 => Ok(Command::WriteResp),
            _ => Err(Error::InvalidEncoding(format!("{code} is not a memory command"))),
        }
    }
}

impl Serialize for Command {
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut code = self.code();
        code.serialize_order(ser)?;
        *self = Command::from_code(code)?;
        Ok(())
    }
}

/// Hands out request ids, unique for the lifetime of the allocator.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    next: AtomicU64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose first id is `first`. Lets ranks carve out disjoint id ranges.
    pub fn starting_at(first: RequestId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> RequestId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a request with a fresh id.
    pub fn request(&self, command: Command, addr: Addr, size: usize) -> MemRequest {
        MemRequest::new(self.next_id(), command, addr, size)
    }
}

/// A memory request or response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemRequest {
    pub command: Command,
    /// Target address.
    pub addr: Addr,
    /// Bytes requested or returned.
    pub size: usize,
    /// Payload of a write or a read response.
    pub data: Vec<u8>,
    pub flags: RequestFlags,
    /// Flags ignored by caches and passed through to main memory.
    pub mem_flags: RequestFlags,
    pub id: RequestId,
    /// Statistics group the request is counted under.
    pub group_id: u32,
    pub instruction_pointer: Addr,
    pub virtual_address: Addr,
}

impl MemRequest {
    pub fn new(id: RequestId, command: Command, addr: Addr, size: usize) -> Self {
        Self {
            command,
            addr,
            size,
            id,
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_mem_flags(mut self, mem_flags: RequestFlags) -> Self {
        self.mem_flags = mem_flags;
        self
    }

    pub fn with_payload(mut self, data: &[u8]) -> Self {
        self.set_payload(data);
        self
    }

    /// Replace the payload with a copy of `data`.
    pub fn set_payload(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }

    pub fn set_group_id(&mut self, group_id: u32) {
        self.group_id = group_id;
    }

    pub fn set_virtual_address(&mut self, virtual_address: Addr) {
        self.virtual_address = virtual_address;
    }

    pub fn set_instruction_pointer(&mut self, instruction_pointer: Addr) {
        self.instruction_pointer = instruction_pointer;
    }

    /// Whether every bit of `flag` is set.
    pub fn has_flag(&self, flag: RequestFlags) -> bool {
        self.flags & flag == flag
    }

    pub fn set_flag(&mut self, flag: RequestFlags) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: RequestFlags) {
        self.flags &= !flag;
    }

    /// Turn this request into its response, keeping its id, address, and size. A write's payload is dropped; a
    /// read's response carries whatever payload the responder sets.
    pub fn into_response(mut self) -> Self {
        if self.command == Command::Write {
            self.data.clear();
        }
        self.command = self.command.response();
        self
    }
}

impl Serialize for MemRequest {
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        self.command.serialize_order(ser)?;
        self.addr.serialize_order(ser)?;
        self.size.serialize_order(ser)?;
        self.data.serialize_order(ser)?;
        self.flags.serialize_order(ser)?;
        self.mem_flags.serialize_order(ser)?;
        self.id.serialize_order(ser)?;
        self.group_id.serialize_order(ser)?;
        self.instruction_pointer.serialize_order(ser)?;
        self.virtual_address.serialize_order(ser)
    }
}

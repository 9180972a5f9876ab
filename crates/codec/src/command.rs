use crate::Error;

/// Command byte carried in the frame header (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    Beacon = 0x00,
    ConnectionValidation = 0x01,
    Echo = 0x02,
    Search = 0x03,
    SearchResponse = 0x04,
    CreateChannel = 0x07,
    DestroyChannel = 0x08,
    ConnectionValidated = 0x09,
    Get = 0x0A,
    Put = 0x0B,
    PutGet = 0x0C,
    Monitor = 0x0D,
    Array = 0x0E,
    CancelRequest = 0x10,
    Process = 0x11,
    GetField = 0x12,
    Message = 0x13,
    Rpc = 0x14,
}

impl CommandId {
    /// Every command the client engine understands, in wire-value order.
    pub const ALL: &'static [CommandId] = &[
        CommandId::Beacon,
        CommandId::ConnectionValidation,
        CommandId::Echo,
        CommandId::Search,
        CommandId::SearchResponse,
        CommandId::CreateChannel,
        CommandId::DestroyChannel,
        CommandId::ConnectionValidated,
        CommandId::Get,
        CommandId::Put,
        CommandId::PutGet,
        CommandId::Monitor,
        CommandId::Array,
        CommandId::CancelRequest,
        CommandId::Process,
        CommandId::GetField,
        CommandId::Message,
        CommandId::Rpc,
    ];

    pub fn from_u8(byte: u8) -> Result<Self, Error> {
        CommandId::ALL
            .iter()
            .copied()
            .find(|c| *c as u8 == byte)
            .ok_or(Error::UnknownCommand(byte))
    }

    /// True for operations that carry an IOID in their payload and are
    /// therefore demultiplexed through the context's IOID table
    /// (spec.md §4.5).
    pub fn is_data_response(self) -> bool {
        matches!(
            self,
            CommandId::Get
                | CommandId::Put
                | CommandId::PutGet
                | CommandId::Monitor
                | CommandId::Array
                | CommandId::Process
                | CommandId::Rpc
                | CommandId::GetField
        )
    }
}

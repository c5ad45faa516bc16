use thiserror::Error;

/// Decoder error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The byte stream ended before the instruction could be fully decoded.
    #[error("unexpected end of instruction bytes")]
    UnexpectedEof,
    /// The decoded instruction exceeds the architectural 15-byte length limit.
    #[error("instruction exceeds 15-byte length limit")]
    TooLong,
    /// The opcode has no entry in the dispatch table.
    ///
    /// `opcode` is the primary opcode byte, or `0x0Fxx` for the two-byte map.
    #[error("unimplemented opcode {opcode:#06x} ({mnemonic}) bytes [{}]", hex(bytes))]
    Unimplemented {
        opcode: u16,
        bytes: Vec<u8>,
        mnemonic: String,
    },
}

impl DecodeError {
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented { .. })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

use crate::DecodeError;

/// A forward-only byte stream the decoder pulls instruction bytes from.
pub trait ByteSource {
    /// Consume and return the next byte.
    fn next_u8(&mut self) -> Result<u8, DecodeError>;

    /// Copy upcoming bytes into `buf` without consuming them, returning how many were available.
    ///
    /// Only used to build diagnostics for opcodes the decoder does not support, so sources that
    /// cannot peek cheaply may return 0.
    fn lookahead(&mut self, buf: &mut [u8]) -> usize {
        let _ = buf;
        0
    }
}

/// [`ByteSource`] over a borrowed slice.
#[derive(Debug, Clone)]
pub struct SliceCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl ByteSource for SliceCursor<'_> {
    fn next_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn lookahead(&mut self, buf: &mut [u8]) -> usize {
        let rest = &self.bytes[self.pos.min(self.bytes.len())..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        n
    }
}

//! Presence (awareness) update codec.
//!
//! Payload layout: `varuint count`, then per entry `varuint clientId`,
//! `varuint clock`, `varstring state` where the state is a JSON document and
//! the literal `null` marks a removed client. Varints are unsigned LEB128.

/// JSON state marking a removed presence client.
pub const REMOVED_STATE: &str = "null";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: String,
}

impl PresenceEntry {
    #[must_use]
    pub fn removal(client_id: u64, clock: u64) -> Self {
        Self {
            client_id,
            clock,
            state: REMOVED_STATE.to_owned(),
        }
    }

    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.state == REMOVED_STATE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceUpdate {
    pub entries: Vec<PresenceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PresenceDecodeError {
    #[error("presence update ended unexpectedly")]
    UnexpectedEof,
    #[error("presence varint too large")]
    VarintOverflow,
    #[error("presence state is not valid utf-8")]
    InvalidUtf8,
}

impl PresenceUpdate {
    #[must_use]
    pub fn new(entries: Vec<PresenceEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Client ids touched by this update, in payload order.
    #[must_use]
    pub fn client_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| entry.client_id).collect()
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, self.entries.len() as u64);
        for entry in &self.entries {
            write_var_u64(&mut buf, entry.client_id);
            write_var_u64(&mut buf, entry.clock);
            write_var_string(&mut buf, &entry.state);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PresenceDecodeError> {
        let mut reader = Reader { bytes, pos: 0 };
        let count = reader.read_var_u64()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let client_id = reader.read_var_u64()?;
            let clock = reader.read_var_u64()?;
            let state = reader.read_var_string()?;
            entries.push(PresenceEntry {
                client_id,
                clock,
                state,
            });
        }
        Ok(Self { entries })
    }
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value > 0x7F {
        buf.push(0x80 | (value as u8 & 0x7F));
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_var_string(buf: &mut Vec<u8>, value: &str) {
    write_var_u64(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn read_byte(&mut self) -> Result<u8, PresenceDecodeError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(PresenceDecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_var_u64(&mut self) -> Result<u64, PresenceDecodeError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_byte()?;
            if shift >= 64 {
                return Err(PresenceDecodeError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_var_string(&mut self) -> Result<String, PresenceDecodeError> {
        let len = self.read_var_u64()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(PresenceDecodeError::UnexpectedEof)?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        String::from_utf8(slice.to_vec()).map_err(|_| PresenceDecodeError::InvalidUtf8)
    }
}

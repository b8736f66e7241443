//! Mailbox slot words.
//!
//! A slot is one 64-bit word so publishing it is a single atomic store:
//!
//! ```text
//!  63            37 36            8 7      0
//! +----------------+---------------+--------+
//! |   length (27)  |  offset (29)  | cmd(8) |
//! +----------------+---------------+--------+
//! ```

use std::fmt;

const CMD_BITS: u32 = 8;
const OFFSET_BITS: u32 = 29;
const LEN_BITS: u32 = 27;

/// Largest payload offset a slot can carry.
pub const MAX_OFFSET: usize = (1 << OFFSET_BITS) - 1;
/// Largest payload length a slot can carry (128 MiB - 1).
pub const MAX_LEN: usize = (1 << LEN_BITS) - 1;

/// An 8-bit command id. Zero marks a free slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Command(u8);

impl Command {
    /// No command; the slot is free.
    pub const NONE: Command = Command(0);

    #[inline]
    pub const fn new(id: u8) -> Self {
        Command(id)
    }

    #[inline]
    pub const fn id(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self.0)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for Command {
    fn from(id: u8) -> Self {
        Command(id)
    }
}

/// Typed view of a slot word.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Mailbox(u64);

impl Mailbox {
    /// The all-zero word of a free, never used slot.
    pub const FREE: Mailbox = Mailbox(0);

    /// Builds a slot word.
    ///
    /// Offset and length must fit their fields.
    #[inline]
    pub fn new(cmd: Command, offset: usize, len: usize) -> Self {
        assert!(offset <= MAX_OFFSET, "payload offset {offset} does not fit a slot");
        assert!(len <= MAX_LEN, "payload length {len} does not fit a slot");
        Mailbox(
            cmd.0 as u64 | ((offset as u64) << CMD_BITS) | ((len as u64) << (CMD_BITS + OFFSET_BITS)),
        )
    }

    /// Slot word for a message without payload.
    #[inline]
    pub const fn command_only(cmd: Command) -> Self {
        Mailbox(cmd.0 as u64)
    }

    #[inline]
    pub const fn from_word(word: u64) -> Self {
        Mailbox(word)
    }

    #[inline]
    pub const fn word(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn cmd(self) -> Command {
        Command(self.0 as u8)
    }

    #[inline]
    pub const fn offset(self) -> usize {
        ((self.0 >> CMD_BITS) & MAX_OFFSET as u64) as usize
    }

    #[inline]
    pub const fn len(self) -> usize {
        (self.0 >> (CMD_BITS + OFFSET_BITS)) as usize
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub const fn is_free(self) -> bool {
        self.cmd().is_none()
    }

    /// Same word with the command tag replaced.
    #[inline]
    pub const fn with_cmd(self, cmd: Command) -> Self {
        Mailbox((self.0 & !0xff) | cmd.0 as u64)
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("cmd", &self.cmd().0)
            .field("offset", &self.offset())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_layout() {
        let mb = Mailbox::new(Command::new(0xab), 0x1234, 0x56);
        assert_eq!(mb.word() & 0xff, 0xab);
        assert_eq!((mb.word() >> 8) & ((1 << 29) - 1), 0x1234);
        assert_eq!(mb.word() >> 37, 0x56);
        assert_eq!(mb.cmd(), Command::new(0xab));
        assert_eq!(mb.offset(), 0x1234);
        assert_eq!(mb.len(), 0x56);
    }

    #[test]
    fn test_field_limits() {
        let mb = Mailbox::new(Command::new(255), MAX_OFFSET, MAX_LEN);
        assert_eq!(mb.word(), u64::MAX);
        assert_eq!(mb.offset(), MAX_OFFSET);
        assert_eq!(mb.len(), MAX_LEN);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_length_overflow() {
        Mailbox::new(Command::new(1), 0, MAX_LEN + 1);
    }

    #[test]
    fn test_clearing_cmd_keeps_payload_fields() {
        let mb = Mailbox::new(Command::new(9), 4096, 24);
        let freed = mb.with_cmd(Command::NONE);
        assert!(freed.is_free());
        assert_eq!(freed.offset(), 4096);
        assert_eq!(freed.len(), 24);
        assert!(Mailbox::command_only(Command::new(1)).is_empty());
    }
}

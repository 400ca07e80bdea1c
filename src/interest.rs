//! Readiness interest and received-event bitmasks.
//!
//! Mirrors the shape of `mio`'s `Interests` (a hand-rolled bitmask with
//! `const` flag values and `BitOr`) but widened to also carry the
//! kernel-reported bits (`HANGUP`, `ERROR`) that this crate's [`Channel`]
//! dispatch needs to see, since here the same bitmask type is reused for
//! both "what a Channel asks for" and "what the Selector observed".
//!
//! [`Channel`]: crate::channel::Channel

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// A set of readiness bits.
///
/// `Interest::NONE` means "don't tell me about this fd" for registration
/// purposes, and "nothing happened" for a received-events value.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct Interest(u32);

const READABLE: u32 = 0b0000_0001;
const WRITABLE: u32 = 0b0000_0010;
const PRIORITY: u32 = 0b0000_0100;
const ERROR: u32 = 0b0000_1000;
const HANGUP: u32 = 0b0001_0000;

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(READABLE);
    pub const WRITABLE: Interest = Interest(WRITABLE);
    pub const PRIORITY: Interest = Interest(PRIORITY);
    pub const ERROR: Interest = Interest(ERROR);
    pub const HANGUP: Interest = Interest(HANGUP);

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub const fn is_readable(self) -> bool {
        (self.0 & (READABLE | PRIORITY)) != 0
    }

    pub const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    pub const fn is_priority(self) -> bool {
        (self.0 & PRIORITY) != 0
    }

    pub const fn is_error(self) -> bool {
        (self.0 & ERROR) != 0
    }

    pub const fn is_hangup(self) -> bool {
        (self.0 & HANGUP) != 0
    }

    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }

    pub fn contains(self, other: Interest) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut write_flag = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{name}")?;
            first = false;
            Ok(())
        };

        if self.is_readable() {
            write_flag(f, "READABLE")?;
        }
        if self.is_writable() {
            write_flag(f, "WRITABLE")?;
        }
        if self.is_priority() {
            write_flag(f, "PRIORITY")?;
        }
        if self.is_error() {
            write_flag(f, "ERROR")?;
        }
        if self.is_hangup() {
            write_flag(f, "HANGUP")?;
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_query() {
        let i = Interest::READABLE | Interest::WRITABLE;
        assert!(i.is_readable());
        assert!(i.is_writable());
        assert!(!i.is_error());
    }

    #[test]
    fn hangup_without_read_is_distinguishable() {
        let revents = Interest::HANGUP;
        assert!(revents.is_hangup());
        assert!(!revents.is_readable());
    }

    #[test]
    fn none_is_empty() {
        assert!(Interest::NONE.is_none());
        assert!(!(Interest::READABLE).is_none());
    }
}

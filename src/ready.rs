use std::{fmt, ops};

/// A set of readiness/event bits, shared by descriptor watches, poll
/// records and the injectable poll primitive.
///
/// The requested side of a watch may combine [`readable`], [`writable`]
/// and [`priority`]; [`error`], [`hangup`] and [`invalid`] are never
/// requested explicitly — they are unsolicited bits the OS sets on the
/// received side regardless of what was asked for (spec section 6).
///
/// [`readable`]: Ready::readable
/// [`writable`]: Ready::writable
/// [`priority`]: Ready::priority
/// [`error`]: Ready::error
/// [`hangup`]: Ready::hangup
/// [`invalid`]: Ready::invalid
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ready(u8);

const READABLE: u8 = 0b0000_0001;
const WRITABLE: u8 = 0b0000_0010;
const PRIORITY: u8 = 0b0000_0100;
const ERROR: u8 = 0b0000_1000;
const HANGUP: u8 = 0b0001_0000;
const INVALID: u8 = 0b0010_0000;
const READY_ALL: u8 = READABLE | WRITABLE | PRIORITY | ERROR | HANGUP | INVALID;

/// Bits never requested, only ever reported back (spec section 6).
pub const UNSOLICITED: Ready = Ready(ERROR | HANGUP | INVALID);

impl Ready {
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    #[inline]
    pub fn priority() -> Ready {
        Ready(PRIORITY)
    }

    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    #[inline]
    pub fn hangup() -> Ready {
        Ready(HANGUP)
    }

    #[inline]
    pub fn invalid() -> Ready {
        Ready(INVALID)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_priority(self) -> bool {
        self.contains(Ready::priority())
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Ready::error())
    }

    #[inline]
    pub fn is_hangup(self) -> bool {
        self.contains(Ready::hangup())
    }

    #[inline]
    pub fn is_invalid(self) -> bool {
        self.contains(Ready::invalid())
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn intersects(self, other: Ready) -> bool {
        (self.0 & other.0) != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// Filter a received mask back to `requested ∪ {error, hangup, invalid}`
    /// (spec section 6): bits the watch asked for, plus the always-let-through
    /// unsolicited bits.
    #[inline]
    pub fn filter_received(self, requested: Ready) -> Ready {
        self & (requested | UNSOLICITED)
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Not for Ready {
    type Output = Ready;

    #[inline]
    fn not(self) -> Ready {
        Ready(!self.0 & READY_ALL)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "readable"),
            (Ready::writable(), "writable"),
            (Ready::priority(), "priority"),
            (Ready::error(), "error"),
            (Ready::hangup(), "hangup"),
            (Ready::invalid(), "invalid"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", msg)?;
                one = true;
            }
        }

        if !one {
            write!(fmt, "(empty)")?;
        }

        Ok(())
    }
}

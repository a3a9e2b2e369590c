use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Index, IndexMut, Sub};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// The two ends of a channel. The names are historical; the only asymmetry
/// is that message expiration applies to the slave.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Master,
    Slave,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Master, Side::Slave];

    pub fn other(self) -> Side {
        match self {
            Side::Master => Side::Slave,
            Side::Slave => Side::Master,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Side::Master => "master",
            Side::Slave => "slave",
        }
    }

    /// Direction label for propagation into this side.
    pub fn dir(self) -> &'static str {
        match self {
            Side::Master => "pull",
            Side::Slave => "push",
        }
    }
}

/// A value kept once per channel side, indexed by `Side`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pair<T> {
    pub master: T,
    pub slave: T,
}

impl<T> Pair<T> {
    pub fn new(master: T, slave: T) -> Pair<T> {
        Pair { master, slave }
    }
}

impl<T> Index<Side> for Pair<T> {
    type Output = T;

    fn index(&self, side: Side) -> &T {
        match side {
            Side::Master => &self.master,
            Side::Slave => &self.slave,
        }
    }
}

impl<T> IndexMut<Side> for Pair<T> {
    fn index_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Master => &mut self.master,
            Side::Slave => &mut self.slave,
        }
    }
}

/// The synchronizable message flags, one bit each, in the fixed `DFRST`
/// order the state file uses.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const DRAFT: Flags = Flags(1 << 0);
    pub const FLAGGED: Flags = Flags(1 << 1);
    pub const REPLIED: Flags = Flags(1 << 2);
    pub const SEEN: Flags = Flags(1 << 3);
    pub const TRASHED: Flags = Flags(1 << 4);

    const CHARS: [(u8, Flags); 5] = [
        (b'D', Flags::DRAFT),
        (b'F', Flags::FLAGGED),
        (b'R', Flags::REPLIED),
        (b'S', Flags::SEEN),
        (b'T', Flags::TRASHED),
    ];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Flags {
        Flags(bits & 0x1f)
    }

    /// Parse the state-file form: a subset of `DFRST` in that order.
    pub fn parse(s: &str) -> Option<Flags> {
        let mut flags = Flags::NONE;
        let mut rest = s.as_bytes();
        for (ch, flag) in Flags::CHARS {
            if rest.first() == Some(&ch) {
                flags |= flag;
                rest = &rest[1..];
            }
        }
        rest.is_empty().then_some(flags)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl Sub for Flags {
    type Output = Flags;

    /// The flags in `self` that are not in `rhs`.
    fn sub(self, rhs: Flags) -> Flags {
        Flags(self.0 & !rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (ch, flag) in Flags::CHARS {
            if self.contains(flag) {
                write!(f, "{}", ch as char)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({})", self)
    }
}

pub const TUID_LEN: usize = 12;

/// Temporary message identifier: 12 characters from the base64 alphabet,
/// embedded as an `X-TUID:` header to relocate a copy whose final UID the
/// destination could not report synchronously.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tuid([u8; TUID_LEN]);

impl Tuid {
    pub fn random() -> Tuid {
        let mut raw = [0u8; 9];
        rand::thread_rng().fill_bytes(&mut raw);
        let enc = STANDARD_NO_PAD.encode(raw);
        let mut tag = [0u8; TUID_LEN];
        tag.copy_from_slice(enc.as_bytes());
        Tuid(tag)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Tuid> {
        let tag: [u8; TUID_LEN] = bytes.try_into().ok()?;
        tag.iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
            .then_some(Tuid(tag))
    }

    pub fn as_bytes(&self) -> &[u8; TUID_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????????????")
    }
}

impl fmt::Display for Tuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Tuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tuid({})", self)
    }
}

/// One side of a sync record. The on-disk formats encode this as an integer:
/// `0` for `Absent`, `-1` for `Skipped`, `-2` for `Pending`, the UID
/// otherwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UidSlot {
    /// No counterpart on this side.
    #[default]
    Absent,
    /// Deliberately not propagated (over the size limit); a renew candidate.
    Skipped,
    /// A copy is in flight or unresolved; the TUID locates it if still known.
    Pending(Option<Tuid>),
    Uid(u32),
}

impl UidSlot {
    pub fn from_disk(v: i64) -> Option<UidSlot> {
        match v {
            0 => Some(UidSlot::Absent),
            -1 => Some(UidSlot::Skipped),
            -2 => Some(UidSlot::Pending(None)),
            v if v > 0 && v <= u32::MAX as i64 => Some(UidSlot::Uid(v as u32)),
            _ => None,
        }
    }

    pub fn disk(self) -> i64 {
        match self {
            UidSlot::Absent => 0,
            UidSlot::Skipped => -1,
            UidSlot::Pending(_) => -2,
            UidSlot::Uid(u) => u as i64,
        }
    }

    pub fn uid(self) -> Option<u32> {
        match self {
            UidSlot::Uid(u) => Some(u),
            _ => None,
        }
    }

    pub fn tuid(self) -> Option<Tuid> {
        match self {
            UidSlot::Pending(t) => t,
            _ => None,
        }
    }

    /// Skipped or pending, i.e. negative on disk.
    pub fn is_placeholder(self) -> bool {
        matches!(self, UidSlot::Skipped | UidSlot::Pending(_))
    }
}

//! Bit roles

use core::fmt;

/// Role of one bit inside a 32-bit ISP instruction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BitOp {
    /// Always clear
    Zero,
    /// Always set
    One,
    /// Don't care on input and output
    #[default]
    Ignore,
    /// Carries bit `n` of the memory address
    Address(u8),
    /// Carries bit `n` of the data byte written to the target
    Input(u8),
    /// Carries bit `n` of the data byte read back from the target
    Output(u8),
}

impl BitOp {
    /// Parse one token of the conventional notation
    ///
    /// `0`, `1`, `x`, `i`, `o`, `a` and `aN`. Bare `a`, `i` and `o` take the
    /// bit number from `position_in_byte`.
    pub(crate) fn parse_token(token: &str, position_in_byte: u8) -> Option<Self> {
        match token {
            "0" => Some(Self::Zero),
            "1" => Some(Self::One),
            "x" => Some(Self::Ignore),
            "a" => Some(Self::Address(position_in_byte)),
            "i" => Some(Self::Input(position_in_byte)),
            "o" => Some(Self::Output(position_in_byte)),
            _ => {
                let n = token.strip_prefix('a')?;
                if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                n.parse().ok().map(Self::Address)
            }
        }
    }

    /// Highest index this role may carry, if it carries one
    pub(crate) fn index_limit(&self) -> Option<(u8, u8)> {
        match *self {
            Self::Address(n) => Some((n, 31)),
            Self::Input(n) | Self::Output(n) => Some((n, 7)),
            _ => None,
        }
    }
}

impl fmt::Display for BitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "0"),
            Self::One => write!(f, "1"),
            Self::Ignore => write!(f, "x"),
            Self::Address(n) => write!(f, "a{}", n),
            Self::Input(_) => write!(f, "i"),
            Self::Output(_) => write!(f, "o"),
        }
    }
}

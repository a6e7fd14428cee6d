use serde::{Deserialize, Serialize};

/// An amount of kermesse tokens.
///
/// Tokens are whole, non-negative units. Arithmetic is checked: callers
/// decide what an overflow or an underflow means for them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Tokens(u64);

impl Tokens {
    /// Creates an amount from a raw token count.
    pub const fn new(amount: u64) -> Self {
        Self(amount)
    }

    /// Returns zero tokens.
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw token count.
    pub const fn amount(&self) -> u64 {
        self.0
    }

    /// Returns true if the amount is zero.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two amounts, returning None on overflow.
    pub fn checked_add(self, other: Tokens) -> Option<Tokens> {
        self.0.checked_add(other.0).map(Tokens)
    }

    /// Subtracts an amount, returning None if the result would be negative.
    pub fn checked_sub(self, other: Tokens) -> Option<Tokens> {
        self.0.checked_sub(other.0).map(Tokens)
    }

    /// Multiplies by a quantity, returning None on overflow.
    pub fn checked_mul(self, quantity: u32) -> Option<Tokens> {
        self.0.checked_mul(u64::from(quantity)).map(Tokens)
    }

    /// Converts to a signed value for storage, returning None above `i64::MAX`.
    pub fn to_i64(self) -> Option<i64> {
        i64::try_from(self.0).ok()
    }

    /// Converts from a signed stored value, returning None for negatives.
    pub fn from_i64(value: i64) -> Option<Tokens> {
        u64::try_from(value).ok().map(Tokens)
    }
}

impl std::fmt::Display for Tokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} tokens", self.0)
    }
}

impl From<u64> for Tokens {
    fn from(amount: u64) -> Self {
        Self(amount)
    }
}

impl From<Tokens> for u64 {
    fn from(tokens: Tokens) -> Self {
        tokens.0
    }
}

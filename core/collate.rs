use std::{borrow::Cow, cmp::Ordering, str::FromStr as _};

use crate::{error::JoinError, Result};

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display, strum_macros::EnumString, Default,
)]
#[strum(ascii_case_insensitive)]
/// **Pre defined collation sequences**\
/// Collating functions only matter when comparing and hashing text keys.
/// Numeric values are always compared numerically, and BLOBs byte-by-byte.
#[repr(u8)]
pub enum CollationSeq {
    Unset = 0,
    #[default]
    Binary = 1,
    NoCase = 2,
    Rtrim = 3,
}

impl CollationSeq {
    pub fn new(collation: &str) -> Result<Self> {
        CollationSeq::from_str(collation).map_err(|_| {
            JoinError::InvalidArgument(format!("no such collation sequence: {collation}"))
        })
    }

    #[inline(always)]
    pub fn compare_strings(&self, lhs: &str, rhs: &str) -> Ordering {
        match self {
            CollationSeq::Unset | CollationSeq::Binary => lhs.cmp(rhs),
            CollationSeq::NoCase => {
                let nocase_lhs = uncased::UncasedStr::new(lhs);
                let nocase_rhs = uncased::UncasedStr::new(rhs);
                nocase_lhs.cmp(nocase_rhs)
            }
            CollationSeq::Rtrim => lhs.trim_end().cmp(rhs.trim_end()),
        }
    }

    /// The form of `text` that is fed to the join-key hasher. Two strings
    /// that compare equal under this collation normalize to the same bytes.
    #[inline]
    pub fn normalize<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match self {
            CollationSeq::NoCase if text.bytes().any(|b| b.is_ascii_uppercase()) => {
                Cow::Owned(text.to_ascii_lowercase())
            }
            CollationSeq::Rtrim => Cow::Borrowed(text.trim_end()),
            _ => Cow::Borrowed(text),
        }
    }
}

//! On-disk format versions.

use std::fmt;

/// A metadata format version.
///
/// Every serializer in this workspace takes one of these explicitly. Only
/// [`CodecVersion::LATEST`] is ever written by production code; older versions
/// exist so that files written by earlier releases can still be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CodecVersion {
    V1_13,
    V1_14,
    V1_15,
    V1_16,
}

impl CodecVersion {
    /// The version all new data is written in.
    pub const LATEST: Self = Self::V1_16;

    /// Every version this build can read, oldest first.
    pub const ALL: [Self; 4] = [Self::V1_13, Self::V1_14, Self::V1_15, Self::V1_16];

    /// Whether whole numbers use the compact integer tags.
    #[inline]
    #[must_use]
    pub fn has_integer_tags(self) -> bool {
        self >= Self::V1_14
    }

    /// Whether the binary datum tag exists.
    #[inline]
    #[must_use]
    pub fn has_binary(self) -> bool {
        self >= Self::V1_15
    }

    /// Whether versioned registers carry a timestamp.
    #[inline]
    #[must_use]
    pub fn has_timestamps(self) -> bool {
        self >= Self::V1_14
    }
}

impl fmt::Display for CodecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::V1_13 => "v1.13",
            Self::V1_14 => "v1.14",
            Self::V1_15 => "v1.15",
            Self::V1_16 => "v1.16",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(CodecVersion::V1_13 < CodecVersion::V1_14);
        assert_eq!(CodecVersion::ALL.last(), Some(&CodecVersion::LATEST));
        assert!(CodecVersion::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_feature_gates() {
        assert!(!CodecVersion::V1_13.has_integer_tags());
        assert!(CodecVersion::V1_14.has_integer_tags());
        assert!(!CodecVersion::V1_14.has_binary());
        assert!(CodecVersion::V1_15.has_binary());
        assert_eq!(CodecVersion::LATEST.to_string(), "v1.16");
    }
}

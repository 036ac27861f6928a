use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, str};

macro_rules! primitive_id {
    ($name:ident, $repr_type:ty) => {
        #[derive(
            Clone,
            Copy,
            Default,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub $repr_type);

        impl From<$name> for $repr_type {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl From<$repr_type> for $name {
            fn from(repr: $repr_type) -> Self {
                Self(repr)
            }
        }

        impl str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let id = s.parse::<$repr_type>()?;
                Ok(Self(id))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

primitive_id!(UserId, i64);
primitive_id!(SessionId, i64);

impl From<usize> for UserId {
    fn from(index: usize) -> Self {
        Self(index as i64)
    }
}

impl SessionId {
    /// Sentinel stored in `userSoftLockSessionId` when nobody holds the soft lock
    pub const NO_SESSION: SessionId = Self(i64::MIN);

    /// Draw a random positive 63-bit session id
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.random_range(1..=i64::MAX))
    }

    pub fn is_none(self) -> bool {
        self == Self::NO_SESSION
    }
}

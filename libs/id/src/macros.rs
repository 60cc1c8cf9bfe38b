//! Macro for defining UUID-backed ID types.

/// Defines a newtype around a v4 UUID.
///
/// The generated type renders as a lowercase hyphenated UUID and parses only
/// that form (braced, URN and simple forms are rejected so a name has exactly
/// one spelling in the registry). It serializes as a plain string.
///
/// ```ignore
/// define_id!(InstanceName, "instance name");
///
/// let name = InstanceName::new();
/// let parsed: InstanceName = name.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Uuid);

        impl $name {
            /// Human-readable kind, used in parse errors.
            pub const KIND: &'static str = $kind;

            /// Generates a fresh random ID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4())
            }

            /// Parses an ID from its hyphenated form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                // 8-4-4-4-12
                if s.len() != 36 {
                    return Err($crate::IdError::Invalid {
                        kind: Self::KIND,
                        value: s.to_string(),
                    });
                }

                let uuid = $crate::Uuid::try_parse(s).map_err(|_| $crate::IdError::Invalid {
                    kind: Self::KIND,
                    value: s.to_string(),
                })?;

                Ok(Self(uuid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

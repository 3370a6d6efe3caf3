use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Debug, Display, Formatter};

/// Wraps a secret (connection URL, API token) so it is redacted when
/// formatted or serialized. Use [`Sensitive::expose`] to read it.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Sensitive<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> Debug for Sensitive<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> Display for Sensitive<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T: Serialize> Serialize for Sensitive<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("***")
    }
}

/// Secrets are read from config in the clear.
impl<'de, T: Deserialize<'de>> Deserialize<'de> for Sensitive<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        T::deserialize(deserializer).map(Sensitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_when_formatted() {
        let url = Sensitive::new("postgres://app:hunter2@db/prod".to_string());
        assert_eq!(format!("{:?}", url), "[REDACTED]");
        assert_eq!(format!("{}", url), "[REDACTED]");
        assert!(url.expose().contains("hunter2"));
    }

    #[test]
    fn redacted_when_serialized_but_read_in_clear() {
        let token: Sensitive<String> = serde_json::from_str("\"tok_123\"").unwrap();
        assert_eq!(token.expose(), "tok_123");
        assert_eq!(serde_json::to_string(&token).unwrap(), "\"***\"");
    }
}

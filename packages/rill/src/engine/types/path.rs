use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A dot-separated path into a nested value, e.g. `"address.city"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Path(pub Vec<SmolStr>);

impl Path {
    pub fn new(s: &str) -> Self {
        if s.is_empty() {
            Path(vec![])
        } else {
            Path(s.split('.').map(SmolStr::new).collect())
        }
    }

    pub fn from_segments(segments: impl IntoIterator<Item = SmolStr>) -> Self {
        Path(segments.into_iter().collect())
    }

    pub fn as_str(&self) -> String {
        self.0
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn segments(&self) -> &[SmolStr] {
        &self.0
    }
}

impl Serialize for Path {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Ok(Path::new(&s))
    }
}

#[cfg(test)]
mod path_tests {
    use super::*;

    #[test]
    fn test_new_empty() {
        assert_eq!(Path::new(""), Path(vec![]));
        assert!(Path::new("").is_empty());
    }

    #[test]
    fn test_new_nested() {
        let path = Path::new("a.b.c");
        assert_eq!(path.segments().len(), 3);
        assert_eq!(path.as_str(), "a.b.c");
    }

    #[test]
    fn test_serde_as_string() {
        let path = Path::new("payload.record.id");
        let json_str = serde_json::to_string(&path).unwrap();
        assert_eq!(json_str, "\"payload.record.id\"");
        let restored: Path = serde_json::from_str(&json_str).unwrap();
        assert_eq!(restored, path);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A configured outbound destination. The live provider is held by the
/// registry, never serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Subscriber {
    pub fn new(uri: impl Into<String>, enable: bool) -> Self {
        Self {
            uri: uri.into(),
            enable,
            ..Self::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A named report route pointing at a subscriber plus a sub-path/topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subscriber_id: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Subscriptor {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        subscriber_id: impl Into<String>,
        enable: bool,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            subscriber_id: subscriber_id.into(),
            enable,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptor_uses_camel_case_foreign_key() {
        let sub = Subscriptor::new("route", "events", "abc", true);
        let json = serde_json::to_value(&sub).unwrap();
        assert_eq!(json["subscriberId"], "abc");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn subscriber_without_id_deserializes() {
        let sub: Subscriber =
            serde_json::from_str(r#"{"enable":true,"uri":"tcp://localhost:9000"}"#).unwrap();
        assert!(sub.id.is_empty());
        assert!(sub.enable);
        assert!(sub.properties.is_empty());
    }
}

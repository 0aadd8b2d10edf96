use std::collections::BTreeMap;

use nova_core::ExternalRef;
use serde::{Deserialize, Serialize};

/// Board-neutral shape of a single item property.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Title(String),
    Text(String),
    Select(Option<String>),
    Status(String),
}

impl PropertyValue {
    /// Text carried by the property, if any and non-empty.
    pub fn text(&self) -> Option<&str> {
        let s = match self {
            PropertyValue::Title(s) | PropertyValue::Text(s) | PropertyValue::Status(s) => s.as_str(),
            PropertyValue::Select(opt) => opt.as_deref()?,
        };
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardItem {
    pub id: ExternalRef,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub created_time: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl BoardItem {
    pub fn new(id: &str) -> Self {
        Self {
            id: ExternalRef::from_str(id),
            url: None,
            created_time: String::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: PropertyValue) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    pub fn property_text(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(PropertyValue::text)
    }

    pub fn is_ready(&self, schema: &BoardSchema) -> bool {
        self.property_text(&schema.status_property) == Some(schema.ready_value.as_str())
    }

    pub fn claim_marker(&self, schema: &BoardSchema) -> Option<&str> {
        self.property_text(&schema.marker_property)
    }
}

/// Which properties carry the ready predicate and the claim marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSchema {
    pub status_property: String,
    pub ready_value: String,
    pub marker_property: String,
}

impl Default for BoardSchema {
    fn default() -> Self {
        Self {
            status_property: "Status".to_string(),
            ready_value: "Agent's Turn".to_string(),
            marker_property: "novaos_run_id".to_string(),
        }
    }
}

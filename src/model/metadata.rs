use serde::{Deserialize, Serialize};

use super::traits::TraitValue;

/// One `(trait, value)` pair produced by a generation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAttribute {
    pub trait_name: String,
    pub value: TraitValue,
    /// Display label overriding the value on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ResolvedAttribute {
    pub fn new(trait_name: impl Into<String>, value: TraitValue) -> Self {
        Self {
            trait_name: trait_name.into(),
            value,
            label: None,
        }
    }

    pub fn to_wire(&self) -> Attribute {
        Attribute {
            trait_type: self.trait_name.clone(),
            value: self
                .label
                .clone()
                .unwrap_or_else(|| self.value.to_string()),
        }
    }
}

/// Wire form of an attribute: values are always strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub trait_type: String,
    pub value: String,
}

/// Stable output of one generation pass, and the input of every render.
///
/// `id` is the correlation key threaded unchanged from generate to render.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub id: u64,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_glb_url: Option<String>,
}

impl Metadata {
    pub fn from_resolved(id: u64, filename: impl Into<String>, resolved: &[ResolvedAttribute]) -> Self {
        Self {
            id,
            filename: filename.into(),
            attributes: resolved.iter().map(ResolvedAttribute::to_wire).collect(),
            rendered_file_url: None,
            rendered_glb_url: None,
        }
    }

    pub fn attribute(&self, trait_type: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.trait_type == trait_type)
            .map(|a| a.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stringified() {
        let mut hat = ResolvedAttribute::new("Hat", TraitValue::Reference("hat_01".into()));
        hat.label = Some("Crown".into());
        let resolved = vec![
            ResolvedAttribute::new("Height", TraitValue::Scalar(1.0 / 3.0)),
            ResolvedAttribute::new("Legs", TraitValue::Integer(4)),
            hat,
        ];
        let metadata = Metadata::from_resolved(7, "scene.json", &resolved);

        assert_eq!(metadata.attribute("Height"), Some("0.33"));
        assert_eq!(metadata.attribute("Legs"), Some("4"));
        assert_eq!(metadata.attribute("Hat"), Some("Crown"));
    }

    #[test]
    fn optional_urls_are_omitted() {
        let metadata = Metadata {
            id: 1,
            ..Default::default()
        };
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(!json.contains("rendered_file_url"));
        assert!(!json.contains("rendered_glb_url"));
    }

    #[test]
    fn parses_client_payload() {
        let json = r#"{
            "id": 3,
            "filename": "robot.blend",
            "attributes": [{"trait_type": "Color", "value": "Red"}],
            "rendered_file_url": "http://localhost:8118/rendered/a.glb"
        }"#;
        let metadata: Metadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.id, 3);
        assert_eq!(metadata.attribute("Color"), Some("Red"));
        assert!(metadata.rendered_glb_url.is_none());
    }

    #[test]
    fn id_is_required_on_the_wire() {
        let json = r#"{"filename": "robot.blend", "attributes": []}"#;
        let err = serde_json::from_str::<Metadata>(json).unwrap_err();
        assert!(err.to_string().contains("id"), "{err}");
    }
}

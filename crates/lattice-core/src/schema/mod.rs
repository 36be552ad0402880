//! Static per-node-type schema registry.
//!
//! The registry is pure data, built once and read-only at runtime. It is the
//! single source of truth for which properties a node type carries, which
//! inputs/outputs it declares, and whether it may be deleted. Both the
//! workflow validator and the evolution validator consult it; nothing here
//! reflects over live values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::workflow::NodeType;

// ---------------------------------------------------------------------------
// Property metadata
// ---------------------------------------------------------------------------

/// Kind tag for a configurable property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    Select,
    Multiselect,
    Textarea,
    Code,
    Reference,
    ConditionRules,
    InputSelector,
    McpServerSelector,
    SchemaBuilder,
    Group,
    Array,
}

impl PropertyType {
    /// Whether the property holds free text an agent may rewrite.
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            PropertyType::String
                | PropertyType::Textarea
                | PropertyType::Code
                | PropertyType::Reference
        )
    }
}

/// Visibility predicate: show this property when `key` has one of `values`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowWhen {
    pub key: String,
    pub values: Vec<String>,
}

/// One configurable property of a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpec {
    pub key: String,
    pub label: String,
    pub property_type: PropertyType,
    pub required: bool,
    /// Allowed values for select/multiselect.
    pub options: Vec<String>,
    pub show_when: Option<ShowWhen>,
    /// Members of a `group` property.
    pub properties: Vec<PropertySpec>,
    /// Element spec of an `array` property.
    pub item: Option<Box<PropertySpec>>,
}

impl PropertySpec {
    pub fn new(key: &str, label: &str, property_type: PropertyType) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            property_type,
            required: false,
            options: Vec::new(),
            show_when: None,
            properties: Vec::new(),
            item: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn show_when(mut self, key: &str, values: &[&str]) -> Self {
        self.show_when = Some(ShowWhen {
            key: key.to_string(),
            values: values.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn with_properties(mut self, properties: Vec<PropertySpec>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_item(mut self, item: PropertySpec) -> Self {
        self.item = Some(Box::new(item));
        self
    }

    /// Check `value` against this property's declared type.
    ///
    /// Returns an actionable message on mismatch.
    pub fn check_value(&self, value: &Value) -> std::result::Result<(), String> {
        match self.property_type {
            PropertyType::String
            | PropertyType::Textarea
            | PropertyType::Code
            | PropertyType::Reference
            | PropertyType::SchemaBuilder => {
                if value.is_string() {
                    Ok(())
                } else {
                    Err(format!("property '{}' expects a string", self.key))
                }
            }
            PropertyType::Number => {
                if value.is_number() {
                    Ok(())
                } else {
                    Err(format!("property '{}' expects a number", self.key))
                }
            }
            PropertyType::Boolean => {
                if value.is_boolean() {
                    Ok(())
                } else {
                    Err(format!("property '{}' expects a boolean", self.key))
                }
            }
            PropertyType::Select => match value.as_str() {
                Some(s) if self.options.is_empty() || self.options.iter().any(|o| o == s) => Ok(()),
                Some(s) => Err(format!(
                    "property '{}' does not allow '{s}' (allowed: {})",
                    self.key,
                    self.options.join(", ")
                )),
                None => Err(format!("property '{}' expects a string option", self.key)),
            },
            PropertyType::Multiselect => {
                let Some(items) = value.as_array() else {
                    return Err(format!(
                        "property '{}' expects an array of strings",
                        self.key
                    ));
                };
                for item in items {
                    let Some(s) = item.as_str() else {
                        return Err(format!(
                            "property '{}' expects an array of strings",
                            self.key
                        ));
                    };
                    if !self.options.is_empty() && !self.options.iter().any(|o| o == s) {
                        return Err(format!("property '{}' does not allow '{s}'", self.key));
                    }
                }
                Ok(())
            }
            PropertyType::ConditionRules => {
                let ok = value
                    .as_object()
                    .is_some_and(|o| o.get("rules").is_some_and(Value::is_array));
                if ok {
                    Ok(())
                } else {
                    Err(format!(
                        "property '{}' expects an object with a 'rules' array",
                        self.key
                    ))
                }
            }
            PropertyType::InputSelector => {
                let ok = value.as_array().is_some_and(|items| {
                    items.iter().all(|i| {
                        i.as_object().is_some_and(|o| {
                            o.get("variable").is_some_and(Value::is_string)
                                && o.get("reference").is_some_and(Value::is_string)
                        })
                    })
                });
                if ok {
                    Ok(())
                } else {
                    Err(format!(
                        "property '{}' expects [{{variable, reference}}] entries",
                        self.key
                    ))
                }
            }
            PropertyType::McpServerSelector => {
                let ok = value
                    .as_array()
                    .is_some_and(|items| items.iter().all(Value::is_string));
                if ok {
                    Ok(())
                } else {
                    Err(format!(
                        "property '{}' expects an array of server ids",
                        self.key
                    ))
                }
            }
            PropertyType::Group => {
                if value.is_object() {
                    Ok(())
                } else {
                    Err(format!("property '{}' expects an object", self.key))
                }
            }
            PropertyType::Array => {
                if value.is_array() {
                    Ok(())
                } else {
                    Err(format!("property '{}' expects an array", self.key))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Node type schemas
// ---------------------------------------------------------------------------

/// Full schema for one node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTypeSchema {
    pub node_type: NodeType,
    pub properties: Vec<PropertySpec>,
    /// Named input ports.
    pub inputs: Vec<String>,
    /// Output fields downstream references may address.
    pub outputs: Vec<String>,
    pub deletable: bool,
    pub hidden: bool,
}

impl NodeTypeSchema {
    pub fn property(&self, key: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.key == key)
    }
}

/// Segments that must never appear in a config path.
pub fn is_reserved_segment(segment: &str) -> bool {
    matches!(segment, "__proto__" | "prototype" | "constructor")
}

/// Registry of all node type schemas. Read-only after construction.
pub struct SchemaRegistry {
    schemas: HashMap<NodeType, NodeTypeSchema>,
}

impl SchemaRegistry {
    pub fn schema_for(&self, node_type: NodeType) -> Option<&NodeTypeSchema> {
        self.schemas.get(&node_type)
    }

    pub fn node_types(&self) -> impl Iterator<Item = NodeType> + '_ {
        self.schemas.keys().copied()
    }

    /// Walk `path` into the property tree of `node_type`.
    ///
    /// Group segments descend into `properties`; array segments accept a
    /// numeric index and descend into `item`. Returns the spec the final
    /// segment resolves to.
    pub fn resolve_property(&self, node_type: NodeType, path: &[&str]) -> Option<&PropertySpec> {
        let schema = self.schema_for(node_type)?;
        let (first, rest) = path.split_first()?;
        let mut spec = schema.property(first)?;
        let mut remaining = rest;

        while let Some((segment, rest)) = remaining.split_first() {
            match spec.property_type {
                PropertyType::Group => {
                    spec = spec.properties.iter().find(|p| p.key == *segment)?;
                }
                PropertyType::Array => {
                    if segment.parse::<usize>().is_err() {
                        return None;
                    }
                    spec = spec.item.as_deref()?;
                }
                _ => return None,
            }
            remaining = rest;
        }
        Some(spec)
    }
}

/// The process-wide registry.
pub fn registry() -> &'static SchemaRegistry {
    static REGISTRY: OnceLock<SchemaRegistry> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

fn name_prop() -> PropertySpec {
    PropertySpec::new("name", "Name", PropertyType::String).required()
}

fn timeout_prop() -> PropertySpec {
    PropertySpec::new("timeout", "Timeout (ms)", PropertyType::Number)
}

fn agent_schema(node_type: NodeType, models: &[&str]) -> NodeTypeSchema {
    NodeTypeSchema {
        node_type,
        properties: vec![
            name_prop(),
            PropertySpec::new("userQuery", "Prompt", PropertyType::Textarea).required(),
            PropertySpec::new("model", "Model", PropertyType::Select).options(models),
            PropertySpec::new("systemPrompt", "System prompt", PropertyType::Textarea),
            PropertySpec::new("workingDirectory", "Working directory", PropertyType::String),
            PropertySpec::new("sessionReference", "Resume session", PropertyType::Reference),
            PropertySpec::new("outputSchema", "Output schema", PropertyType::SchemaBuilder),
            PropertySpec::new("outputFilePath", "Output file", PropertyType::String),
            timeout_prop(),
            PropertySpec::new("mcpServers", "MCP servers", PropertyType::McpServerSelector),
        ],
        inputs: vec!["value".into()],
        outputs: vec![
            "result".into(),
            "value".into(),
            "sessionId".into(),
            "structuredOutput".into(),
        ],
        deletable: true,
        hidden: false,
    }
}

fn build_registry() -> SchemaRegistry {
    let mut schemas = HashMap::new();

    schemas.insert(
        NodeType::Input,
        NodeTypeSchema {
            node_type: NodeType::Input,
            properties: vec![name_prop()],
            inputs: vec![],
            outputs: vec!["prompt".into(), "value".into()],
            deletable: false,
            hidden: false,
        },
    );

    schemas.insert(
        NodeType::Output,
        NodeTypeSchema {
            node_type: NodeType::Output,
            properties: vec![name_prop()],
            inputs: vec!["value".into()],
            outputs: vec!["value".into()],
            deletable: false,
            hidden: false,
        },
    );

    schemas.insert(
        NodeType::ClaudeAgent,
        agent_schema(NodeType::ClaudeAgent, &["sonnet", "opus", "haiku"]),
    );
    schemas.insert(
        NodeType::CodexAgent,
        agent_schema(
            NodeType::CodexAgent,
            &["gpt-5-codex", "o4-mini", "codex-mini"],
        ),
    );

    schemas.insert(
        NodeType::Condition,
        NodeTypeSchema {
            node_type: NodeType::Condition,
            properties: vec![
                name_prop(),
                PropertySpec::new("combinator", "Combine", PropertyType::Select)
                    .options(&["and", "or"]),
                PropertySpec::new("rules", "Rules", PropertyType::ConditionRules).required(),
            ],
            inputs: vec!["value".into()],
            outputs: vec!["matched".into(), "value".into()],
            deletable: true,
            hidden: false,
        },
    );

    schemas.insert(
        NodeType::Merge,
        NodeTypeSchema {
            node_type: NodeType::Merge,
            properties: vec![
                name_prop(),
                PropertySpec::new("strategy", "Strategy", PropertyType::Select)
                    .options(&["wait-all", "first-complete"]),
            ],
            inputs: vec!["value".into()],
            outputs: vec!["value".into()],
            deletable: true,
            hidden: false,
        },
    );

    schemas.insert(
        NodeType::Javascript,
        NodeTypeSchema {
            node_type: NodeType::Javascript,
            properties: vec![
                name_prop(),
                PropertySpec::new("code", "Code", PropertyType::Code).required(),
                PropertySpec::new("inputMappings", "Inputs", PropertyType::InputSelector),
                timeout_prop(),
            ],
            inputs: vec!["value".into()],
            outputs: vec!["result".into(), "value".into()],
            deletable: true,
            hidden: false,
        },
    );

    schemas.insert(
        NodeType::Bash,
        NodeTypeSchema {
            node_type: NodeType::Bash,
            properties: vec![
                name_prop(),
                PropertySpec::new("code", "Script", PropertyType::Code).required(),
                PropertySpec::new("inputMappings", "Environment", PropertyType::InputSelector),
                timeout_prop(),
            ],
            inputs: vec!["value".into()],
            outputs: vec![
                "stdout".into(),
                "stderr".into(),
                "exitCode".into(),
                "value".into(),
            ],
            deletable: true,
            hidden: false,
        },
    );

    schemas.insert(
        NodeType::Approval,
        NodeTypeSchema {
            node_type: NodeType::Approval,
            properties: vec![
                name_prop(),
                PropertySpec::new("promptMessage", "Prompt", PropertyType::Textarea).required(),
                PropertySpec::new("displayDataReference", "Display data", PropertyType::Reference),
                PropertySpec::new("feedbackPrompt", "Feedback prompt", PropertyType::String),
                timeout_prop(),
                PropertySpec::new("timeoutAction", "On timeout", PropertyType::Select)
                    .options(&["approve", "reject", "fail"])
                    .show_when("timeout", &[]),
            ],
            inputs: vec!["value".into()],
            outputs: vec!["approved".into(), "feedback".into(), "value".into()],
            deletable: true,
            hidden: false,
        },
    );

    schemas.insert(
        NodeType::SelfReflect,
        NodeTypeSchema {
            node_type: NodeType::SelfReflect,
            properties: vec![
                name_prop(),
                PropertySpec::new("agent", "Agent", PropertyType::Select)
                    .options(&["claude", "codex"]),
                PropertySpec::new("model", "Model", PropertyType::Select)
                    .options(&["sonnet", "opus", "haiku", "gpt-5-codex", "o4-mini"]),
                PropertySpec::new("mode", "Mode", PropertyType::Select)
                    .options(&["dry-run", "suggest", "auto-apply"]),
                PropertySpec::new("reflectionGoal", "Goal", PropertyType::Textarea).required(),
                PropertySpec::new("scope", "Scope", PropertyType::Multiselect)
                    .options(&["prompts", "models", "structure", "settings", "config"]),
                PropertySpec::new("maxMutations", "Max mutations", PropertyType::Number),
                PropertySpec::new("includeTranscripts", "Include transcripts", PropertyType::Boolean),
                timeout_prop(),
            ],
            inputs: vec!["value".into()],
            outputs: vec!["evolution".into(), "applied".into(), "value".into()],
            deletable: true,
            hidden: false,
        },
    );

    SchemaRegistry { schemas }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_covers_every_node_type() {
        let reg = registry();
        for nt in NodeType::ALL {
            assert!(reg.schema_for(nt).is_some(), "missing schema for {nt}");
        }
    }

    #[test]
    fn input_output_are_not_deletable() {
        let reg = registry();
        assert!(!reg.schema_for(NodeType::Input).unwrap().deletable);
        assert!(!reg.schema_for(NodeType::Output).unwrap().deletable);
        assert!(reg.schema_for(NodeType::Condition).unwrap().deletable);
    }

    #[test]
    fn resolve_top_level_property() {
        let reg = registry();
        let spec = reg
            .resolve_property(NodeType::ClaudeAgent, &["userQuery"])
            .unwrap();
        assert_eq!(spec.property_type, PropertyType::Textarea);
        assert!(spec.required);
    }

    #[test]
    fn resolve_unknown_property_is_none() {
        let reg = registry();
        assert!(reg
            .resolve_property(NodeType::ClaudeAgent, &["nonexistent"])
            .is_none());
        assert!(reg
            .resolve_property(NodeType::Input, &["userQuery"])
            .is_none());
    }

    #[test]
    fn resolve_through_group_and_array() {
        // Ad-hoc registry with nested shapes; the resolver is generic.
        let group = PropertySpec::new("options", "Options", PropertyType::Group).with_properties(
            vec![PropertySpec::new("depth", "Depth", PropertyType::Number)],
        );
        let array = PropertySpec::new("steps", "Steps", PropertyType::Array)
            .with_item(PropertySpec::new("step", "Step", PropertyType::String));

        let mut schemas = HashMap::new();
        schemas.insert(
            NodeType::Merge,
            NodeTypeSchema {
                node_type: NodeType::Merge,
                properties: vec![group, array],
                inputs: vec![],
                outputs: vec![],
                deletable: true,
                hidden: false,
            },
        );
        let reg = SchemaRegistry { schemas };

        let depth = reg
            .resolve_property(NodeType::Merge, &["options", "depth"])
            .unwrap();
        assert_eq!(depth.property_type, PropertyType::Number);

        let step = reg
            .resolve_property(NodeType::Merge, &["steps", "2"])
            .unwrap();
        assert_eq!(step.property_type, PropertyType::String);

        // Non-numeric array index does not resolve.
        assert!(reg
            .resolve_property(NodeType::Merge, &["steps", "first"])
            .is_none());
    }

    #[test]
    fn select_rejects_unlisted_option() {
        let reg = registry();
        let model = reg
            .resolve_property(NodeType::ClaudeAgent, &["model"])
            .unwrap();
        assert!(model.check_value(&json!("opus")).is_ok());
        let err = model.check_value(&json!("gpt-4")).unwrap_err();
        assert!(err.contains("does not allow"));
        assert!(model.check_value(&json!(42)).is_err());
    }

    #[test]
    fn multiselect_checks_membership() {
        let reg = registry();
        let scope = reg
            .resolve_property(NodeType::SelfReflect, &["scope"])
            .unwrap();
        assert!(scope.check_value(&json!(["models", "prompts"])).is_ok());
        assert!(scope.check_value(&json!(["everything"])).is_err());
        assert!(scope.check_value(&json!("models")).is_err());
    }

    #[test]
    fn selector_shapes() {
        let reg = registry();
        let mappings = reg
            .resolve_property(NodeType::Javascript, &["inputMappings"])
            .unwrap();
        assert!(mappings
            .check_value(&json!([{"variable": "a", "reference": "{{Input.value}}"}]))
            .is_ok());
        assert!(mappings.check_value(&json!([{"variable": "a"}])).is_err());

        let servers = reg
            .resolve_property(NodeType::ClaudeAgent, &["mcpServers"])
            .unwrap();
        assert!(servers.check_value(&json!(["files", "web"])).is_ok());
        assert!(servers.check_value(&json!([1, 2])).is_err());
    }

    #[test]
    fn reserved_segments() {
        assert!(is_reserved_segment("__proto__"));
        assert!(is_reserved_segment("prototype"));
        assert!(is_reserved_segment("constructor"));
        assert!(!is_reserved_segment("model"));
    }
}

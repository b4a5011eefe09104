//! Declarative process definitions.
//!
//! Processes can be described as data (JSON or YAML) and built against a
//! [`CommandRegistry`]:
//!
//! ```json
//! {
//!   "name": "invoice",
//!   "transitions": [
//!     {"action": "approve", "sources": "draft", "target": "approved"},
//!     {"action": "send", "sources": ["approved"], "in_progress": "sending",
//!      "target": "sent", "failed": "failed", "side_effects": ["send_email"]},
//!     {"action": "remind", "sources": "sent", "permissions": ["user.is_staff"]}
//!   ],
//!   "nested": []
//! }
//! ```
//!
//! A transition without `target` is an action. Condition and permission
//! names resolve to registered predicates first, then to guard expressions.

use crate::command::CommandRegistry;
use crate::error::EngineError;
use crate::process::Process;
use crate::transition::Transition;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One process node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,

    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<ProcessDefinition>,
}

/// One transition or action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub action: String,

    /// Source state(s). Can be a single state or multiple.
    #[serde(deserialize_with = "deserialize_sources")]
    pub sources: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub side_effects: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callbacks: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_callbacks: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

fn deserialize_sources<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct SourcesVisitor;

    impl<'de> Visitor<'de> for SourcesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut sources = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                sources.push(s);
            }
            Ok(sources)
        }
    }

    deserializer.deserialize_any(SourcesVisitor)
}

impl ProcessDefinition {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_json(&self) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Resolves every name against `registry` and builds the process tree.
    pub fn build(&self, registry: &CommandRegistry) -> Result<Arc<Process>, EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidDefinition {
                reason: "process name must not be empty".to_string(),
            });
        }

        let mut builder = Process::builder(&self.name);
        for name in &self.conditions {
            builder = builder.condition(registry.condition(name)?);
        }
        for name in &self.permissions {
            builder = builder.permission(registry.permission(name)?);
        }
        for transition in &self.transitions {
            builder = builder.transition(transition.build(registry)?);
        }
        for nested in &self.nested {
            builder = builder.nested(nested.build(registry)?);
        }
        Ok(builder.build())
    }
}

impl TransitionDefinition {
    pub fn build(&self, registry: &CommandRegistry) -> Result<Arc<Transition>, EngineError> {
        let mut builder = Transition::builder(&self.action).sources(self.sources.iter().cloned());

        if let Some(target) = &self.target {
            builder = builder.target(target);
        }
        if let Some(in_progress) = &self.in_progress {
            builder = builder.in_progress(in_progress);
        }
        if let Some(failed) = &self.failed {
            builder = builder.failed(failed);
        }
        if let Some(next) = &self.next {
            builder = builder.next(next);
        }
        for name in &self.conditions {
            builder = builder.condition(registry.condition(name)?);
        }
        for name in &self.permissions {
            builder = builder.permission(registry.permission(name)?);
        }
        for name in &self.side_effects {
            builder = builder.side_effect(registry.command(name)?);
        }
        for name in &self.callbacks {
            builder = builder.callback(registry.command(name)?);
        }
        for name in &self.failure_callbacks {
            builder = builder.failure_callback(registry.command(name)?);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Condition, Context};
    use crate::engine::testing::*;
    use crate::entity::Caller;

    fn registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry
            .register_condition(Condition::new("is_available", |e| e.is("is_available")))
            .register_command(Command::new("send_email", |state, _| {
                state.set_field("emailed", true)?;
                Ok(())
            }))
            .register_command(Command::new("fail_invoice", |_, _| anyhow::bail!("declined")));
        registry
    }

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "name": "invoice",
            "conditions": ["is_available"],
            "transitions": [
                {"action": "approve", "sources": "draft", "target": "approved"},
                {"action": "send", "sources": ["approved"], "in_progress": "sending",
                 "target": "sent", "failed": "failed", "side_effects": ["send_email"]},
                {"action": "remind", "sources": ["sent"], "permissions": ["user.is_staff"]}
            ],
            "nested": [
                {"name": "payments", "transitions": [
                    {"action": "pay", "sources": ["approved", "sent"], "target": "paid",
                     "conditions": ["ctx.amount > 0"]}
                ]}
            ]
        })
    }

    #[test]
    fn test_parse_and_build() {
        let def = ProcessDefinition::from_json(&sample().to_string()).unwrap();
        assert_eq!(def.transitions[0].sources, vec!["draft"]);
        assert_eq!(def.nested[0].transitions[0].sources, vec!["approved", "sent"]);

        let process = def.build(&registry()).unwrap();
        assert_eq!(process.transitions().len(), 3);
        assert!(process.transitions()[2].is_action());
        assert_eq!(process.find("payments").unwrap().transitions().len(), 1);
    }

    #[test]
    fn test_built_process_runs() {
        let fx = fixture();
        fx.entities.insert(invoice("inv-1").with_field("amount", 10));
        let process = ProcessDefinition::from_json(&sample().to_string())
            .unwrap()
            .build(&registry())
            .unwrap();
        let bound = fx.engine.bind(process, "invoice", "inv-1", "status");

        bound.invoke("approve", None, Context::new()).unwrap();
        let staff = Caller::new("u-1").with_attribute("is_staff", true);
        let actions: Vec<_> = bound
            .available_actions(Some(&staff))
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(actions, vec!["pay", "send"]);

        bound.invoke("send", Some(&staff), Context::new()).unwrap();
        let entity = bound.state().entity().unwrap();
        assert_eq!(entity.get_str("status"), Some("sent"));
        assert!(entity.is("emailed"));
    }

    #[test]
    fn test_yaml_definition() {
        let yaml = r#"
name: locker
transitions:
  - action: lock
    sources: open
    target: locked
  - action: unlock
    sources: [locked]
    target: open
"#;
        let process = ProcessDefinition::from_yaml(yaml)
            .unwrap()
            .build(&CommandRegistry::new())
            .unwrap();
        let states: Vec<_> = process.all_states().into_iter().collect();
        assert_eq!(states, vec!["locked", "open"]);
    }

    #[test]
    fn test_unknown_command() {
        let json = r#"{"name": "invoice", "transitions": [
            {"action": "send", "sources": "draft", "target": "sent", "side_effects": ["fax"]}
        ]}"#;
        let result = ProcessDefinition::from_json(json).unwrap().build(&registry());
        assert!(matches!(result, Err(EngineError::UnknownCommand { .. })));
    }

    #[test]
    fn test_condition_cannot_reference_user() {
        let json = r#"{"name": "invoice", "transitions": [
            {"action": "approve", "sources": "draft", "target": "approved",
             "conditions": ["user.is_staff"]}
        ]}"#;
        let result = ProcessDefinition::from_json(json).unwrap().build(&registry());
        assert!(matches!(result, Err(EngineError::InvalidGuard { .. })));
    }

    #[test]
    fn test_invalid_definitions() {
        for json in [
            r#"{"name": "", "transitions": []}"#,
            r#"{"name": "invoice", "transitions": [{"action": "", "sources": "draft"}]}"#,
            r#"{"name": "invoice", "transitions": [{"action": "go", "sources": []}]}"#,
            r#"{"name": "invoice", "transitions": [
                {"action": "notify", "sources": "draft", "in_progress": "notifying"}
            ]}"#,
        ] {
            let result = ProcessDefinition::from_json(json).unwrap().build(&registry());
            assert!(
                matches!(result, Err(EngineError::InvalidDefinition { .. })),
                "{}",
                json
            );
        }
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ProcessDefinition::from_json(r#"{"name": "invoice", "transitions": [{"action": 3}]}"#),
            Err(EngineError::Json(_))
        ));
    }

    #[test]
    fn test_to_json_omits_defaults() {
        let def = ProcessDefinition::from_json(&sample().to_string()).unwrap();
        let json = def.to_json().unwrap();
        assert!(json["transitions"][0].get("side_effects").is_none());
        assert_eq!(json["transitions"][0]["sources"], serde_json::json!(["draft"]));
    }
}

//! Static workflow graphs.
//!
//! A definition is authored once (YAML or JSON) and only read by the engine.
//! Steps are nodes, transitions are directed edges between step ids.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::new_id;
use crate::{Error, Result};

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

fn default_version() -> String {
    "1".to_string()
}

fn default_true() -> bool {
    true
}

/// Kind of node in the workflow graph.
///
/// Names the engine does not know deserialize into `Other` so that the engine,
/// not the parser, decides what happens to them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    Start,
    End,
    Task,
    Decision,
    Notification,
    Integration,
    Subprocess,
    Other(String),
}

impl From<String> for StepType {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "START" => StepType::Start,
            "END" => StepType::End,
            "TASK" => StepType::Task,
            "DECISION" => StepType::Decision,
            "NOTIFICATION" => StepType::Notification,
            "INTEGRATION" => StepType::Integration,
            "SUBPROCESS" => StepType::Subprocess,
            _ => StepType::Other(s),
        }
    }
}

impl From<StepType> for String {
    fn from(t: StepType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Start => write!(f, "START"),
            StepType::End => write!(f, "END"),
            StepType::Task => write!(f, "TASK"),
            StepType::Decision => write!(f, "DECISION"),
            StepType::Notification => write!(f, "NOTIFICATION"),
            StepType::Integration => write!(f, "INTEGRATION"),
            StepType::Subprocess => write!(f, "SUBPROCESS"),
            StepType::Other(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionType {
    Automatic,
    Conditional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Role an agent must hold to take this step (TASK only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_role_required: Option<String>,

    #[serde(default)]
    pub parameters: HashMap<String, Value>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Step to jump to once retries are exhausted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling_step_id: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            step_type,
            agent_role_required: None,
            parameters: HashMap::new(),
            metadata: HashMap::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retry_limit: DEFAULT_RETRY_LIMIT,
            error_handling_step_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_agent_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role_required = Some(role.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_error_handler(mut self, step_id: impl Into<String>) -> Self {
        self.error_handling_step_id = Some(step_id.into());
        self
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTransition {
    #[serde(default = "new_id")]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub from_step_id: String,
    pub to_step_id: String,

    #[serde(rename = "type")]
    pub transition_type: TransitionType,

    /// Expression over the execution context; only consulted when condition
    /// evaluation is switched on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowTransition {
    pub fn new(
        from_step_id: impl Into<String>,
        to_step_id: impl Into<String>,
        transition_type: TransitionType,
    ) -> Self {
        Self {
            id: new_id(),
            name: None,
            from_step_id: from_step_id.into(),
            to_step_id: to_step_id.into(),
            transition_type,
            condition: None,
            priority: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn automatic(from_step_id: impl Into<String>, to_step_id: impl Into<String>) -> Self {
        Self::new(from_step_id, to_step_id, TransitionType::Automatic)
    }

    pub fn conditional(
        from_step_id: impl Into<String>,
        to_step_id: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        let mut transition = Self::new(from_step_id, to_step_id, TransitionType::Conditional);
        transition.condition = Some(condition.into());
        transition
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default = "new_id")]
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub steps: Vec<WorkflowStep>,

    #[serde(default)]
    pub transitions: Vec<WorkflowTransition>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub is_template: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            description: None,
            version: default_version(),
            steps: Vec::new(),
            transitions: Vec::new(),
            metadata: HashMap::new(),
            is_active: true,
            is_template: false,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn add_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn add_transition(mut self, transition: WorkflowTransition) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Parse a definition document. JSON is a subset of YAML, so both work.
    pub fn from_yaml(document: &str) -> Result<Self> {
        let definition: WorkflowDefinition = serde_yaml::from_str(document)?;
        Ok(definition)
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// The unique START step.
    pub fn start_step(&self) -> Result<&WorkflowStep> {
        let mut starts = self.steps.iter().filter(|s| s.step_type == StepType::Start);
        let first = starts.next().ok_or_else(|| {
            Error::InvalidDefinition(format!("Workflow definition {} has no start step", self.id))
        })?;
        if starts.next().is_some() {
            return Err(Error::InvalidDefinition(format!(
                "Workflow definition {} has more than one start step",
                self.id
            )));
        }
        Ok(first)
    }

    /// Outgoing transitions of a step, in definition order.
    pub fn transitions_from(&self, step_id: &str) -> Vec<&WorkflowTransition> {
        self.transitions
            .iter()
            .filter(|t| t.from_step_id == step_id)
            .collect()
    }

    /// Structural checks: at least one step, unique step ids, exactly one
    /// START step, every transition endpoint names a step, and error handlers
    /// name some other step.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "Workflow definition {} has no steps",
                self.id
            )));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(Error::InvalidDefinition(format!(
                    "Duplicate step id: {}",
                    step.id
                )));
            }
        }

        self.start_step()?;

        for transition in &self.transitions {
            for endpoint in [&transition.from_step_id, &transition.to_step_id] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(Error::InvalidDefinition(format!(
                        "Transition {} references unknown step: {}",
                        transition.id, endpoint
                    )));
                }
            }
        }

        for step in &self.steps {
            if let Some(handler) = &step.error_handling_step_id {
                if handler == &step.id {
                    return Err(Error::InvalidDefinition(format!(
                        "Step {} names itself as its error handling step",
                        step.id
                    )));
                }
                if !ids.contains(handler.as_str()) {
                    return Err(Error::InvalidDefinition(format!(
                        "Step {} names unknown error handling step: {}",
                        step.id, handler
                    )));
                }
            }
        }

        Ok(())
    }

    /// Non-END steps reachable from START that have no outgoing transition.
    /// Running into one of these fails the instance.
    pub fn dead_ends(&self) -> Vec<&WorkflowStep> {
        let Ok(start) = self.start_step() else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        let mut dead_ends = Vec::new();
        seen.insert(start.id.as_str());
        queue.push_back(start);

        while let Some(step) = queue.pop_front() {
            let outgoing = self.transitions_from(&step.id);
            if outgoing.is_empty() && step.step_type != StepType::End {
                dead_ends.push(step);
            }
            for transition in outgoing {
                if let Some(next) = self.step(&transition.to_step_id) {
                    if seen.insert(next.id.as_str()) {
                        queue.push_back(next);
                    }
                }
            }
        }

        dead_ends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("linear")
            .add_step(WorkflowStep::new("start", "Start", StepType::Start))
            .add_step(WorkflowStep::new("a", "Review", StepType::Task).with_agent_role("reviewer"))
            .add_step(WorkflowStep::new("end", "End", StepType::End))
            .add_transition(WorkflowTransition::automatic("start", "a"))
            .add_transition(WorkflowTransition::automatic("a", "end"))
    }

    #[test]
    fn test_validate_accepts_linear_graph() {
        let definition = linear();
        assert!(definition.validate().is_ok());
        assert_eq!(definition.start_step().unwrap().id, "start");
        assert!(definition.dead_ends().is_empty());
    }

    #[test]
    fn test_validate_rejects_missing_and_duplicate_start() {
        let no_start = WorkflowDefinition::new("none")
            .add_step(WorkflowStep::new("a", "A", StepType::Task));
        assert!(matches!(no_start.validate(), Err(Error::InvalidDefinition(_))));

        let two_starts = linear().add_step(WorkflowStep::new("start-2", "Start", StepType::Start));
        assert!(matches!(two_starts.start_step(), Err(Error::InvalidDefinition(_))));
    }

    #[test]
    fn test_validate_rejects_step_handling_its_own_errors() {
        let definition = WorkflowDefinition::new("loop")
            .add_step(WorkflowStep::new("start", "Start", StepType::Start))
            .add_step(
                WorkflowStep::new("x", "Widget", StepType::from("WIDGET".to_string()))
                    .with_error_handler("x"),
            )
            .add_step(WorkflowStep::new("end", "End", StepType::End))
            .add_transition(WorkflowTransition::automatic("start", "x"))
            .add_transition(WorkflowTransition::automatic("x", "end"));

        let err = definition.validate().unwrap_err();
        assert!(err.to_string().contains("names itself"));
    }

    #[test]
    fn test_validate_rejects_dangling_transition() {
        let definition = linear().add_transition(WorkflowTransition::automatic("a", "nowhere"));
        let err = definition.validate().unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_dead_ends_only_counts_reachable_steps() {
        let definition = WorkflowDefinition::new("dead-end")
            .add_step(WorkflowStep::new("start", "Start", StepType::Start))
            .add_step(WorkflowStep::new("d", "Decide", StepType::Decision))
            .add_step(WorkflowStep::new("orphan", "Orphan", StepType::Task))
            .add_transition(WorkflowTransition::automatic("start", "d"));

        let dead_ends: Vec<_> = definition.dead_ends().iter().map(|s| s.id.clone()).collect();
        assert_eq!(dead_ends, vec!["d".to_string()]);
    }

    #[test]
    fn test_parse_yaml_with_defaults_and_unknown_type() {
        let document = r#"
id: review
name: Review
steps:
  - id: start
    name: Start
    type: START
  - id: wait
    name: Wait
    type: TIMER
    timeoutSeconds: 60
transitions:
  - fromStepId: start
    toStepId: wait
    type: AUTOMATIC
"#;
        let definition = WorkflowDefinition::from_yaml(document).unwrap();
        assert_eq!(definition.id, "review");
        assert!(definition.is_active);
        assert_eq!(definition.version, "1");

        let wait = definition.step("wait").unwrap();
        assert_eq!(wait.step_type, StepType::Other("TIMER".to_string()));
        assert_eq!(wait.timeout_seconds, 60);
        assert_eq!(wait.retry_limit, DEFAULT_RETRY_LIMIT);
        assert!(!definition.transitions[0].id.is_empty());
    }

    #[test]
    fn test_step_type_round_trips_as_plain_string() {
        let step = WorkflowStep::new("n", "Notify", StepType::Notification)
            .with_parameter("message", json!("hello"));
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "NOTIFICATION");
        assert_eq!(value["timeoutSeconds"], 300);
        assert_eq!(step.parameter_str("message"), Some("hello"));
    }
}

//! Pipeline declaration types.
//!
//! These types are the already-validated, in-memory form of a pipeline
//! declaration: stages, their dependencies and run predicates, matrix axes and
//! the ordered steps each job executes.

use crate::event::Classification;
use schemars::JsonSchema;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    /// Branch whose pushes are release-eligible and run without fail-fast.
    #[serde(default = "default_trunk_branch")]
    pub trunk_branch: String,
    pub stages: Vec<StageDefinition>,
}

fn default_trunk_branch() -> String {
    "main".to_string()
}

impl PipelineDefinition {
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Evaluated once, after every dependency is terminal.
    #[serde(default)]
    pub when: RunPredicate,
    /// Stages sharing a group never run at the same time, across runs.
    #[serde(default)]
    pub concurrency_group: Option<String>,
    /// Matrix template. Without one the stage runs a single job.
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    /// Wrap compiling steps with the cache accelerator.
    #[serde(default)]
    pub accelerate: bool,
    pub steps: Vec<StepDefinition>,
}

impl StageDefinition {
    pub fn is_matrix(&self) -> bool {
        self.matrix.is_some()
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixConfig {
    pub axes: Vec<Axis>,
    /// Upper bound on concurrently running instances.
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

/// A named list of values, e.g. `platform = [macos, windows, ubuntu]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Axis {
    pub name: String,
    pub values: Vec<String>,
}

impl Axis {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Stage-level run predicate over the classified trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunPredicate {
    #[default]
    Always,
    /// A push to the trunk branch that is not a tag.
    TrunkPush,
    PullRequest,
    Tag,
    Never,
}

impl RunPredicate {
    pub fn evaluate(&self, classification: &Classification) -> bool {
        match self {
            RunPredicate::Always => true,
            RunPredicate::TrunkPush => classification.is_trunk_push,
            RunPredicate::PullRequest => classification.is_pull_request,
            RunPredicate::Tag => classification.is_tag,
            RunPredicate::Never => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    pub run: String,
    /// Applicability over the job's axis bindings. Absent means always.
    #[serde(default, rename = "if")]
    pub condition: Option<AxisCondition>,
    /// Failure is tolerated and never fails the job.
    #[serde(default)]
    pub best_effort: bool,
    /// Invokes the compiler, so it is bracketed by the cache accelerator.
    #[serde(default)]
    pub compiles: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            condition: None,
            best_effort: false,
            compiles: false,
            env: BTreeMap::new(),
        }
    }

    pub fn compiling(mut self) -> Self {
        self.compiles = true;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn when(mut self, condition: AxisCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn applies_to(&self, bindings: &AxisBindings) -> bool {
        self.condition
            .as_ref()
            .is_none_or(|condition| condition.applies(bindings))
    }
}

/// Declarative applicability predicate over axis bindings.
///
/// Every constraint that is set must hold. A binding missing the axis fails
/// `equals` and `one_of` and passes `not_equals`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AxisCondition {
    pub axis: String,
    #[serde(default)]
    pub equals: Option<String>,
    #[serde(default)]
    pub not_equals: Option<String>,
    #[serde(default)]
    pub one_of: Vec<String>,
}

impl AxisCondition {
    pub fn equals(axis: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            axis: axis.into(),
            equals: Some(value.into()),
            not_equals: None,
            one_of: vec![],
        }
    }

    pub fn not_equals(axis: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            axis: axis.into(),
            equals: None,
            not_equals: Some(value.into()),
            one_of: vec![],
        }
    }

    pub fn applies(&self, bindings: &AxisBindings) -> bool {
        let value = bindings.get(&self.axis);

        if let Some(expected) = &self.equals
            && value != Some(expected.as_str())
        {
            return false;
        }
        if let Some(rejected) = &self.not_equals
            && value == Some(rejected.as_str())
        {
            return false;
        }
        if !self.one_of.is_empty() {
            return value.is_some_and(|v| self.one_of.iter().any(|o| o == v));
        }
        true
    }
}

/// Axis name to value, kept in axis-declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AxisBindings(Vec<(String, String)>);

impl AxisBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `axis` to `value`, replacing an earlier binding of the same axis.
    pub fn insert(&mut self, axis: impl Into<String>, value: impl Into<String>) {
        let axis = axis.into();
        let value = value.into();
        match self.0.iter_mut().find(|(name, _)| *name == axis) {
            Some(entry) => entry.1 = value,
            None => self.0.push((axis, value)),
        }
    }

    pub fn with(mut self, axis: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(axis, value);
        self
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AxisBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&parts.join(", "))
    }
}

impl Serialize for AxisBindings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (axis, value) in &self.0 {
            map.serialize_entry(axis, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for AxisBindings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BindingsVisitor;

        impl<'de> Visitor<'de> for BindingsVisitor {
            type Value = AxisBindings;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of axis names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut bindings = AxisBindings::new();
                while let Some((axis, value)) = access.next_entry::<String, String>()? {
                    bindings.insert(axis, value);
                }
                Ok(bindings)
            }
        }

        deserializer.deserialize_map(BindingsVisitor)
    }
}

impl JsonSchema for AxisBindings {
    fn schema_name() -> String {
        "AxisBindings".to_string()
    }

    fn json_schema(generator: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        <BTreeMap<String, String>>::json_schema(generator)
    }
}

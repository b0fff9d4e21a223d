//! Matrix expansion for parallel job generation.

use std::collections::HashSet;
use trunkline_core::ConfigError;
use trunkline_core::pipeline::{Axis, AxisBindings, StageDefinition};
use trunkline_core::run::JobInstance;

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a stage into its job instances. Singleton stages yield exactly
    /// one instance with no bindings.
    pub fn expand(&self, stage: &StageDefinition) -> Result<Vec<JobInstance>, ConfigError> {
        let Some(matrix) = &stage.matrix else {
            return Ok(vec![JobInstance::singleton(&stage.name)]);
        };

        let jobs = self
            .combinations(&stage.name, &matrix.axes)?
            .into_iter()
            .enumerate()
            .map(|(idx, bindings)| JobInstance::new(&stage.name, idx, bindings))
            .collect();
        Ok(jobs)
    }

    /// Cartesian product of `axes`. The first declared axis varies slowest and
    /// values keep their declared order, so reports are stable across runs.
    pub fn combinations(
        &self,
        stage: &str,
        axes: &[Axis],
    ) -> Result<Vec<AxisBindings>, ConfigError> {
        self.validate(stage, axes)?;

        let mut result = vec![AxisBindings::new()];
        for axis in axes {
            let mut next = Vec::with_capacity(result.len() * axis.values.len());
            for combo in &result {
                for value in &axis.values {
                    next.push(combo.clone().with(&axis.name, value));
                }
            }
            result = next;
        }

        Ok(result)
    }

    fn validate(&self, stage: &str, axes: &[Axis]) -> Result<(), ConfigError> {
        if axes.is_empty() {
            return Err(ConfigError::EmptyMatrix(stage.to_string()));
        }

        let mut names = HashSet::new();
        for axis in axes {
            if !names.insert(axis.name.as_str()) {
                return Err(ConfigError::DuplicateAxis {
                    stage: stage.to_string(),
                    axis: axis.name.clone(),
                });
            }
            if axis.values.is_empty() {
                return Err(ConfigError::EmptyAxis {
                    stage: stage.to_string(),
                    axis: axis.name.clone(),
                });
            }
            let mut seen = HashSet::new();
            for value in &axis.values {
                if !seen.insert(value.as_str()) {
                    return Err(ConfigError::DuplicateAxisValue {
                        stage: stage.to_string(),
                        axis: axis.name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trunkline_core::pipeline::{MatrixConfig, StepDefinition};

    fn matrix_stage(axes: Vec<Axis>) -> StageDefinition {
        StageDefinition {
            name: "test".to_string(),
            display_name: None,
            depends_on: vec![],
            when: Default::default(),
            concurrency_group: None,
            matrix: Some(MatrixConfig {
                axes,
                max_parallel: None,
            }),
            accelerate: false,
            steps: vec![StepDefinition::new("run", "cargo test")],
        }
    }

    #[test]
    fn test_single_axis_expansion() {
        let stage = matrix_stage(vec![Axis::new("platform", ["macos", "windows", "ubuntu"])]);
        let jobs = MatrixExpander::new().expand(&stage).unwrap();

        let platforms: Vec<&str> = jobs
            .iter()
            .map(|j| j.bindings.get("platform").unwrap())
            .collect();
        assert_eq!(platforms, vec!["macos", "windows", "ubuntu"]);
        assert!(jobs.iter().enumerate().all(|(i, j)| j.index == i));
    }

    #[test]
    fn test_multi_axis_order_and_count() {
        let stage = matrix_stage(vec![
            Axis::new("os", ["linux", "macos"]),
            Axis::new("toolchain", ["stable", "beta", "nightly"]),
        ]);
        let jobs = MatrixExpander::new().expand(&stage).unwrap();
        assert_eq!(jobs.len(), 6);

        let names: Vec<String> = jobs.iter().map(|j| j.bindings.to_string()).collect();
        assert_eq!(names[0], "os=linux, toolchain=stable");
        assert_eq!(names[2], "os=linux, toolchain=nightly");
        assert_eq!(names[3], "os=macos, toolchain=stable");

        let unique: HashSet<_> = jobs.iter().map(|j| j.bindings.clone()).collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn test_singleton_stage() {
        let mut stage = matrix_stage(vec![]);
        stage.matrix = None;
        let jobs = MatrixExpander::new().expand(&stage).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].bindings.is_empty());
    }

    #[test]
    fn test_empty_matrix_is_config_error() {
        let err = MatrixExpander::new()
            .expand(&matrix_stage(vec![]))
            .unwrap_err();
        assert_eq!(err, ConfigError::EmptyMatrix("test".to_string()));
    }

    #[test]
    fn test_empty_axis_is_config_error() {
        let err = MatrixExpander::new()
            .expand(&matrix_stage(vec![Axis::new("platform", Vec::<String>::new())]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyAxis { .. }));
    }

    #[test]
    fn test_duplicate_value_is_config_error() {
        let err = MatrixExpander::new()
            .expand(&matrix_stage(vec![Axis::new("platform", ["ubuntu", "ubuntu"])]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAxisValue { .. }));
    }

    #[test]
    fn test_duplicate_axis_is_config_error() {
        let err = MatrixExpander::new()
            .expand(&matrix_stage(vec![
                Axis::new("platform", ["ubuntu"]),
                Axis::new("platform", ["macos"]),
            ]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAxis { .. }));
    }
}

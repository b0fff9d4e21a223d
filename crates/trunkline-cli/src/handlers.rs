//! Command handlers.

use crate::commands::{SchemaTarget, TriggerArgs};
use crate::config::{CliConfig, OutputFormat};
use anyhow::Context;
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trunkline_core::event::{TriggerEvent, TriggerKind};
use trunkline_core::pipeline::PipelineDefinition;
use trunkline_core::run::{
    JobStatus, PipelineOutcome, PipelineStatus, SkipReason, StageStatus, StepStatus,
};
use trunkline_runner::{JobRunner, RunnerConfig, Sccache, ShellExecutor};
use trunkline_scheduler::{Orchestrator, RunPlan};

/// Read and parse a pipeline declaration.
pub fn load_pipeline(path: impl AsRef<Path>) -> anyhow::Result<PipelineDefinition> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing pipeline {}", path.display()))
}

impl TriggerArgs {
    pub fn event(&self) -> TriggerEvent {
        let kind = TriggerKind::from(self.event.clone());
        let mut event = TriggerEvent::new(kind, &self.git_ref);
        event.is_tag |= self.tag;
        event
    }
}

/// Validate a pipeline declaration.
pub fn validate(path: &str) -> anyhow::Result<()> {
    let definition = load_pipeline(path)?;
    let plan = trunkline_scheduler::plan(
        &definition,
        &TriggerEvent::push(definition.trunk_branch.clone()),
    )?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Stages: {}", plan.stages.len());

    for stage in &plan.stages {
        println!(
            "    - {} ({} steps, {} jobs)",
            stage_label(&definition, &stage.name),
            definition
                .stage(&stage.name)
                .map(|s| s.steps.len())
                .unwrap_or(0),
            stage.jobs.len()
        );
    }

    Ok(())
}

/// A stage's display name, falling back to its name.
fn stage_label<'a>(definition: &'a PipelineDefinition, name: &'a str) -> &'a str {
    definition
        .stage(name)
        .map(|s| s.display_name())
        .unwrap_or(name)
}

/// Show what a run would do.
pub fn plan(
    config: &CliConfig,
    path: &str,
    trigger: &TriggerArgs,
    format: Option<OutputFormat>,
) -> anyhow::Result<()> {
    let definition = load_pipeline(path)?;
    let plan = trunkline_scheduler::plan(&definition, &trigger.event())?;

    match format.unwrap_or(config.output_format) {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Table => print_plan(&definition, &plan),
    }
    Ok(())
}

fn print_plan(definition: &PipelineDefinition, plan: &RunPlan) {
    let c = &plan.classification;
    println!("{} {}", style("Pipeline").bold(), plan.pipeline);
    println!(
        "  pull_request={} trunk_push={} tag={} fail_fast={}",
        c.is_pull_request, c.is_trunk_push, c.is_tag, plan.fail_fast
    );

    for stage in &plan.stages {
        let marker = if stage.predicate_holds {
            style("▶").cyan()
        } else {
            style("-").dim()
        };
        let mut line = format!(
            "{} {}",
            marker,
            style(stage_label(definition, &stage.name)).bold()
        );
        if !stage.depends_on.is_empty() {
            line.push_str(&format!(" after {}", stage.depends_on.join(", ")));
        }
        if let Some(group) = &stage.concurrency_group {
            line.push_str(&format!(" [group {}]", group));
        }
        println!("{}", line);

        for bindings in stage.jobs.iter().filter(|b| !b.is_empty()) {
            println!("    {}", bindings);
        }
    }
}

/// Flags that override the stored config for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub format: Option<OutputFormat>,
    pub max_parallel: Option<usize>,
    pub no_cache: bool,
}

/// Run a pipeline on this host and print its outcome.
pub async fn run_pipeline(
    config: &CliConfig,
    path: &str,
    trigger: &TriggerArgs,
    overrides: RunOverrides,
) -> anyhow::Result<PipelineStatus> {
    let definition = load_pipeline(path)?;
    let event = trigger.event();

    let workspace = match &config.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let orchestrator = build_orchestrator(config, workspace, &overrides);

    println!(
        "{} Running {} for {} {}",
        style("▶").cyan(),
        style(&definition.name).bold(),
        event.trigger_kind,
        style(&event.git_ref).dim()
    );

    let outcome = orchestrator.run(&definition, event).await?;

    match overrides.format.unwrap_or(config.output_format) {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Table => print_outcome(&definition, &outcome),
    }

    Ok(outcome.status)
}

fn build_orchestrator(
    config: &CliConfig,
    workspace: PathBuf,
    overrides: &RunOverrides,
) -> Orchestrator {
    let mut settings = config.orchestrator();
    if overrides.max_parallel.is_some() {
        settings.max_parallel = overrides.max_parallel;
    }

    let executor = Arc::new(ShellExecutor::new(RunnerConfig::default()));
    let runner = JobRunner::new(executor, workspace);
    let gate = Arc::new(settings.gate());

    let mut orchestrator = Orchestrator::new(runner, gate);
    if !overrides.no_cache {
        orchestrator = orchestrator.with_accelerator(Arc::new(Sccache::new(&config.sccache_path)));
    }
    orchestrator.with_config(settings)
}

fn print_outcome(definition: &PipelineDefinition, outcome: &PipelineOutcome) {
    for stage in &outcome.stages {
        let label = match stage.status {
            StageStatus::Succeeded => style("✓").green(),
            StageStatus::Failed => style("✗").red(),
            _ => style("-").dim(),
        };
        print!(
            "{} {}",
            label,
            style(stage_label(definition, &stage.name)).bold()
        );
        match &stage.skip_reason {
            Some(SkipReason::DependencyFailed(dep)) => print!(" skipped ({} failed)", dep),
            Some(SkipReason::DependencySkipped(dep)) => print!(" skipped ({} skipped)", dep),
            Some(SkipReason::PredicateFalse) => print!(" skipped (not triggered)"),
            None => print!(" {}", stage.status),
        }
        if let Some(stats) = &stage.cache_stats {
            print!(
                "  cache {}/{} hits ({:.0}%)",
                stats.cache_hits,
                stats.compile_requests,
                stats.hit_rate() * 100.0
            );
        }
        println!();
        for step in stage.cache.iter().filter(|s| s.status == StepStatus::Tolerated) {
            println!("    {} {} ({})", style("!").yellow(), step.name, step.status);
        }

        for job in &stage.jobs {
            let status = match job.status {
                JobStatus::Succeeded => style(job.status.as_str()).green(),
                JobStatus::Failed => style(job.status.as_str()).red(),
                _ => style(job.status.as_str()).yellow(),
            };
            let name = if job.bindings.is_empty() {
                job.stage.clone()
            } else {
                job.bindings.to_string()
            };
            println!("    {:<32} {}", name, status);

            for step in job
                .steps
                .iter()
                .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Tolerated))
            {
                println!(
                    "      {} {} ({})",
                    style("!").yellow(),
                    step.name,
                    step.exit_code
                        .map(|code| format!("exit {}", code))
                        .unwrap_or_else(|| step.status.to_string())
                );
            }
        }
    }

    let summary = match outcome.status {
        PipelineStatus::Succeeded => style("✓ Pipeline succeeded").green(),
        PipelineStatus::Failed => style("✗ Pipeline failed").red(),
    };
    println!("{} in {}ms", summary, outcome.duration_ms);
}

/// Print a JSON schema.
pub fn schema(target: SchemaTarget) -> anyhow::Result<()> {
    let schema = match target {
        SchemaTarget::Pipeline => schemars::schema_for!(PipelineDefinition),
        SchemaTarget::Outcome => schemars::schema_for!(PipelineOutcome),
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> anyhow::Result<()> {
    println!("Configuration:");
    println!("  Path: {}", CliConfig::config_path()?.display());
    println!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Set configuration value.
pub fn set_config(key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PIPELINE: &str = r#"
name: ci
stages:
  - name: test
    matrix:
      axes:
        - name: platform
          values: [macos, ubuntu]
    steps:
      - name: test
        run: cargo test
  - name: release
    depends_on: [test]
    when: trunk_push
    concurrency_group: release
    steps:
      - name: publish
        run: cargo publish
"#;

    fn pipeline_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn trigger(event: &str, git_ref: &str) -> TriggerArgs {
        TriggerArgs {
            event: event.to_string(),
            git_ref: git_ref.to_string(),
            tag: false,
        }
    }

    #[test]
    fn test_load_pipeline() {
        let file = pipeline_file(PIPELINE);
        let definition = load_pipeline(file.path()).unwrap();
        assert_eq!(definition.name, "ci");
        assert_eq!(definition.trunk_branch, "main");
        assert_eq!(definition.stages.len(), 2);
    }

    #[test]
    fn test_demo_pipeline_plans() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../demos/ci.yaml");
        let definition = load_pipeline(path).unwrap();

        let plan =
            trunkline_scheduler::plan(&definition, &trigger("pull_request", "feature-x").event())
                .unwrap();
        assert!(plan.fail_fast);
        assert_eq!(plan.stages[0].jobs.len(), 3);
        assert!(!plan.stages[1].predicate_holds);

        let plan = trunkline_scheduler::plan(&definition, &trigger("push", "main").event()).unwrap();
        assert!(!plan.fail_fast);
        assert!(plan.stages[1].predicate_holds);
    }

    #[test]
    fn test_stage_label_prefers_display_name() {
        let file = pipeline_file(&PIPELINE.replace(
            "  - name: release\n",
            "  - name: release\n    display_name: Publish crates\n",
        ));
        let definition = load_pipeline(file.path()).unwrap();
        assert_eq!(stage_label(&definition, "release"), "Publish crates");
        assert_eq!(stage_label(&definition, "test"), "test");
        assert_eq!(stage_label(&definition, "unknown"), "unknown");
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let file = pipeline_file(&PIPELINE.replace("depends_on: [test]", "depends_on: [lint]"));
        let err = validate(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("lint"));
    }

    #[test]
    fn test_trigger_args_build_event() {
        let event = trigger("pr", "feature-x").event();
        assert_eq!(event.trigger_kind, TriggerKind::PullRequest);

        let mut args = trigger("push", "v1.0.0");
        args.tag = true;
        assert!(args.event().is_tag);
        assert!(trigger("push", "refs/tags/v1.0.0").event().is_tag);
    }

    #[tokio::test]
    async fn test_run_pipeline_without_cache() {
        let file = pipeline_file(
            r#"
name: smoke
stages:
  - name: hello
    steps:
      - name: greet
        run: exit 0
"#,
        );
        let workspace = tempfile::tempdir().unwrap();
        let config = CliConfig {
            workspace: Some(workspace.path().to_path_buf()),
            ..Default::default()
        };
        let overrides = RunOverrides {
            format: Some(OutputFormat::Json),
            no_cache: true,
            ..Default::default()
        };

        let status = run_pipeline(
            &config,
            file.path().to_str().unwrap(),
            &trigger("push", "refs/heads/main"),
            overrides,
        )
        .await
        .unwrap();
        assert_eq!(status, PipelineStatus::Succeeded);
    }
}

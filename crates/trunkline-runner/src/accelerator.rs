//! Compiler-cache acceleration.
//!
//! [`Sccache`] drives an sccache server through its CLI. [`CacheSession`] is
//! the scoped acquisition held around a whole stage: every job of the stage
//! compiles against one server, which is started once before the jobs fan out
//! and closed (stats, then a best-effort stop) after all of them finish.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};
use trunkline_core::cache::{CacheStats, ServerState};
use trunkline_core::ports::CacheAccelerator;
use trunkline_core::run::{StepReport, StepStatus};
use trunkline_core::{Error, Result};

/// sccache driven through its command-line interface.
#[derive(Debug, Clone)]
pub struct Sccache {
    binary: PathBuf,
}

impl Sccache {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn invoke(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::AcceleratorUnreachable(format!("{}: {}", self.binary.display(), e))
            })
    }
}

impl Default for Sccache {
    fn default() -> Self {
        Self::new("sccache")
    }
}

#[async_trait]
impl CacheAccelerator for Sccache {
    fn name(&self) -> &str {
        "sccache"
    }

    async fn start(&self) -> Result<()> {
        let output = self.invoke(&["--start-server"]).await?;
        if !output.status.success() {
            return Err(Error::AcceleratorUnreachable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn report_stats(&self) -> Result<CacheStats> {
        let output = self
            .invoke(&["--show-stats", "--stats-format", "json"])
            .await?;
        if !output.status.success() {
            return Err(Error::AcceleratorUnreachable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_stats(&String::from_utf8_lossy(&output.stdout))
    }

    async fn stop(&self) -> Result<()> {
        let output = self.invoke(&["--stop-server"]).await?;
        if !output.status.success() {
            return Err(Error::AcceleratorUnreachable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            "RUSTC_WRAPPER".to_string(),
            self.binary.display().to_string(),
        )])
    }
}

/// Parse `sccache --show-stats --stats-format json`.
///
/// Per-language counters (`{"counts": {"Rust": 3}}`) are summed. Missing
/// fields count as zero.
pub fn parse_stats(json: &str) -> Result<CacheStats> {
    let root: serde_json::Value = serde_json::from_str(json)?;
    let stats = root.get("stats").unwrap_or(&root);

    let scalar = |key: &str| stats.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    let counted = |key: &str| match stats.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(value) => value
            .get("counts")
            .and_then(|c| c.as_object())
            .map(|counts| counts.values().filter_map(|v| v.as_u64()).sum())
            .unwrap_or(0),
        None => 0,
    };

    Ok(CacheStats {
        compile_requests: scalar("compile_requests"),
        cache_hits: counted("cache_hits"),
        cache_misses: counted("cache_misses"),
        cache_errors: counted("cache_errors"),
        non_cacheable: scalar("non_cacheable_compilations"),
    })
}

/// A started (or attempted) accelerator session for one stage.
pub struct CacheSession<'a> {
    accelerator: &'a dyn CacheAccelerator,
    state: ServerState,
}

impl<'a> CacheSession<'a> {
    /// Start the server. An unreachable server degrades the stage to uncached
    /// compilation; it never fails it.
    pub async fn start(accelerator: &'a dyn CacheAccelerator) -> (Self, StepReport) {
        let started = Instant::now();
        let (state, status) = match accelerator.start().await {
            Ok(()) => {
                info!(accelerator = accelerator.name(), "Cache accelerator started");
                (ServerState::Running, StepStatus::Succeeded)
            }
            Err(e) => {
                warn!(
                    accelerator = accelerator.name(),
                    error = %e,
                    "Cache accelerator unreachable, compiling without cache"
                );
                (ServerState::Stopped, StepStatus::Tolerated)
            }
        };

        let report = StepReport {
            name: format!("{}: start", accelerator.name()),
            status,
            exit_code: None,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        (Self { accelerator, state }, report)
    }

    /// Environment for steps run inside the session; empty when degraded.
    pub fn env(&self) -> BTreeMap<String, String> {
        match self.state {
            ServerState::Running => self.accelerator.env(),
            ServerState::Stopped => BTreeMap::new(),
        }
    }

    /// Report stats (only if the server started) and stop the server. Stop
    /// failures are logged and tolerated.
    pub async fn close(self) -> (Vec<StepReport>, Option<CacheStats>) {
        let name = self.accelerator.name();
        let mut reports = Vec::new();
        let mut stats = None;

        if self.state == ServerState::Running {
            let started = Instant::now();
            let status = match self.accelerator.report_stats().await {
                Ok(snapshot) => {
                    info!(
                        accelerator = name,
                        compile_requests = snapshot.compile_requests,
                        hits = snapshot.cache_hits,
                        misses = snapshot.cache_misses,
                        hit_rate = snapshot.hit_rate(),
                        "Cache statistics"
                    );
                    stats = Some(snapshot);
                    StepStatus::Succeeded
                }
                Err(e) => {
                    warn!(accelerator = name, error = %e, "Failed to read cache statistics");
                    StepStatus::Tolerated
                }
            };
            reports.push(StepReport {
                name: format!("{}: stats", name),
                status,
                exit_code: None,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let started = Instant::now();
        let status = match self.accelerator.stop().await {
            Ok(()) => {
                debug!(accelerator = name, "Cache accelerator stopped");
                StepStatus::Succeeded
            }
            Err(e) => {
                debug!(accelerator = name, error = %e, "Ignoring cache accelerator stop failure");
                StepStatus::Tolerated
            }
        };
        reports.push(StepReport {
            name: format!("{}: stop", name),
            status,
            exit_code: None,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        (reports, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeAccelerator {
        fail_stop: bool,
    }

    #[async_trait]
    impl CacheAccelerator for FakeAccelerator {
        fn name(&self) -> &str {
            "fake-cache"
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn report_stats(&self) -> Result<CacheStats> {
            Ok(CacheStats {
                compile_requests: 5,
                cache_hits: 4,
                cache_misses: 1,
                ..Default::default()
            })
        }

        async fn stop(&self) -> Result<()> {
            if self.fail_stop {
                return Err(Error::AcceleratorUnreachable("server not running".into()));
            }
            Ok(())
        }

        fn env(&self) -> BTreeMap<String, String> {
            BTreeMap::from([("RUSTC_WRAPPER".to_string(), "fake-cache".to_string())])
        }
    }

    #[tokio::test]
    async fn test_running_session_reports_stats_then_stops() {
        let accelerator = FakeAccelerator::default();
        let (session, start) = CacheSession::start(&accelerator).await;
        assert_eq!(start.name, "fake-cache: start");
        assert_eq!(start.status, StepStatus::Succeeded);
        assert!(session.env().contains_key("RUSTC_WRAPPER"));

        let (reports, stats) = session.close().await;
        let names: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["fake-cache: stats", "fake-cache: stop"]);
        assert_eq!(stats.unwrap().cache_hits, 4);
    }

    #[tokio::test]
    async fn test_stop_failure_is_tolerated() {
        let accelerator = FakeAccelerator { fail_stop: true };
        let (session, _) = CacheSession::start(&accelerator).await;

        let (reports, stats) = session.close().await;
        assert!(stats.is_some());
        assert_eq!(reports[1].status, StepStatus::Tolerated);
    }

    #[test]
    fn test_parse_sccache_json() {
        let json = r#"{
            "stats": {
                "compile_requests": 42,
                "requests_executed": 40,
                "cache_errors": {"counts": {}, "adv_counts": {}},
                "cache_hits": {"counts": {"Rust": 30, "C/C++": 2}, "adv_counts": {}},
                "cache_misses": {"counts": {"Rust": 8}, "adv_counts": {}},
                "non_cacheable_compilations": 2
            },
            "cache_location": "Local disk"
        }"#;
        let stats = parse_stats(json).unwrap();
        assert_eq!(stats.compile_requests, 42);
        assert_eq!(stats.cache_hits, 32);
        assert_eq!(stats.cache_misses, 8);
        assert_eq!(stats.cache_errors, 0);
        assert_eq!(stats.non_cacheable, 2);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_stats("not json").is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unreachable() {
        let sccache = Sccache::new("/nonexistent/sccache");
        let err = sccache.start().await.unwrap_err();
        assert!(matches!(err, Error::AcceleratorUnreachable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_session_still_stops() {
        let sccache = Sccache::new("/nonexistent/sccache");
        let (session, start) = CacheSession::start(&sccache).await;
        assert_eq!(start.status, StepStatus::Tolerated);
        assert!(session.env().is_empty());

        let (reports, stats) = session.close().await;
        assert!(stats.is_none());
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "sccache: stop");
        assert_eq!(reports[0].status, StepStatus::Tolerated);
    }
}

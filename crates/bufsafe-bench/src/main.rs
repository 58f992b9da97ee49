//! Bufsafe Bench - command-line driver for the verification harness
//!
//! ```text
//! bufsafe-bench [stress|timing|pipeline|all] [--config PATH]
//! ```
//!
//! Without `--config` the default config file is used if present. The
//! combined report is printed as YAML; the process exits non-zero when any
//! harness reports a violation. Set RUST_LOG=debug for verbose output.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use bufsafe_core::config::{default_config_path, load_config, try_load_config, BufsafeConfig};
use bufsafe_core::harness::{
    run_pipeline, run_stress, run_timing, PipelineReport, StressReport, TimingReport,
};
use bufsafe_core::monitor::BufferHealthMonitor;
use bufsafe_core::pool::{BlockPool, PoolMetricsSnapshot};

const USAGE: &str = "usage: bufsafe-bench [stress|timing|pipeline|all] [--config PATH]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Stress,
    Timing,
    Pipeline,
    All,
}

impl Mode {
    fn parse(arg: &str) -> Option<Self> {
        match arg {
            "stress" => Some(Self::Stress),
            "timing" => Some(Self::Timing),
            "pipeline" => Some(Self::Pipeline),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn runs(self, other: Mode) -> bool {
        self == Mode::All || self == other
    }
}

struct Args {
    mode: Mode,
    config_path: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut mode = Mode::All;
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => match Mode::parse(other) {
                Some(m) => mode = m,
                None => bail!("Unknown argument '{}'\n{}", other, USAGE),
            },
        }
    }
    Ok(Args { mode, config_path })
}

#[derive(Debug, Default, Serialize)]
struct BenchReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    stress: Option<StressReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timing: Option<TimingReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pipeline: Option<PipelineReport>,
    pool: PoolMetricsSnapshot,
}

impl BenchReport {
    fn violations(&self) -> Vec<String> {
        let mut all = Vec::new();
        if let Some(r) = &self.stress {
            all.extend(r.violations().into_iter().map(|v| format!("stress: {}", v)));
        }
        if let Some(r) = &self.timing {
            all.extend(r.violations().into_iter().map(|v| format!("timing: {}", v)));
        }
        if let Some(r) = &self.pipeline {
            all.extend(r.violations().into_iter().map(|v| format!("pipeline: {}", v)));
        }
        all
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    let config: BufsafeConfig = match &args.config_path {
        Some(path) => try_load_config(path)?,
        None => load_config(&default_config_path()),
    };
    config.validate()?;

    log::info!("bufsafe-bench starting ({:?})", args.mode);

    let pool = BlockPool::with_config(config.pool.clone()).context("Failed to initialize pool")?;
    let mut report = BenchReport::default();

    if args.mode.runs(Mode::Stress) {
        report.stress = Some(run_stress(&pool, &config.harness));
    }
    if args.mode.runs(Mode::Timing) {
        report.timing = Some(run_timing(&pool, &config.harness)?);
    }
    if args.mode.runs(Mode::Pipeline) {
        let monitor = BufferHealthMonitor::new(config.monitor.clone())
            .context("Failed to create buffer health monitor")?;
        report.pipeline = Some(run_pipeline(&pool, &monitor, &config.harness)?);
    }
    report.pool = pool.metrics();

    let yaml = serde_yaml::to_string(&report).context("Failed to serialize report")?;
    println!("{}", yaml);

    let violations = report.violations();
    if !violations.is_empty() {
        for v in &violations {
            log::error!("{}", v);
        }
        bail!("{} harness violation(s)", violations.len());
    }

    log::info!("All harness checks passed");
    Ok(())
}

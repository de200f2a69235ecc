//! Output parsers turning collected job output into a run verdict.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::script::EXIT_STATUS_MARKER;
use crate::error::{AkrunError, Result};

const METRIC_MARKER: &str = "akrun:metric:";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParsedRun {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

pub trait OutputParser: Send + Sync {
    /// Fails with `Unparsable` when the output carries no verdict.
    fn parse(&self, stdout: &Path, log: &Path) -> Result<ParsedRun>;
}

/// Reads the exit status trailer and any `akrun:metric:<name>=<value>` lines.
pub struct ExitStatusParser;

impl OutputParser for ExitStatusParser {
    fn parse(&self, stdout: &Path, _log: &Path) -> Result<ParsedRun> {
        let text = fs::read_to_string(stdout)
            .map_err(|e| AkrunError::Unparsable(format!("{}: {e}", stdout.display())))?;

        let mut exit_status = None;
        let mut metrics = Map::new();
        for line in text.lines().map(str::trim) {
            if let Some(raw) = line.strip_prefix(EXIT_STATUS_MARKER) {
                exit_status = raw.trim().parse::<i32>().ok();
            } else if let Some((name, raw)) = line
                .strip_prefix(METRIC_MARKER)
                .and_then(|rest| rest.split_once('='))
            {
                let value = raw
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map_or_else(|| Value::String(raw.trim().to_string()), Value::Number);
                metrics.insert(name.trim().to_string(), value);
            }
        }

        let status = exit_status.ok_or_else(|| {
            AkrunError::Unparsable(format!("no exit status in {}", stdout.display()))
        })?;
        Ok(ParsedRun {
            success: status == 0,
            message: format!("run finished with exit status {status}"),
            exit_status: Some(status),
            metrics,
        })
    }
}

/// Parsers selected by an application's `parser` name.
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn OutputParser>>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        let mut registry = Self {
            parsers: HashMap::new(),
        };
        registry.register("exit_status", Arc::new(ExitStatusParser));
        registry
    }
}

impl ParserRegistry {
    pub fn register(&mut self, name: &str, parser: Arc<dyn OutputParser>) {
        self.parsers.insert(name.to_string(), parser);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn OutputParser>> {
        self.parsers
            .get(name)
            .cloned()
            .ok_or_else(|| AkrunError::Config(format!("unknown output parser '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_exit_status_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = dir.path().join("stdout");
        fs::write(
            &stdout,
            "HPL output\nakrun:metric:gflops=812.5\nakrun:metric:variant=avx2\nakrun:exit_status=0\n",
        )
        .unwrap();
        let run = ExitStatusParser.parse(&stdout, &dir.path().join("log")).unwrap();
        assert!(run.success);
        assert_eq!(run.exit_status, Some(0));
        assert_eq!(run.metrics["gflops"], 812.5);
        assert_eq!(run.metrics["variant"], "avx2");
    }

    #[test]
    fn nonzero_exit_is_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = dir.path().join("stdout");
        fs::write(&stdout, "segfault\nakrun:exit_status=139\n").unwrap();
        let run = ExitStatusParser.parse(&stdout, &stdout).unwrap();
        assert!(!run.success);
        assert!(run.message.contains("139"));
    }

    #[test]
    fn missing_trailer_is_unparsable() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = dir.path().join("stdout");
        fs::write(&stdout, "killed by the scheduler\n").unwrap();
        assert!(matches!(
            ExitStatusParser.parse(&stdout, &stdout),
            Err(AkrunError::Unparsable(_))
        ));
    }

    #[test]
    fn registry_knows_builtin_parser() {
        let registry = ParserRegistry::default();
        assert!(registry.get("exit_status").is_ok());
        assert!(matches!(registry.get("xdmod"), Err(AkrunError::Config(_))));
    }
}

//! Batch job script rendering.

use serde_json::{Map, Value};

use crate::config::{AppConfig, ResourceConfig};
use crate::error::{AkrunError, Result};
use crate::remote::shell_quote;

/// Trailer line every generated job prints with the run's exit status.
pub const EXIT_STATUS_MARKER: &str = "akrun:exit_status=";

/// Expand `{name}` placeholders from `params`. `{{` and `}}` produce literal braces.
pub fn render_template(template: &str, params: &Map<String, Value>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(AkrunError::Template(format!(
                                "unterminated placeholder '{{{name}'"
                            )));
                        }
                    }
                }
                let name = name.trim();
                let value = params
                    .get(name)
                    .ok_or_else(|| AkrunError::Template(format!("unknown parameter '{name}'")))?;
                out.push_str(&value_text(value));
            }
            '}' => return Err(AkrunError::Template("unmatched '}'".to_string())),
            other => out.push(other),
        }
    }
    Ok(out)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Later maps override earlier ones.
pub fn merge_params<'a>(layers: impl IntoIterator<Item = &'a Map<String, Value>>) -> Map<String, Value> {
    let mut merged = Map::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Everything needed to write one job script.
pub struct JobScript<'a> {
    pub resource: &'a ResourceConfig,
    pub app: &'a AppConfig,
    /// Output subdirectories of the remote work dir; empty for a single kernel.
    pub members: &'a [(String, String)],
    pub params: &'a Map<String, Value>,
    pub remote_dir: &'a str,
}

impl JobScript<'_> {
    pub fn render(&self) -> Result<String> {
        let mut script = String::from("#!/bin/bash\n");
        let header = render_template(&self.resource.batch_job_header_template, self.params)?;
        if !header.trim().is_empty() {
            script.push_str(header.trim_end());
            script.push('\n');
        }
        script.push('\n');

        if self.members.is_empty() {
            let body = render_template(&self.app.run_script, self.params)?;
            script.push_str(&run_block(self.remote_dir, &body));
        } else {
            for (member, run_script) in self.members {
                let dir = format!("{}/{member}", self.remote_dir);
                let body = render_template(run_script, self.params)?;
                script.push_str(&format!("# {member}\n"));
                script.push_str(&run_block(&dir, &body));
            }
        }
        Ok(script)
    }
}

fn run_block(dir: &str, body: &str) -> String {
    let quoted = shell_quote(dir);
    let stdout = shell_quote(&format!("{dir}/stdout"));
    let stderr = shell_quote(&format!("{dir}/stderr"));
    format!(
        "cd {quoted}\n{{\n{}\n}} > {stdout} 2> {stderr}\necho \"{EXIT_STATUS_MARKER}$?\" >> {stdout}\n\n",
        body.trim_end()
    )
}

/// `HH:MM:00` rendering of a walltime given in minutes.
pub fn walltime(minutes: u32) -> String {
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

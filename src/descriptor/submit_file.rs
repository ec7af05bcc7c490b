//! Parser for HTCondor-style submit description files.
//!
//! ```text
//! universe              = docker
//! docker_image          = pytorch/pytorch:latest
//! executable            = train.sh
//! arguments             = --slice $(Process)
//! transfer_input_files  = inputs/slice_$(Process).tar.gz
//! transfer_output_files = model.pt, metrics.json
//! request_gpus          = 1
//! request_memory        = 64GB
//! +JobLength            = "short"
//! queue 4
//! ```
//!
//! Every `queue` statement emits one [`JobSpec`] per process with the settings
//! in effect at that point. `$(Process)` is expanded here; `$(Cluster)` is left
//! for the scheduler, which allocates the cluster id.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::descriptor::{JobSpec, Labels, Resources};

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;

const DEFAULT_CPUS: u32 = 1;
const DEFAULT_MEMORY_BYTES: u64 = 128 * MIB;
const DEFAULT_DISK_BYTES: u64 = 1 << 30;

const MAX_MACRO_DEPTH: usize = 16;

/// Upper bound on processes queued by one submit file, across all `queue`
/// statements.
pub const MAX_PROCESSES_PER_FILE: u32 = 10_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitFileError {
    #[error("line {line}: expected `key = value`, found {text:?}")]
    Syntax { line: usize, text: String },

    #[error("line {line}: invalid value for {key}: {value:?}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },

    #[error("line {line}: unsupported universe {universe:?}, only docker is supported")]
    UnsupportedUniverse { line: usize, universe: String },

    #[error("line {line}: {key} must be set before queue")]
    MissingKey { line: usize, key: &'static str },

    #[error("line {line}: only one input bundle is supported, found {count}")]
    MultipleInputs { line: usize, count: usize },

    #[error("submit file has no queue statement")]
    NoQueue,
}

/// Parse a submit file into one spec per queued process.
pub fn parse_submit_file(text: &str) -> Result<Vec<JobSpec>, SubmitFileError> {
    let mut parser = SubmitParser::default();
    let mut pending = String::new();
    let mut pending_start = 0;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim();

        if pending.is_empty() {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            pending_start = line_no;
        }

        // Trailing backslash continues the statement on the next line.
        if let Some(head) = trimmed.strip_suffix('\\') {
            pending.push_str(head.trim_end());
            pending.push(' ');
            continue;
        }

        pending.push_str(trimmed);
        let statement = std::mem::take(&mut pending);
        parser.statement(pending_start, statement.trim())?;
    }

    if !pending.is_empty() {
        parser.statement(pending_start, pending.trim())?;
    }

    if !parser.saw_queue {
        return Err(SubmitFileError::NoQueue);
    }
    Ok(parser.specs)
}

#[derive(Default)]
struct SubmitParser {
    /// Lower-cased key to raw value.
    settings: BTreeMap<String, String>,
    labels: Labels,
    next_process: u32,
    saw_queue: bool,
    specs: Vec<JobSpec>,
}

impl SubmitParser {
    fn statement(&mut self, line: usize, text: &str) -> Result<(), SubmitFileError> {
        if let Some(count) = queue_count(text) {
            let count = count.map_err(|value| SubmitFileError::InvalidValue {
                line,
                key: "queue".to_string(),
                value,
            })?;
            let total = self
                .next_process
                .checked_add(count)
                .filter(|total| *total <= MAX_PROCESSES_PER_FILE)
                .ok_or_else(|| SubmitFileError::InvalidValue {
                    line,
                    key: "queue".to_string(),
                    value: format!(
                        "{} (at most {} processes per file)",
                        count, MAX_PROCESSES_PER_FILE
                    ),
                })?;
            self.saw_queue = true;
            for process in self.next_process..total {
                let spec = self.build(line, process)?;
                self.specs.push(spec);
            }
            self.next_process = total;
            return Ok(());
        }

        let (key, value) = text.split_once('=').ok_or_else(|| SubmitFileError::Syntax {
            line,
            text: text.to_string(),
        })?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(SubmitFileError::Syntax {
                line,
                text: text.to_string(),
            });
        }

        match key.strip_prefix('+') {
            Some(attr) if !attr.is_empty() => {
                self.labels
                    .insert(label_key(attr), strip_quotes(value).to_string());
            }
            Some(_) => {
                return Err(SubmitFileError::Syntax {
                    line,
                    text: text.to_string(),
                })
            }
            None => {
                self.settings
                    .insert(key.to_ascii_lowercase(), value.to_string());
            }
        }
        Ok(())
    }

    fn get(&self, key: &str, process: u32) -> Option<String> {
        self.settings
            .get(key)
            .map(|raw| self.expand(raw, process, 0))
            .filter(|v| !v.is_empty())
    }

    fn expand(&self, raw: &str, process: u32, depth: usize) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;

        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find(')') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let name = &after[..end];
            let whole = &rest[start..start + 2 + end + 1];

            match name.to_ascii_lowercase().as_str() {
                "process" | "procid" => out.push_str(&process.to_string()),
                "cluster" | "clusterid" => out.push_str(whole),
                other => match self.settings.get(other) {
                    Some(value) if depth < MAX_MACRO_DEPTH => {
                        out.push_str(&self.expand(value, process, depth + 1))
                    }
                    _ => out.push_str(whole),
                },
            }
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        out
    }

    fn build(&self, line: usize, process: u32) -> Result<JobSpec, SubmitFileError> {
        if let Some(universe) = self.get("universe", process) {
            if !universe.eq_ignore_ascii_case("docker") {
                return Err(SubmitFileError::UnsupportedUniverse { line, universe });
            }
        }

        let image = self
            .get("docker_image", process)
            .or_else(|| self.get("image", process))
            .ok_or(SubmitFileError::MissingKey {
                line,
                key: "docker_image",
            })?;

        let mut command = Vec::new();
        if let Some(executable) = self.get("executable", process) {
            command.push(executable);
        }
        if let Some(arguments) = self.get("arguments", process) {
            command.extend(split_arguments(&arguments));
        }

        let inputs = self
            .get("transfer_input_files", process)
            .map(|v| split_list(&v))
            .unwrap_or_default();
        if inputs.len() > 1 {
            return Err(SubmitFileError::MultipleInputs {
                line,
                count: inputs.len(),
            });
        }

        let resources = Resources {
            gpus: self.parse_count("request_gpus", process, line, 0)?,
            cpus: self.parse_count("request_cpus", process, line, DEFAULT_CPUS)?,
            memory_bytes: self.parse_size("request_memory", process, line, MIB, DEFAULT_MEMORY_BYTES)?,
            disk_bytes: self.parse_size("request_disk", process, line, KIB, DEFAULT_DISK_BYTES)?,
        };

        let labels = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), self.expand(v, process, 0)))
            .collect();

        Ok(JobSpec {
            image,
            command,
            input_artifact: inputs.into_iter().next(),
            output_artifacts: self
                .get("transfer_output_files", process)
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            stdout_artifact: self.get("output", process),
            stderr_artifact: self.get("error", process),
            resources,
            labels,
            cluster_id: None,
            process_id: process,
        })
    }

    fn parse_count(
        &self,
        key: &str,
        process: u32,
        line: usize,
        default: u32,
    ) -> Result<u32, SubmitFileError> {
        match self.get(key, process) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| SubmitFileError::InvalidValue {
                line,
                key: key.to_string(),
                value,
            }),
        }
    }

    fn parse_size(
        &self,
        key: &str,
        process: u32,
        line: usize,
        default_unit: u64,
        default: u64,
    ) -> Result<u64, SubmitFileError> {
        match self.get(key, process) {
            None => Ok(default),
            Some(value) => {
                parse_size(&value, default_unit).ok_or_else(|| SubmitFileError::InvalidValue {
                    line,
                    key: key.to_string(),
                    value,
                })
            }
        }
    }
}

/// `Some(Ok(n))` for a queue statement, `Some(Err(text))` for a malformed one.
fn queue_count(text: &str) -> Option<Result<u32, String>> {
    let head = text.get(..5)?;
    if !head.eq_ignore_ascii_case("queue") {
        return None;
    }
    let rest = &text[5..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim();
    if rest.is_empty() {
        return Some(Ok(1));
    }
    Some(rest.parse::<u32>().map_err(|_| rest.to_string()))
}

/// Parse a size such as `64GB`, `512M`, `2.5GiB` or a bare number in
/// `default_unit`. Single-letter and `*iB` suffixes are binary, `*B` suffixes
/// are decimal.
pub fn parse_size(value: &str, default_unit: u64) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    if number.is_empty() {
        return None;
    }

    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" => default_unit,
        "B" => 1,
        "K" | "KIB" => 1 << 10,
        "M" | "MIB" => 1 << 20,
        "G" | "GIB" => 1 << 30,
        "T" | "TIB" => 1 << 40,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        _ => return None,
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier);
    }
    let fractional: f64 = number.parse().ok()?;
    let bytes = (fractional * multiplier as f64).round();
    if bytes.is_finite() && bytes >= 0.0 && bytes <= u64::MAX as f64 {
        Some(bytes as u64)
    } else {
        None
    }
}

/// Split an `arguments` value. Surrounding double quotes select the newer
/// syntax; in both forms single quotes group words and `''` is a literal quote.
pub fn split_arguments(value: &str) -> Vec<String> {
    let value = value.trim();
    let inner = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' if quoted && chars.peek() == Some(&'\'') => {
                chars.next();
                current.push('\'');
            }
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_quotes(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// `+JobLength` becomes the label `jobLength`.
fn label_key(attr: &str) -> String {
    let mut chars = attr.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("64GB", MIB), Some(64_000_000_000));
        assert_eq!(parse_size("64 GB", MIB), Some(64_000_000_000));
        assert_eq!(parse_size("2G", MIB), Some(2 << 30));
        assert_eq!(parse_size("1.5GiB", MIB), Some(3 << 29));
        assert_eq!(parse_size("512", MIB), Some(512 << 20));
        assert_eq!(parse_size("100", KIB), Some(102_400));
        assert_eq!(parse_size("10kb", KIB), Some(10_000));
        assert_eq!(parse_size("GB", MIB), None);
        assert_eq!(parse_size("12XB", MIB), None);
    }

    #[test]
    fn argument_splitting() {
        assert_eq!(split_arguments("a  b c"), vec!["a", "b", "c"]);
        assert_eq!(
            split_arguments("\"--name 'two words' x\""),
            vec!["--name", "two words", "x"]
        );
        assert_eq!(split_arguments("'it''s'"), vec!["it's"]);
        assert_eq!(split_arguments("''"), vec![""]);
        assert!(split_arguments("   ").is_empty());
    }

    #[test]
    fn queue_statements() {
        assert_eq!(queue_count("queue"), Some(Ok(1)));
        assert_eq!(queue_count("Queue 3"), Some(Ok(3)));
        assert_eq!(queue_count("queue lots"), Some(Err("lots".to_string())));
        assert_eq!(queue_count("queued = 1"), None);
        assert_eq!(queue_count("q"), None);
    }

    #[test]
    fn label_keys() {
        assert_eq!(label_key("JobLength"), "jobLength");
        assert_eq!(label_key("wantFlocking"), "wantFlocking");
    }
}

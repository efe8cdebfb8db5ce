//! Sandbox executor: turns a confirmed suggestion into a runnable script,
//! installs declared dependencies, runs the script with retries and
//! timeouts, and quarantines observer events for the duration of the run.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration, Instant};

use crate::error::LlmError;
use crate::llm::TextModel;
use crate::registry::{Action, ActionRegistry};
use crate::util::now_ts;

const RUN_TIMEOUT_SECS: u64 = 60;
const INSTALL_TIMEOUT_SECS: u64 = 120;
const MAX_ATTEMPTS: u32 = 3;

/// Importable third-party packages the executor will install. Anything else
/// fails the run before installation.
const ALLOWED_LIBRARIES: &[&str] = &[
    "Pillow",
    "openpyxl",
    "pypdf",
    "PyPDF2",
    "python-dateutil",
    "pandas",
];

/// Standard-library modules that never need installation.
const STDLIB_MODULES: &[&str] = &[
    "os", "sys", "pathlib", "shutil", "glob", "fnmatch", "datetime", "time", "json", "csv", "re",
    "string", "collections", "itertools", "functools", "operator", "math", "random", "statistics",
    "decimal", "fractions", "io", "tempfile", "argparse", "logging", "textwrap", "platform",
    "typing", "unicodedata", "zipfile", "tarfile", "hashlib", "uuid",
];

/// Import names whose pip package is spelled differently.
fn pip_name(import_name: &str) -> &str {
    match import_name {
        "PIL" => "Pillow",
        "dateutil" => "python-dateutil",
        "openpyxl" => "openpyxl",
        name => name,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResult {
    pub attempt: u32,
    pub return_code: Option<i32>,
    pub output: String,
    pub error: String,
    pub execution_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedLibrary {
    pub library: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryInstallation {
    pub success: bool,
    pub installed: Vec<String>,
    pub failed: Vec<FailedLibrary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub attempts: Vec<AttemptResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_installation: Option<LibraryInstallation>,
    pub execution_id: u64,
    pub timestamp: f64,
}

/// Raises the registry's automation flag for the lifetime of one run and
/// clears it on every exit path, panics included.
struct AutomationGuard {
    registry: Arc<ActionRegistry>,
}

impl AutomationGuard {
    fn raise(registry: Arc<ActionRegistry>) -> Self {
        registry.set_automation_running(true);
        Self { registry }
    }
}

impl Drop for AutomationGuard {
    fn drop(&mut self) {
        self.registry.set_automation_running(false);
    }
}

/// Scan a script for third-party requirements. A `# requires: a, b` header
/// wins; otherwise top-level import lines minus the stdlib set.
pub fn scan_dependencies(script: &str) -> Vec<String> {
    let stdlib: HashSet<&str> = STDLIB_MODULES.iter().copied().collect();

    for line in script.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("# requires:") {
            let mut names: Vec<String> = rest
                .split(',')
                .map(|name| pip_name(name.trim()).to_string())
                .filter(|name| !name.is_empty())
                .collect();
            names.sort();
            names.dedup();
            return names;
        }
    }

    let mut names: Vec<String> = Vec::new();
    for line in script.lines() {
        // Only unindented imports count; nested ones belong to the script's
        // own control flow.
        let module = if let Some(rest) = line.strip_prefix("import ") {
            rest.split([' ', '.', ',']).next()
        } else if let Some(rest) = line.strip_prefix("from ") {
            rest.split([' ', '.']).next()
        } else {
            None
        };
        if let Some(module) = module {
            let module = module.trim();
            if !module.is_empty() && !stdlib.contains(module) {
                names.push(pip_name(module).to_string());
            }
        }
    }
    names.sort();
    names.dedup();
    names
}

/// Strip markdown fences the model sometimes wraps code in.
pub fn clean_script(raw: &str) -> String {
    let mut script = raw.trim();
    if let Some(rest) = script.strip_prefix("```python") {
        script = rest;
    } else if let Some(rest) = script.strip_prefix("```") {
        script = rest;
    }
    if let Some(rest) = script.strip_suffix("```") {
        script = rest;
    }
    script.trim().to_string()
}

pub struct ScriptExecutor {
    model: Arc<dyn TextModel>,
    registry: Arc<ActionRegistry>,
    scripts_dir: PathBuf,
    interpreter: String,
    slot: Semaphore,
    execution_counter: AtomicU64,
}

impl ScriptExecutor {
    pub fn new(
        model: Arc<dyn TextModel>,
        registry: Arc<ActionRegistry>,
        scripts_dir: PathBuf,
        interpreter: String,
    ) -> Self {
        Self {
            model,
            registry,
            scripts_dir,
            interpreter,
            slot: Semaphore::new(1),
            execution_counter: AtomicU64::new(0),
        }
    }

    /// Produce a script plus a short plain-language summary for the user.
    pub async fn generate(
        &self,
        pattern_description: &str,
        user_explanation: &str,
        actions: &[Action],
    ) -> Result<(String, String), LlmError> {
        let prompt = script_prompt(pattern_description, user_explanation, actions);
        let script = clean_script(&self.model.ask(&prompt, "script_generator").await?);
        let summary = self.summarize(&script).await?;
        Ok((script, summary))
    }

    /// Rework a previous script against the user's refinement request.
    pub async fn refine(
        &self,
        previous_script: &str,
        refinement: &str,
    ) -> Result<(String, String), LlmError> {
        let prompt = refine_prompt(previous_script, refinement);
        let script = clean_script(&self.model.ask(&prompt, "script_generator").await?);
        let summary = self.summarize(&script).await?;
        Ok((script, summary))
    }

    async fn summarize(&self, script: &str) -> Result<String, LlmError> {
        let prompt = summary_prompt(script);
        self.model.ask(&prompt, "script_summarizer").await
    }

    /// Run a confirmed script. Never panics the caller; every outcome is an
    /// `ExecutionResult`. Exactly one execution is active at a time.
    pub async fn execute(&self, script: &str, user_explanation: &str) -> ExecutionResult {
        let _permit = self.slot.acquire().await.expect("executor semaphore closed");
        let execution_id = self.execution_counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!("execution #{execution_id} starting: {user_explanation}");

        let _guard = AutomationGuard::raise(self.registry.clone());

        let mut result = ExecutionResult {
            success: false,
            attempts: Vec::new(),
            final_error: None,
            library_installation: None,
            execution_id,
            timestamp: now_ts(),
        };

        let required = scan_dependencies(script);
        let disallowed: Vec<&String> = required
            .iter()
            .filter(|name| !ALLOWED_LIBRARIES.contains(&name.as_str()))
            .collect();
        if !disallowed.is_empty() {
            let failed = disallowed
                .iter()
                .map(|library| FailedLibrary {
                    library: library.to_string(),
                    error: "not on the allowed library list".to_string(),
                })
                .collect();
            result.library_installation = Some(LibraryInstallation {
                success: false,
                installed: Vec::new(),
                failed,
            });
            result.final_error = Some(format!(
                "script requires libraries outside the allow-list: {}",
                disallowed
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            return result;
        }

        if !required.is_empty() {
            let installation = self.install_libraries(&required).await;
            let ok = installation.success;
            result.library_installation = Some(installation);
            if !ok {
                result.final_error = Some("library installation failed".to_string());
                return result;
            }
        }

        let script_path = self.scripts_dir.join(format!("exec_{execution_id}.py"));
        if let Err(err) = std::fs::create_dir_all(&self.scripts_dir) {
            result.final_error = Some(format!("cannot create scripts directory: {err}"));
            return result;
        }
        if let Err(err) = std::fs::write(&script_path, script) {
            result.final_error = Some(format!("cannot materialise script: {err}"));
            return result;
        }

        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = self.run_once(&script_path, attempt).await;
            let succeeded = outcome.return_code == Some(0);
            result.attempts.push(outcome);

            if succeeded {
                result.success = true;
                if let Err(err) = std::fs::remove_file(&script_path) {
                    warn!("failed to clean up {}: {err}", script_path.display());
                }
                break;
            }
        }

        if !result.success {
            result.final_error = result
                .attempts
                .last()
                .map(|a| a.error.clone())
                .filter(|e| !e.is_empty())
                .or(Some("script failed on every attempt".to_string()));
            info!(
                "execution #{execution_id} failed; script kept at {}",
                script_path.display()
            );
        } else {
            info!(
                "execution #{execution_id} succeeded on attempt {}",
                result.attempts.len()
            );
        }
        result
    }

    async fn run_once(&self, script_path: &std::path::Path, attempt: u32) -> AttemptResult {
        let started = Instant::now();
        let mut command = Command::new(&self.interpreter);
        command
            .arg(script_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match timeout(Duration::from_secs(RUN_TIMEOUT_SECS), command.output()).await {
            Ok(Ok(output)) => {
                let return_code = output.status.code();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                AttemptResult {
                    attempt,
                    return_code,
                    output: String::from_utf8_lossy(&output.stdout).into_owned(),
                    error: if return_code == Some(0) { String::new() } else { stderr },
                    execution_time: started.elapsed().as_secs_f64(),
                }
            }
            Ok(Err(err)) => AttemptResult {
                attempt,
                return_code: None,
                output: String::new(),
                error: format!("failed to start interpreter: {err}"),
                execution_time: started.elapsed().as_secs_f64(),
            },
            Err(_) => AttemptResult {
                attempt,
                return_code: None,
                output: String::new(),
                error: format!("script timed out after {RUN_TIMEOUT_SECS}s"),
                execution_time: started.elapsed().as_secs_f64(),
            },
        }
    }

    async fn install_libraries(&self, libraries: &[String]) -> LibraryInstallation {
        let mut installed = Vec::new();
        let mut failed = Vec::new();

        for library in libraries {
            let mut command = Command::new(&self.interpreter);
            command
                .args(["-m", "pip", "install", library])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            match timeout(Duration::from_secs(INSTALL_TIMEOUT_SECS), command.output()).await {
                Ok(Ok(output)) if output.status.success() => {
                    installed.push(library.clone());
                }
                Ok(Ok(output)) => failed.push(FailedLibrary {
                    library: library.clone(),
                    error: String::from_utf8_lossy(&output.stderr).into_owned(),
                }),
                Ok(Err(err)) => failed.push(FailedLibrary {
                    library: library.clone(),
                    error: err.to_string(),
                }),
                Err(_) => failed.push(FailedLibrary {
                    library: library.clone(),
                    error: format!("installation timed out after {INSTALL_TIMEOUT_SECS}s"),
                }),
            }
        }

        LibraryInstallation {
            success: failed.is_empty(),
            installed,
            failed,
        }
    }
}

fn script_prompt(pattern_description: &str, user_explanation: &str, actions: &[Action]) -> String {
    let mut lines = vec![
        "You are a Python automation script generator. Produce a SIMPLE, SAFE script.".to_string(),
        String::new(),
        "Rules:".to_string(),
        "- Output ONLY raw Python code, no markdown fences.".to_string(),
        "- Use full absolute paths exactly as they appear below.".to_string(),
        "- Run without prompting: no input(), no confirmations.".to_string(),
        "- Prefer the standard library (os, shutil, pathlib, glob, re).".to_string(),
        "- If a third-party package is unavoidable, declare it on the first".to_string(),
        "  line as `# requires: package` using the correct pip name.".to_string(),
        "- Wrap the work in a main() with try/except and an".to_string(),
        "  `if __name__ == '__main__':` guard.".to_string(),
        String::new(),
        format!("Observed pattern: {pattern_description}"),
        format!("User wants: {user_explanation}"),
        String::new(),
        "File operations observed:".to_string(),
    ];
    for action in actions {
        if let Some(op) = action.file_operation() {
            lines.push(format!(
                "- {} | {} | {}",
                op.event_type.as_str(),
                op.src_path,
                op.dest_path.unwrap_or_default()
            ));
        }
    }
    lines.push(String::new());
    lines.push("Generate the script now:".to_string());
    lines.join("\n")
}

fn refine_prompt(previous_script: &str, refinement: &str) -> String {
    format!(
        "You are a Python automation script generator. The user wants changes\n\
         to the script below. Apply them and output ONLY the full updated raw\n\
         Python code, no markdown fences. Keep the same safety rules: absolute\n\
         paths, no prompts, standard library preferred, `# requires:` header\n\
         for any third-party package.\n\n\
         Current script:\n{previous_script}\n\n\
         Requested change: {refinement}\n"
    )
}

fn summary_prompt(script: &str) -> String {
    format!(
        "Explain the following Python automation script to a non-technical\n\
         user as 3-5 short bullet points. Each bullet starts with `- ` and\n\
         says WHAT will happen, naming concrete files or folders from the\n\
         code. No jargon, no description of how the code works.\n\n\
         ```python\n{script}\n```\n"
    )
}

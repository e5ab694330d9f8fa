//! Harness backed by an external command.
//!
//! The child process reports on stdout, one JSON object per line:
//!
//! ```text
//! {"type":"plan","units":25,"environment_sha":"9f2c41e","dataset_variant":"v1"}
//! {"type":"unit","id":"HumanEval/0","passed":true,"tokens_prompt":812,"latency_s":1.4}
//! {"type":"artifact","name":"samples.jsonl","content":"..."}
//! {"type":"error","message":"sandbox warm-up slow"}
//! {"type":"result","score":0.96,"n":25}
//! ```
//!
//! Settings on the `plan` line are what the child actually loaded; they
//! still count if the run is cut short before a `result` line.
//!
//! Lines that are not JSON objects of a known type are logged and skipped.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{Harness, HarnessContext, HarnessDescriptor, HarnessError, HarnessOutput, Invocation, UnitOutcome};

const STDERR_TAIL: usize = 20;

/// `EX_TEMPFAIL` from sysexits.h
const DEFAULT_TRANSIENT_EXIT_CODES: &[i32] = &[75];

fn default_transient_codes() -> Vec<i32> {
    DEFAULT_TRANSIENT_EXIT_CODES.to_vec()
}

/// How to launch the child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Exit codes treated as transient infrastructure failures
    #[serde(default = "default_transient_codes")]
    pub transient_exit_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            transient_exit_codes: default_transient_codes(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line {
    Plan {
        units: u64,
        #[serde(default)]
        environment_sha: Option<String>,
        #[serde(default)]
        dataset_variant: Option<String>,
    },
    Unit {
        #[serde(flatten)]
        unit: UnitOutcome,
    },
    Artifact {
        name: String,
        #[serde(default = "default_content_type")]
        content_type: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Error {
        message: String,
    },
    Result {
        #[serde(flatten)]
        output: HarnessOutput,
    },
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

/// Runs a pinned external program as the harness.
#[derive(Debug, Clone)]
pub struct CommandHarness {
    descriptor: HarnessDescriptor,
    spec: CommandSpec,
}

impl CommandHarness {
    pub fn new(descriptor: HarnessDescriptor, spec: CommandSpec) -> Self {
        Self { descriptor, spec }
    }

    fn command(&self, invocation: &Invocation) -> Result<Command, HarnessError> {
        let claim = &invocation.claim;
        let settings = serde_json::to_string(&claim.settings)
            .map_err(|e| HarnessError::Invalid(format!("settings: {e}")))?;

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .env("CLAIMSCOPE_RUN_ID", invocation.run_id.as_str())
            .env("CLAIMSCOPE_CLAIM_ID", claim.claim_id.as_str())
            .env("CLAIMSCOPE_DOMAIN", &claim.domain)
            .env("CLAIMSCOPE_TASK", &claim.task)
            .env("CLAIMSCOPE_METRIC", &claim.metric)
            .env("CLAIMSCOPE_SETTINGS", settings)
            .env("CLAIMSCOPE_MODEL", &invocation.model.name)
            .env("CLAIMSCOPE_PROVIDER", invocation.model.provider.to_string())
            .env("CLAIMSCOPE_BUDGET_USD", invocation.budget_usd.to_string())
            .env("CLAIMSCOPE_ATTEMPT", invocation.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key_ref) = &invocation.model.api_key_ref {
            cmd.env("CLAIMSCOPE_API_KEY_REF", key_ref);
        }
        if let Some(seed) = claim.settings.seed {
            cmd.env("CLAIMSCOPE_SEED", seed.to_string());
        }
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }

    async fn handle_line(
        &self,
        raw: &str,
        ctx: &HarnessContext,
        output: &mut Option<HarnessOutput>,
        errors: &mut Vec<String>,
    ) -> Result<(), HarnessError> {
        let line: Line = match serde_json::from_str(raw) {
            Ok(line) => line,
            Err(e) => {
                debug!(harness = %self.descriptor.name, error = %e, "skipping non-protocol line");
                return Ok(());
            }
        };
        match line {
            Line::Plan {
                units,
                environment_sha,
                dataset_variant,
            } => {
                ctx.observe_settings(environment_sha, dataset_variant);
                ctx.set_total(units);
            }
            Line::Unit { unit } => {
                ctx.record_unit(unit)?;
                if !ctx.plan_complete() {
                    ctx.admit_next()?;
                }
            }
            Line::Artifact {
                name,
                content_type,
                content,
                path,
            } => {
                let data = match (content, path) {
                    (Some(text), _) => text.into_bytes(),
                    (None, Some(path)) => {
                        let path = match &self.spec.working_dir {
                            Some(dir) if path.is_relative() => dir.join(path),
                            _ => path,
                        };
                        tokio::fs::read(&path).await.map_err(|e| {
                            HarnessError::logic(format!("artifact {}: {e}", path.display()))
                        })?
                    }
                    (None, None) => {
                        warn!(harness = %self.descriptor.name, artifact = %name, "artifact line has no content");
                        return Ok(());
                    }
                };
                ctx.add_artifact(name, content_type, data);
            }
            Line::Error { message } => errors.push(message),
            Line::Result { output: result } => *output = Some(result),
        }
        Ok(())
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

async fn kill(child: &mut Child, harness: &str) {
    if let Err(e) = child.kill().await {
        warn!(harness = %harness, error = %e, "failed to kill harness process");
    }
}

#[async_trait]
impl Harness for CommandHarness {
    fn descriptor(&self) -> &HarnessDescriptor {
        &self.descriptor
    }

    async fn run(&self, invocation: &Invocation, ctx: &HarnessContext) -> Result<HarnessOutput, HarnessError> {
        let mut child = self.command(invocation)?.spawn().map_err(|e| {
            HarnessError::logic(format!("failed to spawn {}: {e}", self.spec.program))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Transient("child stdout unavailable".to_string()))?;
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(collect_tail(s)));

        let mut lines = BufReader::new(stdout).lines();
        let mut output = None;
        let mut errors = Vec::new();

        loop {
            let next = tokio::select! {
                _ = ctx.cancelled() => {
                    kill(&mut child, &self.descriptor.name).await;
                    return Err(HarnessError::Cancelled);
                }
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(raw)) => {
                    let raw = raw.trim();
                    if raw.is_empty() {
                        continue;
                    }
                    if let Err(e) = self.handle_line(raw, ctx, &mut output, &mut errors).await {
                        kill(&mut child, &self.descriptor.name).await;
                        return Err(e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    kill(&mut child, &self.descriptor.name).await;
                    return Err(HarnessError::Transient(format!("reading harness output: {e}")));
                }
            }
        }

        let status = tokio::select! {
            _ = ctx.cancelled() => {
                kill(&mut child, &self.descriptor.name).await;
                return Err(HarnessError::Cancelled);
            }
            status = child.wait() => status
                .map_err(|e| HarnessError::Transient(format!("waiting for harness: {e}")))?,
        };
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if status.success() {
            let mut output = output.unwrap_or_default();
            output.errors.extend(errors);
            return Ok(output);
        }

        let code = status.code();
        let message = format!(
            "{} exited with {}{}",
            self.spec.program,
            code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
            stderr_tail
                .last()
                .map(|l| format!(": {l}"))
                .unwrap_or_default(),
        );
        match code {
            Some(c) if self.spec.transient_exit_codes.contains(&c) => Err(HarnessError::Transient(message)),
            _ => {
                errors.extend(stderr_tail);
                Err(HarnessError::Logic {
                    message,
                    failures: errors,
                })
            }
        }
    }
}

//! Turns catalog operations into sandboxed tool runs and normalizes what
//! comes back into one record shape.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sandbox::{ExecFailure, ExecRequest, ExecutionResult, ResourceSnapshot, Sandbox, SecurityMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::{Catalog, Operation};
use crate::fallback::FallbackProvider;
use crate::tool::ToolCommand;

/// Longest stderr excerpt carried into a fallback reason.
const STDERR_EXCERPT_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Ask the tool for JSON (`-r json`) and parse it.
    #[default]
    Json,
    /// Keep the tool's own table output.
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Output {
    Json(Value),
    Text(String),
}

/// Uniform record for one requested operation, whatever happened to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRunResult {
    pub operation: String,
    pub success: bool,
    pub output: Option<Output>,
    pub command: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub peak: Option<ResourceSnapshot>,
    pub security_mode: SecurityMode,
    /// Output is placeholder data, not the tool's.
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_error: Option<String>,
    /// Why the operation was not run at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl AnalysisRunResult {
    fn base(operation: &str, timestamp: DateTime<Utc>, security_mode: SecurityMode) -> Self {
        Self {
            operation: operation.to_string(),
            success: false,
            output: None,
            command: None,
            timestamp,
            elapsed_secs: 0.0,
            peak: None,
            security_mode,
            fallback: false,
            original_error: None,
            error: None,
            stderr: None,
        }
    }
}

pub struct ToolAdapter {
    catalog: Arc<Catalog>,
    fallback: Arc<dyn FallbackProvider>,
    tool: Option<ToolCommand>,
    output: OutputMode,
}

impl ToolAdapter {
    pub fn new(
        catalog: Arc<Catalog>,
        fallback: Arc<dyn FallbackProvider>,
        tool: Option<ToolCommand>,
        output: OutputMode,
    ) -> Self {
        Self {
            catalog,
            fallback,
            tool,
            output,
        }
    }

    /// Run one catalog operation against `image` inside `sandbox`.
    ///
    /// Always returns a record. Operations that cannot be run come back with
    /// `success = false` and `error` set; runs that fail come back as a
    /// fallback carrying placeholder output and the original failure.
    pub async fn run_operation(
        &self,
        sandbox: &dyn Sandbox,
        image: &Path,
        operation_id: &str,
    ) -> AnalysisRunResult {
        let mut record = AnalysisRunResult::base(operation_id, Utc::now(), sandbox.security_mode());

        let Some(operation) = self.catalog.get(operation_id) else {
            warn!(operation = operation_id, "unknown operation");
            record.error = Some(format!("unknown operation {operation_id:?}"));
            return record;
        };
        if let Some(requires) = &operation.requires {
            info!(operation = operation_id, requires = %requires, "skipping operation");
            record.error = Some(format!("skipped: {operation_id} requires {requires}"));
            return record;
        }
        let Some(tool) = &self.tool else {
            return self.substitute(record, "forensics tool not found".into());
        };

        let request = self.build_request(tool, image, operation);
        let command_line = request.display();
        info!(operation = operation_id, command = %command_line, "running operation");
        let result = sandbox.run(&request).await;

        record.command = Some(command_line);
        record.elapsed_secs = result.elapsed.as_secs_f64();
        record.peak = Some(result.peak);
        record.stderr = non_empty(&result.stderr);
        if result.success {
            record.success = true;
            record.output = Some(self.parse_output(result.stdout));
            info!(operation = operation_id, elapsed_secs = record.elapsed_secs, "operation completed");
            return record;
        }

        match &result.error {
            Some(e @ (ExecFailure::Cancelled | ExecFailure::SessionClosed)) => {
                record.error = Some(e.to_string());
                record
            }
            _ => {
                let reason = failure_reason(&result);
                self.substitute(record, reason)
            }
        }
    }

    /// `<tool…> -f <absolute image> [-r json] <operation> <fixed args…>`
    pub fn build_request(&self, tool: &ToolCommand, image: &Path, operation: &Operation) -> ExecRequest {
        let mut request = ExecRequest::new(tool.program.clone())
            .args(tool.args.iter().cloned())
            .arg("-f")
            .arg(absolute(image));
        if self.output == OutputMode::Json {
            request = request.args(["-r", "json"]);
        }
        request.arg(&operation.id).args(&operation.args)
    }

    fn parse_output(&self, stdout: String) -> Output {
        if self.output == OutputMode::Json && !stdout.trim().is_empty() {
            match serde_json::from_str(&stdout) {
                Ok(value) => return Output::Json(value),
                Err(e) => warn!(error = %e, "tool output is not valid JSON, keeping raw text"),
            }
        }
        Output::Text(stdout)
    }

    fn substitute(&self, mut record: AnalysisRunResult, reason: String) -> AnalysisRunResult {
        warn!(operation = %record.operation, reason = %reason, "substituting placeholder output");
        record.success = true;
        record.fallback = true;
        record.output = Some(Output::Json(self.fallback.placeholder(&record.operation)));
        record.original_error = Some(reason);
        record
    }
}

/// The failure description plus an excerpt of whatever the tool printed.
fn failure_reason(result: &ExecutionResult) -> String {
    let description = result
        .error
        .as_ref()
        .map_or_else(|| "execution failed".to_string(), ToString::to_string);
    let detail = if result.stderr.trim().is_empty() {
        &result.stdout
    } else {
        &result.stderr
    };
    let detail = detail.trim();
    if detail.is_empty() {
        return description;
    }
    let excerpt: String = detail.chars().take(STDERR_EXCERPT_CHARS).collect();
    format!("{description}: {excerpt}")
}

fn non_empty(text: &str) -> Option<String> {
    (!text.trim().is_empty()).then(|| text.to_string())
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use sandbox::{Cleanup, FilePolicy, ValidationResult, validate_file};

    use super::*;
    use crate::fallback::DemoData;

    /// Records every request and answers with a canned result.
    struct RecordingSandbox {
        requests: Mutex<Vec<ExecRequest>>,
        reply: ExecutionResult,
        mode: SecurityMode,
    }

    impl RecordingSandbox {
        fn replying(reply: ExecutionResult) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                reply,
                mode: SecurityMode::Sandboxed,
            }
        }

        fn requests(&self) -> Vec<ExecRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sandbox for RecordingSandbox {
        fn id(&self) -> &str {
            "recording"
        }

        fn workspace(&self) -> &Path {
            Path::new("/tmp")
        }

        fn security_mode(&self) -> SecurityMode {
            self.mode
        }

        async fn validate(&self, path: &Path) -> ValidationResult {
            validate_file(path, &FilePolicy::default()).await
        }

        async fn run(&self, request: &ExecRequest) -> ExecutionResult {
            self.requests.lock().unwrap().push(request.clone());
            self.reply.clone()
        }

        async fn close(&self) -> Cleanup {
            Cleanup::Removed
        }
    }

    fn finished(stdout: &str) -> ExecutionResult {
        ExecutionResult {
            success: true,
            exit_code: Some(0),
            pid: Some(42),
            stdout: stdout.to_string(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed: Duration::from_millis(250),
            peak: ResourceSnapshot {
                memory_mb: 12.0,
                cpu_percent: 40.0,
                elapsed_secs: 0.25,
            },
            error: None,
        }
    }

    fn failed(error: ExecFailure, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            success: false,
            exit_code: None,
            stderr: stderr.to_string(),
            error: Some(error),
            ..finished("")
        }
    }

    fn vol() -> ToolCommand {
        ToolCommand {
            program: OsString::from("vol"),
            args: Vec::new(),
        }
    }

    fn adapter(tool: Option<ToolCommand>, output: OutputMode) -> ToolAdapter {
        ToolAdapter::new(
            Arc::new(Catalog::builtin().unwrap()),
            Arc::new(DemoData::builtin().unwrap()),
            tool,
            output,
        )
    }

    fn args_of(request: &ExecRequest) -> Vec<String> {
        request
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn unknown_operation_never_runs() {
        let sb = RecordingSandbox::replying(finished("[]"));
        let record = adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.nope")
            .await;

        assert!(!record.success);
        assert!(!record.fallback);
        assert!(record.error.unwrap().contains("unknown operation"));
        assert!(sb.requests().is_empty());
    }

    #[tokio::test]
    async fn operation_needing_user_input_is_skipped() {
        let sb = RecordingSandbox::replying(finished("[]"));
        let record = adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.dumpfiles")
            .await;

        assert!(!record.success);
        assert!(record.error.unwrap().starts_with("skipped: windows.dumpfiles requires"));
        assert!(sb.requests().is_empty());
    }

    #[tokio::test]
    async fn missing_tool_falls_back_without_running() {
        let sb = RecordingSandbox::replying(finished("[]"));
        let record = adapter(None, OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.pslist")
            .await;

        assert!(record.success);
        assert!(record.fallback);
        assert_eq!(record.original_error.as_deref(), Some("forensics tool not found"));
        assert!(matches!(record.output, Some(Output::Json(Value::Array(_)))));
        assert!(sb.requests().is_empty());
    }

    #[tokio::test]
    async fn command_line_shape() {
        let sb = RecordingSandbox::replying(finished("[]"));
        adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.vadregexscan")
            .await;

        let requests = sb.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].program, "vol");
        assert_eq!(
            args_of(&requests[0]),
            ["-f", "/img/a.dmp", "-r", "json", "windows.vadregexscan", "--pattern", "MZ"]
        );
    }

    #[tokio::test]
    async fn text_mode_and_tool_prefix() {
        let sb = RecordingSandbox::replying(finished("PID\tImage\n4\tSystem\n"));
        let tool = ToolCommand {
            program: OsString::from("python3"),
            args: vec![OsString::from("/opt/vol.py")],
        };
        let record = adapter(Some(tool), OutputMode::Text)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.pslist")
            .await;

        assert_eq!(
            args_of(&sb.requests()[0]),
            ["/opt/vol.py", "-f", "/img/a.dmp", "windows.pslist"]
        );
        assert_eq!(
            record.output,
            Some(Output::Text("PID\tImage\n4\tSystem\n".into()))
        );
        assert_eq!(
            record.command.as_deref(),
            Some("python3 /opt/vol.py -f /img/a.dmp windows.pslist")
        );
    }

    #[tokio::test]
    async fn relative_image_made_absolute() {
        let sb = RecordingSandbox::replying(finished("[]"));
        adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("images/a.dmp"), "windows.info")
            .await;

        let image = PathBuf::from(&sb.requests()[0].args[1]);
        assert!(image.is_absolute());
        assert!(image.ends_with("images/a.dmp"));
    }

    #[tokio::test]
    async fn json_output_parsed() {
        let sb = RecordingSandbox::replying(finished(r#"[{"PID": 4, "ImageFileName": "System"}]"#));
        let record = adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.pslist")
            .await;

        assert!(record.success);
        assert!(!record.fallback);
        let Some(Output::Json(value)) = record.output else {
            panic!("expected json output");
        };
        assert_eq!(value[0]["PID"], 4);
        assert_eq!(record.elapsed_secs, 0.25);
        assert_eq!(record.peak.unwrap().memory_mb, 12.0);
    }

    #[tokio::test]
    async fn invalid_json_kept_as_text() {
        let sb = RecordingSandbox::replying(finished("Volatility 3 Framework\nPID\n4"));
        let record = adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.pslist")
            .await;

        assert!(record.success);
        assert_eq!(
            record.output,
            Some(Output::Text("Volatility 3 Framework\nPID\n4".into()))
        );
    }

    #[tokio::test]
    async fn empty_output_kept_as_text() {
        let sb = RecordingSandbox::replying(finished(""));
        let record = adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.pslist")
            .await;
        assert_eq!(record.output, Some(Output::Text(String::new())));
    }

    #[tokio::test]
    async fn failed_run_falls_back_preserving_error() {
        let sb = RecordingSandbox::replying(failed(
            ExecFailure::NonZeroExit { code: 1 },
            "Unsatisfied requirement plugins.PsList.kernel\n",
        ));
        let record = adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.pslist")
            .await;

        assert!(record.success);
        assert!(record.fallback);
        let reason = record.original_error.unwrap();
        assert!(reason.starts_with("process exited with code 1"), "{reason}");
        assert!(reason.contains("Unsatisfied requirement"), "{reason}");
        assert_eq!(
            record.output,
            Some(Output::Json(DemoData::builtin().unwrap().placeholder("windows.pslist")))
        );
        assert!(record.command.is_some());
        assert!(record.stderr.is_some());
    }

    #[tokio::test]
    async fn ceiling_breach_falls_back() {
        let sb = RecordingSandbox::replying(failed(
            ExecFailure::MemoryCeiling {
                limit_mb: 100,
                observed_mb: 250.0,
            },
            "",
        ));
        let record = adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.malfind")
            .await;

        assert!(record.fallback);
        assert_eq!(
            record.original_error.as_deref(),
            Some("memory ceiling exceeded: 250.0 MB > 100 MB")
        );
    }

    #[tokio::test]
    async fn cancelled_run_is_not_substituted() {
        let sb = RecordingSandbox::replying(failed(ExecFailure::Cancelled, ""));
        let record = adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.pslist")
            .await;

        assert!(!record.success);
        assert!(!record.fallback);
        assert!(record.output.is_none());
        assert_eq!(record.error.as_deref(), Some("execution cancelled"));
    }

    #[tokio::test]
    async fn record_carries_security_mode_and_serializes() {
        let mut sb = RecordingSandbox::replying(finished("{\"Kernel Base\": \"0x80400000\"}"));
        sb.mode = SecurityMode::Unsandboxed;
        let record = adapter(Some(vol()), OutputMode::Json)
            .run_operation(&sb, Path::new("/img/a.dmp"), "windows.info")
            .await;

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["security_mode"], "unsandboxed");
        assert_eq!(json["operation"], "windows.info");
        assert_eq!(json["fallback"], false);
        assert_eq!(json["output"]["Kernel Base"], "0x80400000");
        assert!(json.get("original_error").is_none());
        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok(), "{timestamp}");
    }

    #[test]
    fn long_stderr_is_trimmed_in_reason() {
        let result = failed(ExecFailure::NonZeroExit { code: 2 }, &"x".repeat(5000));
        let reason = failure_reason(&result);
        assert_eq!(reason.len(), "process exited with code 2: ".len() + STDERR_EXCERPT_CHARS);
    }
}

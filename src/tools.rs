//! Tool surface offered to the model loop.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::sandbox::{CancellationToken, ExecuteOptions, Executor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Per-call context supplied by whoever drives the tool loop.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub working_directory: PathBuf,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, arguments: &str, context: &ToolContext) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct RunCodeArgs {
    #[serde(default)]
    helpers: Vec<String>,
    code: String,
}

/// Runs helpers plus model-written code in the sandbox.
pub struct RunCodeTool {
    executor: Arc<Executor>,
}

impl RunCodeTool {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for RunCodeTool {
    fn name(&self) -> &str {
        "run_code"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "run_code".to_string(),
            description: "Run JavaScript code with helpers. Output is whatever the code logs via console.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "helpers": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "List of helper filenames to include"
                    },
                    "code": {
                        "type": "string",
                        "description": "The full code to run"
                    }
                },
                "required": ["helpers", "code"],
                "additionalProperties": false
            }),
        }
    }

    async fn execute(&self, arguments: &str, context: &ToolContext) -> Result<String> {
        let args: RunCodeArgs = serde_json::from_str(arguments)?;
        debug!(helpers = ?args.helpers, code_len = args.code.len(), "run_code tool call");

        let options = ExecuteOptions::new(&context.working_directory, context.cancel.clone());
        let output = self
            .executor
            .execute(&args.helpers, &args.code, options)
            .await?;
        Ok(output)
    }
}

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::ToolError;
use crate::services::logger::Logger;
use crate::utils::suggest::suggest;

use serde_json::Value;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, args: Value) -> Result<Value, ToolError>;
}

/// Routes a request to the handler registered under its tool name and wraps
/// the result in the `{ok, result, meta}` envelope.
#[derive(Clone)]
pub struct ToolExecutor {
    logger: Logger,
    handlers: Arc<HashMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolExecutor {
    pub fn new(logger: Logger, handlers: HashMap<String, Arc<dyn ToolHandler>>) -> Self {
        Self {
            logger: logger.child("executor"),
            handlers: Arc::new(handlers),
        }
    }

    pub fn tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        let started_at = chrono::Utc::now().timestamp_millis();
        let Some(handler) = self.handlers.get(tool) else {
            let names = self.tools();
            let candidates: Vec<&str> = names.iter().map(String::as_str).collect();
            let suggestions = suggest(tool, &candidates, 3);
            let hint = if suggestions.is_empty() {
                format!("Available tools: {}", candidates.join(", "))
            } else {
                format!("Did you mean: {}", suggestions.join(", "))
            };
            return Err(
                ToolError::invalid_params(format!("Unknown tool: {}", tool)).with_hint(hint)
            );
        };
        let trace_id = args
            .get("trace_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let action = args.get("action").cloned().unwrap_or(Value::Null);

        self.logger.debug(tool, Some(&action));
        let outcome = handler.handle(args).await;
        let duration_ms = chrono::Utc::now().timestamp_millis() - started_at;
        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                self.logger.warn(
                    "tool call failed",
                    Some(&serde_json::json!({
                        "tool": tool,
                        "action": action,
                        "trace_id": trace_id,
                        "code": err.code,
                        "duration_ms": duration_ms,
                    })),
                );
                return Err(err);
            }
        };

        Ok(serde_json::json!({
            "ok": true,
            "result": result,
            "meta": {
                "tool": tool,
                "action": action,
                "trace_id": trace_id,
                "duration_ms": duration_ms,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn handle(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    fn executor() -> ToolExecutor {
        let mut handlers: HashMap<String, Arc<dyn ToolHandler>> = HashMap::new();
        handlers.insert("fs".to_string(), Arc::new(Echo));
        ToolExecutor::new(Logger::new("test"), handlers)
    }

    #[tokio::test]
    async fn wraps_result_with_meta() {
        let payload = executor()
            .execute("fs", serde_json::json!({"action": "exists", "trace_id": "t-1"}))
            .await
            .unwrap();
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["result"]["action"], "exists");
        assert_eq!(payload["meta"]["trace_id"], "t-1");
        assert_eq!(payload["meta"]["tool"], "fs");
    }

    #[tokio::test]
    async fn unknown_tool_suggests_close_names() {
        let err = executor()
            .execute("fz", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_PARAMS");
        assert!(err.hint.unwrap_or_default().contains("fs"));
    }
}

use crate::app::{App, FS_TOOL};
use crate::errors::ToolError;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

/// Line-delimited JSON front end. Each input line is one action object; an
/// optional `tool` field selects the handler and an optional `id` is echoed
/// back on the response line.
pub struct StdioServer {
    app: App,
}

impl StdioServer {
    pub fn new(app: App) -> Self {
        Self { app }
    }

    pub async fn handle_line(&self, line: &str) -> Value {
        let parsed: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                return failure(
                    Value::Null,
                    ToolError::parse(format!("Request is not valid JSON: {}", err)),
                )
            }
        };
        let id = parsed.get("id").cloned().unwrap_or(Value::Null);
        let Value::Object(mut args) = parsed else {
            return failure(id, ToolError::invalid_params("Request must be a JSON object"));
        };
        args.remove("id");
        let tool = match args.remove("tool") {
            None | Some(Value::Null) => FS_TOOL.to_string(),
            Some(Value::String(name)) => name,
            Some(_) => return failure(id, ToolError::invalid_params("tool must be a string")),
        };

        match self.app.tool_executor.execute(&tool, Value::Object(args)).await {
            Ok(mut payload) => {
                if !id.is_null() {
                    payload["id"] = id;
                }
                payload
            }
            Err(err) => failure(id, err),
        }
    }

    pub async fn run_stdio(&self) -> Result<(), ToolError> {
        self.app.pool.start_idle_sweep()?;
        let mut reader = BufReader::new(tokio::io::stdin()).lines();
        let mut writer = BufWriter::new(tokio::io::stdout());

        while let Some(line) = reader.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let response = self.handle_line(trimmed).await;
            let payload = serde_json::to_string(&response).unwrap_or_default();
            writer.write_all(payload.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        let closed = self.app.pool.shutdown().await;
        self.app.logger.info(
            "stdin closed; pool shut down",
            Some(&serde_json::json!({ "sessions_closed": closed })),
        );
        Ok(())
    }
}

fn failure(id: Value, err: ToolError) -> Value {
    let mut payload = serde_json::json!({ "ok": false, "error": err });
    if !id.is_null() {
        payload["id"] = id;
    }
    payload
}

pub async fn run_stdio() -> Result<(), ToolError> {
    let server = StdioServer::new(App::initialize()?);
    server.run_stdio().await
}

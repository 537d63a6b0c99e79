mod tools;

use std::io::Write;
use std::sync::Arc;

use pulse_domain::config::{LogConfig, StoreConfig};
use pulse_protocol::{JsonRpcRequest, JsonRpcResponse};
use pulse_queue::Queue;
use pulse_store::Store;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::tools::ToolContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_config = LogConfig::from_env();
    let filter = EnvFilter::try_new(&log_config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let store_config = StoreConfig::from_env();
    let store = Arc::new(Store::open(&store_config.db_path)?);
    let queue = Arc::new(Queue::new(store));
    let host_session_id = std::env::var("PULSE_HOST_SESSION_ID").ok();
    let ctx = ToolContext { queue, host_session_id };

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let stdout = std::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, "skipping malformed JSON-RPC line");
                continue;
            }
        };

        let response = match tools::dispatch(&ctx, &request.method, request.params).await {
            Ok(text) => JsonRpcResponse::success(request.id, serde_json::json!(text)),
            Err(e) => {
                warn!(method = %request.method, error = %e, "tool call failed");
                JsonRpcResponse::failure(request.id, e)
            }
        };

        let mut handle = stdout.lock();
        writeln!(handle, "{}", serde_json::to_string(&response)?)?;
        handle.flush()?;
    }

    Ok(())
}

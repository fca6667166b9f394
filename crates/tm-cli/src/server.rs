use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use tokio::sync::Mutex;

use crate::service::{
    CheckpointRequest, ForwardRequest, InitRequest, ManifoldRequest, Service, TrainRequest,
    TrainSequenceRequest,
};
use crate::session::SessionError;

#[derive(Clone)]
pub struct TitanServer {
    state: Arc<Mutex<Service>>,
    tool_router: ToolRouter<Self>,
}

impl TitanServer {
    pub fn new(service: Service) -> Self {
        Self {
            state: Arc::new(Mutex::new(service)),
            tool_router: Self::tool_router(),
        }
    }
}

fn to_mcp_error(e: SessionError) -> McpError {
    if e.is_client_error() {
        McpError::invalid_params(e.to_string(), None)
    } else {
        tracing::error!("tool failed: {e}");
        McpError::internal_error(e.to_string(), None)
    }
}

fn json_result(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(&value).unwrap_or_default(),
    )]))
}

#[tool_router]
impl TitanServer {
    #[tool(
        description = "Initialize (or re-initialize) the memory model. Optional `config` overrides any of inputDim, hiddenDim, outputDim, learningRate, useManifold, momentumFactor, forgetGateInit, maxStepSize, tangentEpsilon, numHeads, numLayers, memoryBankPolicy. Discards the current model and memory."
    )]
    async fn init_model(
        &self,
        Parameters(req): Parameters<InitRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut state = self.state.lock().await;
        json_result(state.init(req).map_err(to_mcp_error)?)
    }

    #[tool(
        description = "Run one forward pass on input vector `x`. Returns the predicted next input, the new memory vector and the surprise score. The session memory is replaced by the new memory."
    )]
    async fn forward_pass(
        &self,
        Parameters(req): Parameters<ForwardRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut state = self.state.lock().await;
        json_result(state.forward(req).map_err(to_mcp_error)?)
    }

    #[tool(
        description = "One training step: learn to predict `x_next` from `x_t` and the current memory. Returns the cost computed before the update."
    )]
    async fn train_step(
        &self,
        Parameters(req): Parameters<TrainRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut state = self.state.lock().await;
        json_result(state.train(req).map_err(to_mcp_error)?)
    }

    #[tool(
        description = "Train over a whole sequence of input vectors, one step per consecutive pair, threading memory through. Returns per-step costs and their mean."
    )]
    async fn train_sequence(
        &self,
        Parameters(req): Parameters<TrainSequenceRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut state = self.state.lock().await;
        json_result(state.train_sequence(req).map_err(to_mcp_error)?)
    }

    #[tool(
        description = "Move `base` by `velocity`. With useManifold the step follows a great circle on the unit sphere, clamped to maxStepSize radians; otherwise it is plain addition."
    )]
    async fn manifold_step(
        &self,
        Parameters(req): Parameters<ManifoldRequest>,
    ) -> Result<CallToolResult, McpError> {
        let state = self.state.lock().await;
        json_result(state.manifold(req).map_err(to_mcp_error)?)
    }

    #[tool(
        description = "Current session memory vector, step counters, surprise statistics and the hierarchical memory bank."
    )]
    async fn get_memory_state(&self) -> Result<CallToolResult, McpError> {
        let state = self.state.lock().await;
        json_result(state.memory_state())
    }

    #[tool(description = "The live model configuration.")]
    async fn get_config(&self) -> Result<CallToolResult, McpError> {
        let state = self.state.lock().await;
        json_result(state.config())
    }

    #[tool(description = "Zero the session memory and the hierarchical memory bank. Weights are kept.")]
    async fn reset_memory(&self) -> Result<CallToolResult, McpError> {
        let mut state = self.state.lock().await;
        json_result(state.reset())
    }

    #[tool(
        description = "Save the model. Give `path` for a JSON file, or `name` for a checkpoint in the data directory (the session memory is saved with it)."
    )]
    async fn save_model(
        &self,
        Parameters(req): Parameters<CheckpointRequest>,
    ) -> Result<CallToolResult, McpError> {
        let state = self.state.lock().await;
        json_result(state.save(req).map_err(to_mcp_error)?)
    }

    #[tool(
        description = "Load model weights from a JSON file (`path`) or a named checkpoint (`name`). Shapes must match the live configuration."
    )]
    async fn load_model(
        &self,
        Parameters(req): Parameters<CheckpointRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut state = self.state.lock().await;
        json_result(state.load(req).map_err(to_mcp_error)?)
    }

    #[tool(description = "List named checkpoints in the data directory.")]
    async fn list_checkpoints(&self) -> Result<CallToolResult, McpError> {
        let state = self.state.lock().await;
        json_result(state.checkpoints().map_err(to_mcp_error)?)
    }
}

#[tool_handler]
impl ServerHandler for TitanServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Titan sequence memory. A small neural model predicts the next vector of a \
                 stream from the current vector and a memory state, and reports how surprising \
                 each input was.\n\n\
                 Typical use: init_model once, then forward_pass or train_step per input. \
                 The server keeps the memory vector between calls. Use train_sequence for \
                 batches, get_memory_state to inspect, save_model/load_model to persist."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use tempfile::TempDir;
    use tm_core::ModelConfig;

    fn make_server(dir: &TempDir) -> TitanServer {
        let service = Service::with_rng(
            ModelConfig::with_dims(4, 8, 4),
            dir.path().join("titan.db"),
            SmallRng::seed_from_u64(42),
        )
        .unwrap();
        TitanServer::new(service)
    }

    fn text_from_result(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    fn parse_result(result: &CallToolResult) -> serde_json::Value {
        let text = text_from_result(result);
        serde_json::from_str(&text).expect("handler should return valid JSON")
    }

    #[tokio::test]
    async fn test_get_config_wire_names() {
        let dir = TempDir::new().unwrap();
        let server = make_server(&dir);
        let json = parse_result(&server.get_config().await.unwrap());
        assert_eq!(json["inputDim"], 4);
        assert_eq!(json["outputDim"], 4);
        assert!(json.get("memoryDim").is_none());
    }

    #[tokio::test]
    async fn test_forward_pass_updates_memory() {
        let dir = TempDir::new().unwrap();
        let server = make_server(&dir);

        let result = server
            .forward_pass(Parameters(ForwardRequest {
                x: vec![1.0, 0.0, 0.0, 0.0],
                memory: None,
            }))
            .await
            .unwrap();
        let json = parse_result(&result);
        assert_eq!(json["predicted"].as_array().unwrap().len(), 4);
        assert!(json["surprise"].as_f64().unwrap() >= 0.0);

        let state = parse_result(&server.get_memory_state().await.unwrap());
        assert_eq!(state["memory"], json["newMemory"]);
        assert_eq!(state["memoryBank"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_forward_pass_bad_shape_is_invalid_params() {
        let dir = TempDir::new().unwrap();
        let server = make_server(&dir);
        let err = server
            .forward_pass(Parameters(ForwardRequest {
                x: vec![1.0],
                memory: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
        assert!(err.message.contains("shape mismatch"));
    }

    #[tokio::test]
    async fn test_train_step_counts() {
        let dir = TempDir::new().unwrap();
        let server = make_server(&dir);
        for i in 1..=3 {
            let result = server
                .train_step(Parameters(TrainRequest {
                    x_t: vec![1.0, 0.0, 0.0, 0.0],
                    x_next: vec![1.0, 0.0, 0.0, 0.0],
                    memory: None,
                }))
                .await
                .unwrap();
            let json = parse_result(&result);
            assert_eq!(json["steps"], i);
            assert!(json["cost"].as_f64().unwrap().is_finite());
        }
    }

    #[tokio::test]
    async fn test_train_sequence_tool() {
        let dir = TempDir::new().unwrap();
        let server = make_server(&dir);
        let result = server
            .train_sequence(Parameters(TrainSequenceRequest {
                sequence: vec![vec![0.0, 0.0, 0.0, 1.0]; 5],
            }))
            .await
            .unwrap();
        let json = parse_result(&result);
        assert_eq!(json["costs"].as_array().unwrap().len(), 4);
        assert_eq!(json["steps"], 4);
    }

    #[tokio::test]
    async fn test_init_model_resets_session() {
        let dir = TempDir::new().unwrap();
        let server = make_server(&dir);
        server
            .forward_pass(Parameters(ForwardRequest {
                x: vec![1.0, 1.0, 1.0, 1.0],
                memory: None,
            }))
            .await
            .unwrap();

        let result = server
            .init_model(Parameters(InitRequest {
                config: Some(serde_json::json!({ "outputDim": 6, "numLayers": 1 })),
            }))
            .await
            .unwrap();
        assert_eq!(parse_result(&result)["config"]["outputDim"], 6);

        let state = parse_result(&server.get_memory_state().await.unwrap());
        assert_eq!(state["memory"], serde_json::json!(vec![0.0; 6]));
        assert_eq!(state["memoryBank"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_manifold_step_flat() {
        let dir = TempDir::new().unwrap();
        let server = make_server(&dir);
        let result = server
            .manifold_step(Parameters(ManifoldRequest {
                base: vec![1.0, 2.0],
                velocity: vec![0.5, 0.5],
            }))
            .await
            .unwrap();
        let json = parse_result(&result);
        assert_eq!(json["result"], serde_json::json!([1.5, 2.5]));
        assert_eq!(json["useManifold"], false);
    }

    #[tokio::test]
    async fn test_reset_memory_tool() {
        let dir = TempDir::new().unwrap();
        let server = make_server(&dir);
        server
            .forward_pass(Parameters(ForwardRequest {
                x: vec![1.0, 1.0, 1.0, 1.0],
                memory: Some(vec![1.0, 1.0, 1.0, 1.0]),
            }))
            .await
            .unwrap();
        let json = parse_result(&server.reset_memory().await.unwrap());
        assert_eq!(json["memory"], serde_json::json!([0.0, 0.0, 0.0, 0.0]));
    }

    #[tokio::test]
    async fn test_save_load_named_roundtrip() {
        let dir = TempDir::new().unwrap();
        let server = make_server(&dir);
        let saved = server
            .save_model(Parameters(CheckpointRequest {
                path: None,
                name: Some("first".to_string()),
            }))
            .await
            .unwrap();
        assert_eq!(parse_result(&saved)["kind"], "store");

        let list = parse_result(&server.list_checkpoints().await.unwrap());
        assert_eq!(list["checkpoints"].as_array().unwrap().len(), 1);

        let loaded = server
            .load_model(Parameters(CheckpointRequest {
                path: None,
                name: Some("first".to_string()),
            }))
            .await
            .unwrap();
        assert_eq!(parse_result(&loaded)["sessionRestored"], true);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_internal_error() {
        let dir = TempDir::new().unwrap();
        let server = make_server(&dir);
        let err = server
            .load_model(Parameters(CheckpointRequest {
                path: Some(dir.path().join("nope.json").display().to_string()),
                name: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);
    }
}

//! Integration tests against a real `llama-server` binary and model.
//!
//! Run with:
//! VLM_WORKER_TEST_SERVER=/path/to/llama-server VLM_WORKER_TEST_MODEL=/path/to/model.gguf \
//!     cargo test --test llama_server_integration -- --ignored

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vlm_worker::llm::{CallProfile, Conversation, LlamaServerClient, RetryingGenerator};
use vlm_worker::registry::ModelFiles;
use vlm_worker::server::{ServerConfig, ServerManager};
use vlm_worker::ServerError;

fn env_path(name: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| panic!("{name} must be set for integration tests"))
}

fn manager() -> ServerManager {
    let config = ServerConfig::new(env_path("VLM_WORKER_TEST_SERVER"))
        .with_address("127.0.0.1", 18080)
        .with_readiness(
            Duration::from_secs(2),
            Duration::from_secs(1),
            Duration::from_secs(300),
        );
    ServerManager::new(config).expect("Should build manager")
}

fn files() -> ModelFiles {
    ModelFiles {
        language: env_path("VLM_WORKER_TEST_MODEL"),
        vision: std::env::var("VLM_WORKER_TEST_MMPROJ").ok().map(PathBuf::from),
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llama_server_integration -- --ignored
async fn test_text_generation_round_trip() {
    let manager = manager();

    let text = manager
        .with_server(&files(), |endpoint| async move {
            let client = LlamaServerClient::new(endpoint.base_url())
                .map_err(|e| ServerError::HttpClient(e.to_string()))?;
            let generator = RetryingGenerator::new(Arc::new(client));
            let conversation = Conversation::new().user("What is 2 + 2? Reply with just the number.");
            let generation = generator
                .generate(&conversation, &CallProfile::text_only())
                .await
                .map_err(|e| ServerError::HttpClient(e.to_string()))?;
            Ok::<_, ServerError>(generation.text)
        })
        .await
        .expect("Generation should succeed");

    assert!(text.contains('4'), "Response should contain '4', got: {}", text);
    assert!(!manager.is_active(), "Server should be stopped afterwards");
}

#[tokio::test]
#[ignore]
async fn test_server_can_be_restarted() {
    let manager = manager();

    for _ in 0..2 {
        let mut handle = manager.start(&files()).expect("Should spawn");
        assert!(
            manager.wait_until_ready(&mut handle, Duration::from_secs(300)).await,
            "Server should become ready"
        );
        manager.stop(handle).await.expect("Should stop");
    }
    assert!(!manager.is_active());
}

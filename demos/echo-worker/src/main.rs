use rpc_core::service::{Handler, HandlerFn};
use rpc_core::{Config, ConnectionManager, Service};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

struct EchoHandler;

#[async_trait::async_trait]
impl Handler for EchoHandler {
    fn methods(&self) -> HashMap<String, HandlerFn> {
        let mut m: HashMap<String, HandlerFn> = HashMap::new();
        m.insert(
            "echo".to_string(),
            Arc::new(|_ctx, args: Map<String, Value>| {
                Box::pin(async move { Ok(args.get("value").cloned().unwrap_or(Value::Null)) })
            }),
        );
        m
    }

    async fn periodic_tasks(&self) {
        log::debug!("echo-worker: periodic tick");
    }

    async fn report_state(&self) {
        log::debug!("echo-worker: reporting state");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from_env()?;
    let manager = Arc::new(ConnectionManager::new(config));

    let mut service = Service::create(
        hostname(),
        "echo-worker".into(),
        "echo".into(),
        Arc::new(EchoHandler),
        manager,
        None,
        None,
    );

    service.start().await?;
    log::info!("echo-worker started, listening on topic 'echo'");

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down echo-worker");

    service.stop().await;
    service.wait().await;
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
}

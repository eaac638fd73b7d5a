// demos/rpc_demo.rs
//
//   cargo run --example rpc_demo -- server    # answer calculations
//   cargo run --example rpc_demo -- client    # call the server
//   cargo run --example rpc_demo -- publish   # fire-and-forget
//   cargo run --example rpc_demo -- local     # both sides on an in-memory broker
//
// The broker URL comes from AMQP_ADDR (or .env).
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rabbit_rpc::{
    broker_url_from_env, create_connection, create_queue, subscribe, AmqpChannel, Delivery,
    HandlerResult, MemoryBroker, RpcClient, RpcConfig,
};

const QUEUE: &str = "calculations";

#[derive(Debug, Serialize, Deserialize)]
struct CalculationRequest {
    operation: String,
    values: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CalculationResponse {
    result: f64,
}

fn calculate(delivery: &Delivery) -> HandlerResult {
    let request: CalculationRequest = serde_json::from_slice(delivery.body())?;

    let result: f64 = match request.operation.as_str() {
        "add" => request.values.iter().sum(),
        "multiply" => request.values.iter().product(),
        other => bail!("unknown operation '{}'", other),
    };
    info!(operation = %request.operation, result, "Calculated");

    Ok(Some(serde_json::to_vec(&CalculationResponse { result })?))
}

async fn serve<C: AmqpChannel>(channel: &C) -> Result<()> {
    let queue = create_queue(channel, QUEUE).await?;
    subscribe(channel, &queue, calculate).await?;
    Ok(())
}

async fn run_server() -> Result<()> {
    let (channel, release) = create_connection(&broker_url_from_env()).await?;

    info!("RPC server started. Press Ctrl+C to exit.");
    tokio::select! {
        result = serve(&channel) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    release.release().await;
    Ok(())
}

async fn ask<C: AmqpChannel>(
    client: &RpcClient,
    channel: &C,
    operation: &str,
    values: Vec<f64>,
) -> Result<f64> {
    let request = CalculationRequest {
        operation: operation.to_string(),
        values,
    };
    let reply = client
        .call_with_conn(channel, QUEUE, serde_json::to_vec(&request)?)
        .await?;
    let response: CalculationResponse = serde_json::from_slice(&reply)?;
    Ok(response.result)
}

async fn run_client() -> Result<()> {
    let client = RpcClient::new(RpcConfig::from_env()?);
    let (channel, release) = create_connection(&broker_url_from_env()).await?;

    let outcome = async {
        let sum = ask(&client, &channel, "add", vec![1.5, 2.5, 3.5]).await?;
        println!("Addition result: {}", sum);
        let product = ask(&client, &channel, "multiply", vec![2.0, 3.0, 4.0]).await?;
        println!("Multiplication result: {}", product);
        Ok::<_, anyhow::Error>(())
    }
    .await;

    release.release().await;
    outcome
}

async fn run_publish() -> Result<()> {
    let client = RpcClient::new(RpcConfig::from_env()?);
    let request = CalculationRequest {
        operation: "add".to_string(),
        values: vec![40.0, 2.0],
    };

    client
        .publish(&broker_url_from_env(), QUEUE, serde_json::to_vec(&request)?)
        .await?;
    println!("Published request without reply address");
    Ok(())
}

async fn run_local() -> Result<()> {
    let broker = MemoryBroker::new();
    let server_channel = broker.create_channel();
    let client_channel = broker.create_channel();

    create_queue(&server_channel, QUEUE).await?;
    let server = tokio::spawn(async move { serve(&server_channel).await });

    let client = RpcClient::new(RpcConfig::default());
    let sum = ask(&client, &client_channel, "add", vec![1.5, 2.5, 3.5]).await?;
    println!("Addition result: {}", sum);
    let product = ask(&client, &client_channel, "multiply", vec![2.0, 3.0, 4.0]).await?;
    println!("Multiplication result: {}", product);

    server.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("server") => run_server().await,
        Some("client") => run_client().await,
        Some("publish") => run_publish().await,
        Some("local") => run_local().await,
        _ => {
            println!("Usage: {} [server|client|publish|local]", args[0]);
            Ok(())
        }
    }
}

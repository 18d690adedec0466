use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use trytune::tcp::TcpBackendClient;
use trytune::{
    BackendEndpoint, Engine, EngineConfig, PipelineDefinition, PreferInstanceType, RoundRobin,
    Tensor, TensorMap,
};

#[derive(Parser)]
#[command(name = "run-pipeline", about = "Register vision backends and run detect_crop")]
struct Args {
    /// Backend as `instance_type=host:port`, or just `host:port`. Repeatable.
    #[arg(long = "backend", required = true)]
    backends: Vec<String>,

    /// Pipeline definition JSON.
    #[arg(long, default_value = "pipeline.json")]
    pipeline: String,

    /// Engine configuration JSON. Defaults apply when omitted.
    #[arg(long)]
    config: Option<String>,

    /// Prefer backends of this instance type.
    #[arg(long)]
    hint: Option<String>,

    /// Number of concurrent invocations.
    #[arg(long, default_value = "4")]
    requests: usize,

    /// Input image side length.
    #[arg(long, default_value = "32")]
    size: usize,
}

fn parse_backend(spec: &str) -> BackendEndpoint {
    match spec.split_once('=') {
        Some((instance_type, address)) => BackendEndpoint::new(instance_type, address),
        None => BackendEndpoint::new("default", spec),
    }
}

/// Gradient image: the lower-right quadrant is the brightest.
fn make_image(size: usize) -> Tensor {
    let mut values = Vec::with_capacity(3 * size * size);
    for _ in 0..3 {
        for y in 0..size {
            for x in 0..size {
                values.push((x + y) as f32 / (2 * size) as f32);
            }
        }
    }
    Tensor::from_f32(vec![1, 3, size, size], &values)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_json(
            &std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
        )?,
        None => EngineConfig::default(),
    };
    let definition = PipelineDefinition::from_json(
        &std::fs::read_to_string(&args.pipeline)
            .with_context(|| format!("reading {}", args.pipeline))?,
    )?;

    let engine = Arc::new(Engine::with_policy(
        config,
        Arc::new(TcpBackendClient::default()),
        Arc::new(PreferInstanceType::new(RoundRobin::new())),
    ));

    let backends: Vec<BackendEndpoint> = args.backends.iter().map(|b| parse_backend(b)).collect();
    for module in ["detection_module", "crop_module"] {
        let record = engine.register_module(module, backends.clone()).await?;
        info!(
            module,
            backends = record.backends.len(),
            inputs = record.signature.inputs.len(),
            outputs = record.signature.outputs.len(),
            "module registered"
        );
    }

    let graph = engine.build_pipeline(&definition)?;
    info!(pipeline = %graph.name(), stages = graph.stages().len(), "pipeline ready");

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.requests);
    for _ in 0..args.requests {
        let engine = engine.clone();
        let name = graph.name().to_string();
        let hint = args.hint.clone();
        let inputs = TensorMap::from([("p_image".to_string(), make_image(args.size))]);
        handles.push(tokio::spawn(async move {
            match hint {
                Some(hint) => engine.execute_with_hint(&name, inputs, &hint).await,
                None => engine.execute(&name, inputs).await,
            }
        }));
    }

    for handle in handles {
        let result = handle.await??;
        for (name, tensor) in &result.outputs {
            info!(
                invocation_id = result.invocation_id,
                tensor = %name,
                datatype = %tensor.datatype,
                shape = ?tensor.shape,
                "output"
            );
        }
    }
    info!(
        requests = args.requests,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all invocations complete"
    );

    engine.remove_pipeline(graph.name())?;
    for module in engine.module_names() {
        engine.remove_module(&module)?;
    }
    Ok(())
}

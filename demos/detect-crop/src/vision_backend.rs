use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing::info;

use trytune::tcp::{serve_backend, ModelHandler};
use trytune::{DataType, ModuleSignature, Tensor, TensorMap, TensorSpec};

/// Side length of every crop returned by `crop_module`.
const CROP_SIZE: usize = 8;

/// Toy vision models: a quadrant "detector" scored by mean brightness and a
/// nearest-neighbour cropper.
struct VisionModels {
    instance_type: String,
    score_threshold: f32,
}

fn detection_signature() -> ModuleSignature {
    ModuleSignature {
        inputs: vec![TensorSpec::new("BATCH_IMAGE", DataType::Fp32, &[1, 3, -1, -1])],
        outputs: vec![
            TensorSpec::new("BOXES", DataType::Fp32, &[-1, 4]),
            TensorSpec::new("LABELS", DataType::Int64, &[-1]),
            TensorSpec::new("SCORES", DataType::Fp32, &[-1]),
        ],
    }
}

fn crop_signature() -> ModuleSignature {
    let c = CROP_SIZE as i64;
    ModuleSignature {
        inputs: vec![
            TensorSpec::new("IMAGE", DataType::Fp32, &[1, 3, -1, -1]),
            TensorSpec::new("BOXES", DataType::Fp32, &[-1, 4]),
            TensorSpec::new("LABELS", DataType::Int64, &[-1]),
            TensorSpec::new("SCORES", DataType::Fp32, &[-1]),
        ],
        outputs: vec![
            TensorSpec::new("CROPPED_IMAGES", DataType::Fp32, &[-1, 3, c, c]),
            TensorSpec::new("WHS", DataType::Int64, &[-1, 2]),
        ],
    }
}

fn f32s(tensor: &Tensor) -> Vec<f32> {
    tensor
        .data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn int64(shape: Vec<usize>, values: &[i64]) -> Tensor {
    let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    Tensor::new(DataType::Int64, shape, data)
}

fn input<'a>(inputs: &'a TensorMap, name: &str) -> Result<&'a Tensor, String> {
    inputs.get(name).ok_or_else(|| format!("missing input {name}"))
}

fn detect(inputs: &TensorMap) -> Result<TensorMap, String> {
    let image = input(inputs, "BATCH_IMAGE")?;
    let (h, w) = (image.shape[2], image.shape[3]);
    let pixels = f32s(image);
    let (hh, hw) = (h / 2, w / 2);

    let mut boxes = Vec::new();
    let mut scores = Vec::new();
    let mut labels = Vec::new();
    for (label, (y0, x0)) in [(0, 0), (0, hw), (hh, 0), (hh, hw)].into_iter().enumerate() {
        let mut sum = 0.0;
        let mut n = 0usize;
        for ch in 0..3 {
            for y in y0..(y0 + hh) {
                for x in x0..(x0 + hw) {
                    sum += pixels[ch * h * w + y * w + x];
                    n += 1;
                }
            }
        }
        boxes.extend([x0 as f32, y0 as f32, (x0 + hw) as f32, (y0 + hh) as f32]);
        scores.push(if n == 0 { 0.0 } else { sum / n as f32 });
        labels.push(label as i64);
    }

    let count = scores.len();
    Ok(TensorMap::from([
        ("BOXES".to_string(), Tensor::from_f32(vec![count, 4], &boxes)),
        ("LABELS".to_string(), int64(vec![count], &labels)),
        ("SCORES".to_string(), Tensor::from_f32(vec![count], &scores)),
    ]))
}

fn crop(inputs: &TensorMap, threshold: f32) -> Result<TensorMap, String> {
    let image = input(inputs, "IMAGE")?;
    let (h, w) = (image.shape[2], image.shape[3]);
    let pixels = f32s(image);
    let boxes = f32s(input(inputs, "BOXES")?);
    let scores = f32s(input(inputs, "SCORES")?);

    let mut crops = Vec::new();
    let mut whs = Vec::new();
    for (b, score) in boxes.chunks_exact(4).zip(&scores) {
        if *score <= threshold {
            continue;
        }
        let (x0, y0) = (b[0] as usize, b[1] as usize);
        let bw = (b[2] - b[0]).max(1.0) as usize;
        let bh = (b[3] - b[1]).max(1.0) as usize;
        for ch in 0..3 {
            for cy in 0..CROP_SIZE {
                for cx in 0..CROP_SIZE {
                    let y = (y0 + cy * bh / CROP_SIZE).min(h - 1);
                    let x = (x0 + cx * bw / CROP_SIZE).min(w - 1);
                    crops.push(pixels[ch * h * w + y * w + x]);
                }
            }
        }
        whs.extend([bw as i64, bh as i64]);
    }

    let kept = whs.len() / 2;
    Ok(TensorMap::from([
        (
            "CROPPED_IMAGES".to_string(),
            Tensor::from_f32(vec![kept, 3, CROP_SIZE, CROP_SIZE], &crops),
        ),
        ("WHS".to_string(), int64(vec![kept, 2], &whs)),
    ]))
}

#[async_trait]
impl ModelHandler for VisionModels {
    fn signature(&self, model: &str) -> Option<ModuleSignature> {
        match model {
            "detection_module" => Some(detection_signature()),
            "crop_module" => Some(crop_signature()),
            _ => None,
        }
    }

    async fn infer(&self, model: &str, inputs: TensorMap) -> Result<TensorMap, String> {
        info!(instance_type = %self.instance_type, model, "inference");
        match model {
            "detection_module" => detect(&inputs),
            "crop_module" => crop(&inputs, self.score_threshold),
            other => Err(format!("model {other} is not served here")),
        }
    }
}

#[derive(Parser)]
#[command(name = "vision-backend", about = "Serves detection_module and crop_module over TCP")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8001")]
    listen: String,

    /// Instance type reported in logs.
    #[arg(long, default_value = "g4dn.xlarge")]
    instance_type: String,

    /// Detections at or below this score are not cropped.
    #[arg(long, default_value = "0.5")]
    score_threshold: f32,
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
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(
        addr = %listener.local_addr()?,
        instance_type = %args.instance_type,
        "starting vision backend"
    );

    let models = Arc::new(VisionModels {
        instance_type: args.instance_type,
        score_threshold: args.score_threshold,
    });
    serve_backend(listener, models).await?;
    Ok(())
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use trytune::{
    DataType, DispatchError, Engine, EngineConfig, ExecuteError, ModuleSignature,
    PipelineDefinition, PipelineError, Tensor, TensorMap, TensorSpec,
};

use common::{
    crop, crop_signature, detect, detection_signature, endpoint, image, Behaviour, MockCluster,
};

async fn detect_crop_engine(cluster: &Arc<MockCluster>, config: EngineConfig) -> Engine {
    cluster.serve("10.0.0.1:8001", "detection_module", detection_signature(), detect);
    cluster.serve("10.0.0.2:8001", "crop_module", crop_signature(), crop);
    let engine = Engine::new(config, cluster.clone());
    engine
        .register_module("detection_module", vec![endpoint("10.0.0.1:8001")])
        .await
        .unwrap();
    engine
        .register_module("crop_module", vec![endpoint("10.0.0.2:8001")])
        .await
        .unwrap();
    let def = PipelineDefinition::new("test_pipeline", &["p_image"], &["p_cropped_images", "p_whs"])
        .stage(
            "detector",
            "detection_module",
            &[("BATCH_IMAGE", "p_image")],
            &[("BOXES", "p_boxes"), ("LABELS", "p_labels"), ("SCORES", "p_scores")],
        )
        .stage(
            "cropper",
            "crop_module",
            &[
                ("IMAGE", "p_image"),
                ("BOXES", "p_boxes"),
                ("LABELS", "p_labels"),
                ("SCORES", "p_scores"),
            ],
            &[("CROPPED_IMAGES", "p_cropped_images"), ("WHS", "p_whs")],
        );
    engine.build_pipeline(&def).unwrap();
    engine
}

fn image_input() -> TensorMap {
    TensorMap::from([("p_image".to_string(), image())])
}

#[tokio::test]
async fn detect_then_crop_returns_exactly_the_declared_outputs() {
    let cluster = MockCluster::new();
    let engine = detect_crop_engine(&cluster, EngineConfig::default()).await;

    let result = engine.execute("test_pipeline", image_input()).await.unwrap();

    let names: Vec<&str> = result.outputs.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["p_cropped_images", "p_whs"]);
    // Only the 0.95 detection clears the crop threshold.
    assert_eq!(result.outputs["p_cropped_images"].shape, vec![1, 3, 2, 2]);
    assert_eq!(result.outputs["p_whs"].shape, vec![1, 2]);
    assert_eq!(result.outputs["p_whs"].datatype, DataType::Int64);

    let modules: Vec<String> = cluster.calls().into_iter().map(|(_, m)| m).collect();
    assert_eq!(modules, vec!["detection_module", "crop_module"]);
}

#[tokio::test]
async fn single_stage_pipeline_round_trips() {
    let cluster = MockCluster::new();
    let double = ModuleSignature {
        inputs: vec![TensorSpec::new("X", DataType::Fp32, &[-1])],
        outputs: vec![TensorSpec::new("Y", DataType::Fp32, &[-1])],
    };
    cluster.serve("10.0.0.1:8001", "double", double, |inputs| {
        let x = &inputs["X"];
        let doubled: Vec<f32> = x
            .data
            .chunks_exact(4)
            .map(|c| 2.0 * f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        TensorMap::from([("Y".to_string(), Tensor::from_f32(x.shape.clone(), &doubled))])
    });
    let engine = Engine::new(EngineConfig::default(), cluster.clone());
    engine
        .register_module("double", vec![endpoint("10.0.0.1:8001")])
        .await
        .unwrap();
    engine
        .build_pipeline(
            &PipelineDefinition::new("twice", &["in"], &["out"]).stage(
                "d",
                "double",
                &[("X", "in")],
                &[("Y", "out")],
            ),
        )
        .unwrap();

    let inputs = TensorMap::from([("in".to_string(), Tensor::from_f32(vec![3], &[1.0, 2.0, 3.0]))]);
    let result = engine.execute("twice", inputs).await.unwrap();
    assert_eq!(
        result.outputs["out"],
        Tensor::from_f32(vec![3], &[2.0, 4.0, 6.0])
    );
}

#[tokio::test]
async fn inputs_must_match_the_declaration() {
    let cluster = MockCluster::new();
    let engine = detect_crop_engine(&cluster, EngineConfig::default()).await;

    match engine.execute("test_pipeline", TensorMap::new()).await.unwrap_err() {
        PipelineError::Execute(ExecuteError::MissingInput { pipeline, missing }) => {
            assert_eq!(pipeline, "test_pipeline");
            assert_eq!(missing, vec!["p_image".to_string()]);
        }
        other => panic!("expected MissingInput, got {other:?}"),
    }

    let mut inputs = image_input();
    inputs.insert("p_extra".into(), image());
    match engine.execute("test_pipeline", inputs).await.unwrap_err() {
        PipelineError::Execute(ExecuteError::UnexpectedInput { unexpected, .. }) => {
            assert_eq!(unexpected, vec!["p_extra".to_string()]);
        }
        other => panic!("expected UnexpectedInput, got {other:?}"),
    }
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn unknown_pipeline_is_reported() {
    let cluster = MockCluster::new();
    let engine = Engine::new(EngineConfig::default(), cluster.clone());
    assert!(matches!(
        engine.execute("nope", image_input()).await,
        Err(PipelineError::Execute(ExecuteError::UnknownPipeline(ref p))) if p == "nope"
    ));
}

#[tokio::test]
async fn failing_stage_fails_the_invocation_and_is_named() {
    let cluster = MockCluster::new();
    let engine = detect_crop_engine(&cluster, EngineConfig::default()).await;
    cluster.set_behaviour(
        "10.0.0.2:8001",
        "crop_module",
        Behaviour::Reject("out of memory".into()),
    );

    match engine.execute("test_pipeline", image_input()).await.unwrap_err() {
        PipelineError::Execute(ExecuteError::StageFailed {
            pipeline,
            stage,
            source,
        }) => {
            assert_eq!(pipeline, "test_pipeline");
            assert_eq!(stage, "cropper");
            assert!(matches!(
                source,
                DispatchError::BackendInvocationError { ref address, .. } if address == "10.0.0.2:8001"
            ));
        }
        other => panic!("expected StageFailed, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn hung_backend_hits_the_invocation_budget() {
    let cluster = MockCluster::new();
    let mut config = EngineConfig::default();
    config.executor.invocation_timeout = Duration::from_millis(500);
    let engine = detect_crop_engine(&cluster, config).await;
    cluster.set_behaviour("10.0.0.2:8001", "crop_module", Behaviour::Hang);

    let started = tokio::time::Instant::now();
    match engine.execute("test_pipeline", image_input()).await.unwrap_err() {
        PipelineError::Execute(ExecuteError::PipelineTimeout {
            pipeline, budget, ..
        }) => {
            assert_eq!(pipeline, "test_pipeline");
            assert_eq!(budget, Duration::from_millis(500));
        }
        other => panic!("expected PipelineTimeout, got {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");

    // The hung call is cancelled, releasing its in-flight slot.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.dispatcher().in_flight("10.0.0.2:8001"), 0);
    assert_eq!(cluster.calls_to("10.0.0.2:8001"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_stage_lets_siblings_finish_and_drops_their_results() {
    let cluster = MockCluster::new();
    let identity = ModuleSignature {
        inputs: vec![TensorSpec::new("X", DataType::Fp32, &[-1])],
        outputs: vec![TensorSpec::new("Y", DataType::Fp32, &[-1])],
    };
    let rename = |inputs: &TensorMap| TensorMap::from([("Y".to_string(), inputs["X"].clone())]);
    cluster.serve("10.0.0.1:8001", "slow", identity.clone(), rename);
    cluster.serve_with(
        "10.0.0.2:8001",
        "broken",
        identity,
        Behaviour::Reject("bad weights".into()),
    );
    cluster.set_delay("10.0.0.1:8001", Duration::from_secs(1));

    let engine = Engine::new(EngineConfig::default(), cluster.clone());
    engine.register_module("slow", vec![endpoint("10.0.0.1:8001")]).await.unwrap();
    engine.register_module("broken", vec![endpoint("10.0.0.2:8001")]).await.unwrap();
    engine
        .build_pipeline(
            &PipelineDefinition::new("split", &["x"], &["a", "b"])
                .stage("slow_branch", "slow", &[("X", "x")], &[("Y", "a")])
                .stage("broken_branch", "broken", &[("X", "x")], &[("Y", "b")]),
        )
        .unwrap();

    let started = tokio::time::Instant::now();
    let inputs = TensorMap::from([("x".to_string(), Tensor::from_f32(vec![1], &[7.0]))]);
    match engine.execute("split", inputs).await.unwrap_err() {
        PipelineError::Execute(ExecuteError::StageFailed { stage, .. }) => {
            assert_eq!(stage, "broken_branch");
        }
        other => panic!("expected StageFailed, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1), "waited for the slow branch");
    assert_eq!(engine.dispatcher().in_flight("10.0.0.1:8001"), 1);
    assert!(cluster.completions().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        cluster.completions(),
        vec![("10.0.0.1:8001".to_string(), "slow".to_string())]
    );
    assert_eq!(engine.dispatcher().in_flight("10.0.0.1:8001"), 0);
}

#[tokio::test(start_paused = true)]
async fn independent_stages_run_concurrently() {
    let cluster = MockCluster::new();
    let identity = ModuleSignature {
        inputs: vec![TensorSpec::new("X", DataType::Fp32, &[-1])],
        outputs: vec![TensorSpec::new("Y", DataType::Fp32, &[-1])],
    };
    let rename = |inputs: &TensorMap| TensorMap::from([("Y".to_string(), inputs["X"].clone())]);
    cluster.serve("10.0.0.1:8001", "left", identity.clone(), rename);
    cluster.serve("10.0.0.2:8001", "right", identity, rename);
    cluster.set_delay("10.0.0.1:8001", Duration::from_secs(1));
    cluster.set_delay("10.0.0.2:8001", Duration::from_secs(1));

    let engine = Engine::new(EngineConfig::default(), cluster.clone());
    engine.register_module("left", vec![endpoint("10.0.0.1:8001")]).await.unwrap();
    engine.register_module("right", vec![endpoint("10.0.0.2:8001")]).await.unwrap();
    engine
        .build_pipeline(
            &PipelineDefinition::new("fanout", &["x"], &["a", "b"])
                .stage("l", "left", &[("X", "x")], &[("Y", "a")])
                .stage("r", "right", &[("X", "x")], &[("Y", "b")]),
        )
        .unwrap();

    let started = tokio::time::Instant::now();
    let inputs = TensorMap::from([("x".to_string(), Tensor::from_f32(vec![1], &[7.0]))]);
    let result = engine.execute("fanout", inputs).await.unwrap();
    assert_eq!(result.outputs.len(), 2);
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(1500), "stages ran serially: {elapsed:?}");
}

#[tokio::test]
async fn pipeline_input_passes_through_to_outputs() {
    let cluster = MockCluster::new();
    let engine = detect_crop_engine(&cluster, EngineConfig::default()).await;
    engine
        .build_pipeline(
            &PipelineDefinition::new("with_source", &["p_image"], &["p_image", "p_scores"]).stage(
                "detector",
                "detection_module",
                &[("BATCH_IMAGE", "p_image")],
                &[("SCORES", "p_scores")],
            ),
        )
        .unwrap();

    let result = engine.execute("with_source", image_input()).await.unwrap();
    assert_eq!(result.outputs["p_image"], image());
    assert_eq!(result.outputs["p_scores"].shape, vec![2]);
    assert_eq!(result.outputs.len(), 2);
}

#[tokio::test]
async fn concurrent_invocations_are_isolated() {
    let cluster = MockCluster::new();
    let engine = Arc::new(detect_crop_engine(&cluster, EngineConfig::default()).await);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("test_pipeline", image_input()).await })
        })
        .collect();
    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.outputs.len(), 2);
        ids.insert(result.invocation_id);
    }
    assert_eq!(ids.len(), 8);
    assert_eq!(cluster.calls().len(), 16);
}

#[tokio::test]
async fn backends_added_after_build_receive_traffic() {
    let cluster = MockCluster::new();
    let engine = detect_crop_engine(&cluster, EngineConfig::default()).await;
    cluster.serve("10.0.0.3:8001", "crop_module", crop_signature(), crop);
    engine
        .add_backends("crop_module", vec![endpoint("10.0.0.3:8001")])
        .await
        .unwrap();

    for _ in 0..2 {
        engine.execute("test_pipeline", image_input()).await.unwrap();
    }
    assert_eq!(cluster.calls_to("10.0.0.2:8001"), 1);
    assert_eq!(cluster.calls_to("10.0.0.3:8001"), 1);
}

#[tokio::test]
async fn removed_pipeline_can_no_longer_execute() {
    let cluster = MockCluster::new();
    let engine = detect_crop_engine(&cluster, EngineConfig::default()).await;
    engine.remove_pipeline("test_pipeline").unwrap();
    assert!(matches!(
        engine.execute("test_pipeline", image_input()).await,
        Err(PipelineError::Execute(ExecuteError::UnknownPipeline(_)))
    ));
}

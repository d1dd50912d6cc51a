use std::path::{Path, PathBuf};
use std::sync::Arc;

use netdeploy_backend::engine::{DeployOps, Net, TAG_FLOAT32};
use netdeploy_backend::{BackendError, BackendWrapper, NcnnWrapper, Tensor, TensorMap, TimeCounter};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const CONV_NET: &str = "7767517
5 6
Input            data     0 1 data 0=2 1=2 2=1
Convolution      conv     1 1 data conv 0=2 1=1 5=1 6=2
Split            split    1 2 conv conv_0 conv_1
ReLU             relu     1 1 conv_0 scores
Pooling          gap      1 1 conv_1 pooled 0=1 4=1
";

const SHAPE_NET: &str = "7767517
2 2
Input            data     0 1 data
Shape            shape    1 1 data dims
";

/// Flagged conv weights `[1, -1]` followed by a raw bias `[0, 0.5]`.
fn conv_weights() -> Vec<u8> {
    let mut bytes = TAG_FLOAT32.to_le_bytes().to_vec();
    for v in [1.0f32, -1.0, 0.0, 0.5] {
        bytes.extend(v.to_le_bytes());
    }
    bytes
}

fn write_model(dir: &Path, param: &str, bin: &[u8]) -> (PathBuf, PathBuf) {
    let param_path = dir.join("model.param");
    let bin_path = dir.join("model.bin");
    std::fs::write(&param_path, param).unwrap();
    std::fs::write(&bin_path, bin).unwrap();
    (param_path, bin_path)
}

fn values(t: &Tensor) -> Vec<f32> {
    t.to_f32().iter().cloned().collect()
}

fn two_samples() -> TensorMap {
    let data = Tensor::from_f32(
        vec![1.0, 2.0, 3.0, 4.0, -1.0, 0.0, 0.0, 1.0],
        &[2, 1, 2, 2],
    )
    .unwrap();
    [("data", data)].into_iter().collect()
}

#[test]
fn test_load_and_forward_batch() {
    let dir = TempDir::new().unwrap();
    let (param, bin) = write_model(dir.path(), CONV_NET, &conv_weights());

    let wrapper = NcnnWrapper::load(&param, &bin, None, None).unwrap();
    assert_eq!(wrapper.output_names(), &["scores".to_string(), "pooled".to_string()]);

    let outputs = wrapper.forward(&two_samples()).unwrap();
    assert_eq!(outputs.names().collect::<Vec<_>>(), vec!["scores", "pooled"]);

    let scores = outputs.get("scores").unwrap();
    assert_eq!(scores.shape(), &[2, 2, 2, 2]);
    assert_eq!(
        values(scores),
        vec![
            1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0, // sample 0
            0.0, 0.0, 0.0, 1.0, 1.5, 0.5, 0.5, 0.0, // sample 1
        ]
    );

    let pooled = outputs.get("pooled").unwrap();
    assert_eq!(pooled.shape(), &[2, 2]);
    assert_eq!(values(pooled), vec![2.5, -2.0, 0.0, 0.5]);
}

#[test]
fn test_builder_subset_parallel_and_timing() {
    let dir = TempDir::new().unwrap();
    let (param, bin) = write_model(dir.path(), CONV_NET, &conv_weights());
    let timer = Arc::new(TimeCounter::new(0, 10));

    let wrapper = NcnnWrapper::builder(&param, &bin)
        .output_names(["pooled"])
        .parallel(true)
        .time_counter(timer.clone())
        .build()
        .unwrap();

    let outputs = wrapper.forward(&two_samples()).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(values(outputs.get("pooled").unwrap()), vec![2.5, -2.0, 0.0, 0.5]);
    assert_eq!(timer.summary("ncnn_execute").unwrap().count, 2);
}

#[test]
fn test_unknown_output_fails_with_its_name() {
    let dir = TempDir::new().unwrap();
    let (param, bin) = write_model(dir.path(), CONV_NET, &conv_weights());
    let wrapper = NcnnWrapper::load(
        &param,
        &bin,
        Some(vec!["scores".to_string(), "missing".to_string()]),
        None,
    )
    .unwrap();

    match wrapper.forward(&two_samples()) {
        Err(BackendError::Extraction { name, .. }) => assert_eq!(name, "missing"),
        other => panic!("expected extraction failure, got {:?}", other),
    }
}

#[test]
fn test_custom_layers_registered_before_param() {
    let dir = TempDir::new().unwrap();
    let (param, bin) = write_model(dir.path(), SHAPE_NET, &[]);

    let err = NcnnWrapper::load(&param, &bin, None, None).unwrap_err();
    assert!(matches!(&err, BackendError::ModelLoad(msg) if msg.contains("Shape")));

    let wrapper = NcnnWrapper::load(&param, &bin, None, Some(Box::new(DeployOps))).unwrap();
    let outputs = wrapper.forward(&two_samples()).unwrap();
    let dims = outputs.get("dims").unwrap();
    assert_eq!(dims.shape(), &[2, 4]);
    assert_eq!(values(dims), vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
}

#[test]
fn test_load_failures() {
    let dir = TempDir::new().unwrap();

    let (param, bin) = write_model(dir.path(), "7767518\n0 0\n", &[]);
    assert!(matches!(
        NcnnWrapper::load(&param, &bin, None, None),
        Err(BackendError::ModelLoad(_))
    ));

    let mut long = conv_weights();
    long.extend([0u8; 4]);
    let (param, bin) = write_model(dir.path(), CONV_NET, &long);
    let err = NcnnWrapper::load(&param, &bin, None, None).unwrap_err();
    assert!(err.to_string().contains("trailing"));

    let (param, bin) = write_model(dir.path(), CONV_NET, &conv_weights()[..8]);
    assert!(NcnnWrapper::load(&param, &bin, None, None).is_err());

    let missing = dir.path().join("nope.param");
    assert!(NcnnWrapper::load(&missing, &bin, None, None).is_err());
}

#[test]
fn test_from_loaded_network() {
    let dir = TempDir::new().unwrap();
    let (param, bin) = write_model(dir.path(), CONV_NET, &conv_weights());
    let net = Net::load(&param, &bin).unwrap();
    assert_eq!(net.input_names(), vec!["data".to_string()]);

    let wrapper = NcnnWrapper::from_network(net, None).unwrap();
    assert_eq!(<NcnnWrapper as BackendWrapper>::backend_file_count(), 2);
    assert_eq!(wrapper.network().layer_count(), 5);
}

const RESIZE_NET: &str = "7767517
2 2
Input            data     0 1 data
Interp           up       1 1 data up 0=1 3=4 4=4
";

#[test]
fn test_empty_spatial_sample_is_an_extraction_error() {
    let dir = TempDir::new().unwrap();
    let (param, bin) = write_model(dir.path(), RESIZE_NET, &[]);
    let wrapper = NcnnWrapper::load(&param, &bin, None, None).unwrap();

    let empty = Tensor::from_f32(vec![], &[1, 1, 0, 2]).unwrap();
    let inputs: TensorMap = [("data", empty)].into_iter().collect();

    match wrapper.forward(&inputs) {
        Err(BackendError::Extraction { name, .. }) => assert_eq!(name, "up"),
        other => panic!("expected an extraction error, got {:?}", other),
    }
}

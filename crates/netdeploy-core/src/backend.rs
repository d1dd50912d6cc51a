//! Builds a backend wrapper from a [`BackendConfig`].

use netdeploy_backend::engine::DeployOps;
use netdeploy_backend::{BackendKind, BackendWrapper, NcnnWrapper};
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::{DeployError, Result};

/// Number of artifact files `kind` loads.
pub fn backend_file_count(kind: BackendKind) -> usize {
    kind.file_count()
}

/// Load the configured backend.
///
/// Fails with a configuration error when the artifact count is wrong or the
/// backend was not compiled in.
pub fn create_wrapper(config: &BackendConfig) -> Result<Box<dyn BackendWrapper>> {
    let kind = BackendKind::from(config.kind);
    let expected = backend_file_count(kind);
    if config.files.len() != expected {
        return Err(DeployError::Config(format!(
            "{} expects {} artifact file(s), got {}",
            kind,
            expected,
            config.files.len()
        )));
    }
    debug!("Creating {} wrapper from {:?}", kind, config.files);

    match kind {
        BackendKind::Ncnn => {
            let mut builder = NcnnWrapper::builder(&config.files[0], &config.files[1])
                .parallel(config.parallel);
            if let Some(names) = &config.output_names {
                builder = builder.output_names(names.iter().cloned());
            }
            if config.custom_layers {
                builder = builder.custom_layers(DeployOps);
            }
            Ok(Box::new(builder.build()?))
        }
        BackendKind::OnnxRuntime => create_ort(config),
        BackendKind::Tract => create_tract(config),
    }
}

#[cfg(feature = "onnxruntime")]
fn create_ort(config: &BackendConfig) -> Result<Box<dyn BackendWrapper>> {
    let wrapper = netdeploy_backend::OrtWrapper::load(&config.files[0], config.output_names.clone())?;
    Ok(Box::new(wrapper))
}

#[cfg(not(feature = "onnxruntime"))]
fn create_ort(_config: &BackendConfig) -> Result<Box<dyn BackendWrapper>> {
    Err(DeployError::Config(
        "onnxruntime support not compiled in (enable the `onnxruntime` feature)".to_string(),
    ))
}

#[cfg(feature = "tract")]
fn create_tract(config: &BackendConfig) -> Result<Box<dyn BackendWrapper>> {
    let wrapper = netdeploy_backend::TractWrapper::load(
        &config.files[0],
        &config.input_shape,
        config.output_names.clone(),
    )?;
    Ok(Box::new(wrapper))
}

#[cfg(not(feature = "tract"))]
fn create_tract(_config: &BackendConfig) -> Result<Box<dyn BackendWrapper>> {
    Err(DeployError::Config(
        "tract support not compiled in (enable the `tract` feature)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendType;
    use std::path::PathBuf;

    #[test]
    fn test_file_counts() {
        assert_eq!(backend_file_count(BackendKind::Ncnn), 2);
        assert_eq!(backend_file_count(BackendKind::OnnxRuntime), 1);
        assert_eq!(backend_file_count(BackendKind::Tract), 1);
    }

    #[test]
    fn test_wrong_artifact_count_is_config_error() {
        let config = BackendConfig {
            files: vec![PathBuf::from("only.param")],
            ..BackendConfig::default()
        };
        assert!(matches!(create_wrapper(&config), Err(DeployError::Config(_))));
    }

    #[cfg(not(feature = "tract"))]
    #[test]
    fn test_disabled_backend_is_config_error() {
        let config = BackendConfig {
            kind: BackendType::Tract,
            files: vec![PathBuf::from("model.onnx")],
            ..BackendConfig::default()
        };
        let err = create_wrapper(&config).err().unwrap();
        assert!(err.to_string().contains("tract"));
    }
}

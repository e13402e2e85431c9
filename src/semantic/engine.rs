//! ONNX Runtime backed encoder.
//!
//! Loads one CLIP encoder (visual or textual) from a model file and runs it
//! on [`ModelInput`] tensors. The raw first output is returned; normalization
//! is the extractor's job.

use std::path::Path;

use ndarray::{Array2, Array4};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use crate::semantic::extractor::{EngineError, InferenceEngine, ModelInput, IMAGE_SIZE};
use crate::semantic::tokenizer::CONTEXT_LENGTH;

pub struct OnnxEngine {
    session: Session,
    input_names: Vec<String>,
    output_name: String,
}

fn load_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Load(e.to_string())
}

fn run_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Run(e.to_string())
}

impl OnnxEngine {
    /// Build a session from a model file.
    pub fn load(path: &Path, intra_threads: usize) -> Result<Self, EngineError> {
        if !path.exists() {
            return Err(EngineError::Load(format!(
                "model file {} does not exist",
                path.display()
            )));
        }

        tracing::debug!(path = %path.display(), "loading ONNX model");

        let session = Session::builder()
            .map_err(load_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_error)?
            .with_intra_threads(intra_threads)
            .map_err(load_error)?
            .commit_from_file(path)
            .map_err(load_error)?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        if input_names.is_empty() {
            return Err(EngineError::Load("model declares no inputs".to_string()));
        }
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| EngineError::Load("model declares no outputs".to_string()))?;

        tracing::info!(
            path = %path.display(),
            inputs = ?input_names,
            output = %output_name,
            "ONNX model loaded"
        );

        Ok(Self {
            session,
            input_names,
            output_name,
        })
    }
}

impl InferenceEngine for OnnxEngine {
    fn run(&mut self, input: &ModelInput) -> Result<Vec<f32>, EngineError> {
        let outputs = match input {
            ModelInput::Image { pixels } => {
                let array = Array4::from_shape_vec(
                    (1, 3, IMAGE_SIZE, IMAGE_SIZE),
                    pixels.clone(),
                )
                .map_err(run_error)?;
                let tensor = Tensor::from_array(array).map_err(run_error)?;
                self.session
                    .run(ort::inputs![self.input_names[0].clone() => tensor])
                    .map_err(run_error)?
            }
            ModelInput::Text(tokens) => {
                let ids = Array2::from_shape_vec((1, CONTEXT_LENGTH), tokens.ids.clone())
                    .map_err(run_error)?;
                let ids = Tensor::from_array(ids).map_err(run_error)?;

                if self.input_names.len() >= 2 {
                    let mask = Array2::from_shape_vec(
                        (1, CONTEXT_LENGTH),
                        tokens.attention_mask.clone(),
                    )
                    .map_err(run_error)?;
                    let mask = Tensor::from_array(mask).map_err(run_error)?;
                    self.session
                        .run(ort::inputs![
                            self.input_names[0].clone() => ids,
                            self.input_names[1].clone() => mask
                        ])
                        .map_err(run_error)?
                } else {
                    self.session
                        .run(ort::inputs![self.input_names[0].clone() => ids])
                        .map_err(run_error)?
                }
            }
        };

        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| EngineError::Run(format!("no output named {}", self.output_name)))?;
        let (_shape, data) = output.try_extract_tensor::<f32>().map_err(run_error)?;

        Ok(data.to_vec())
    }
}

//! Composition classifier: a small MLP head over CLIP image features.
//!
//! Weights come from a PyTorch export, a JSON object mapping parameter names
//! (`mlp.0.weight`, `mlp.0.bias`, `mlp.3.*`, `mlp.6.*`) to `{data, shape}`.
//! Layers run `Linear, ReLU, Linear, ReLU, Linear, Sigmoid`; dropout is the
//! identity at inference.

use crate::error::{Error, Result};
use itertools::Itertools;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Width of a CLIP ViT-B/32 image embedding
pub const CLIP_FEATURES: usize = 512;

const LAYERS: [&str; 3] = ["mlp.0", "mlp.3", "mlp.6"];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Tensor {
    Matrix(Vec<Vec<f64>>),
    Vector(Vec<f64>),
}

#[derive(Debug, Deserialize)]
struct Param {
    data: Tensor,
    shape: Vec<usize>,
}

impl Param {
    fn into_flat(self, name: &str) -> Result<(Vec<f64>, Vec<usize>)> {
        let flat = match self.data {
            Tensor::Vector(v) => v,
            Tensor::Matrix(rows) => rows.into_iter().flatten().collect(),
        };
        let expected: usize = self.shape.iter().product();
        if flat.len() != expected {
            return Err(Error::Model(format!(
                "{}: {} values for shape {:?}",
                name,
                flat.len(),
                self.shape
            )));
        }
        Ok((flat, self.shape))
    }
}

#[derive(Debug, Clone)]
struct Linear {
    /// Row-major, `outputs x inputs`
    weight: Vec<f64>,
    bias: Vec<f64>,
    inputs: usize,
    outputs: usize,
}

impl Linear {
    fn from_params(params: &mut HashMap<String, Param>, prefix: &str) -> Result<Self> {
        let mut take = |suffix: &str| {
            let name = format!("{}.{}", prefix, suffix);
            params
                .remove(&name)
                .ok_or_else(|| Error::Model(format!("missing parameter {}", name)))
                .and_then(|p| p.into_flat(&name))
        };
        let (weight, wshape) = take("weight")?;
        let (bias, bshape) = take("bias")?;

        let &[outputs, inputs] = wshape.as_slice() else {
            return Err(Error::Model(format!("{}.weight must be 2-d, got {:?}", prefix, wshape)));
        };
        if inputs == 0 || outputs == 0 {
            return Err(Error::Model(format!("{}.weight is empty", prefix)));
        }
        if bshape != [outputs] {
            return Err(Error::Model(format!(
                "{}.bias shape {:?} does not match {} outputs",
                prefix, bshape, outputs
            )));
        }
        Ok(Self {
            weight,
            bias,
            inputs,
            outputs,
        })
    }

    fn forward(&self, x: &[f64]) -> Vec<f64> {
        self.weight
            .chunks(self.inputs)
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + b)
            .collect()
    }
}

fn relu(v: Vec<f64>) -> Vec<f64> {
    v.into_iter().map(|x| x.max(0.0)).collect()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassScore {
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct CompositionClassifier {
    layers: [Linear; 3],
    labels: Vec<String>,
}

impl CompositionClassifier {
    pub fn from_json(json: &str) -> Result<Self> {
        let mut params: HashMap<String, Param> = serde_json::from_str(json)?;
        let l0 = Linear::from_params(&mut params, LAYERS[0])?;
        let l1 = Linear::from_params(&mut params, LAYERS[1])?;
        let l2 = Linear::from_params(&mut params, LAYERS[2])?;

        for (a, b, name) in [(&l0, &l1, LAYERS[1]), (&l1, &l2, LAYERS[2])] {
            if a.outputs != b.inputs {
                return Err(Error::Model(format!(
                    "{} expects {} inputs but the previous layer has {} outputs",
                    name, b.inputs, a.outputs
                )));
            }
        }
        if !params.is_empty() {
            debug!("ignoring extra parameters: {}", params.keys().sorted().join(", "));
        }

        info!(
            "composition classifier loaded: {} -> {} -> {} -> {}",
            l0.inputs, l0.outputs, l1.outputs, l2.outputs
        );
        let labels = (0..l2.outputs).map(|i| format!("class_{}", i)).collect();
        Ok(Self {
            layers: [l0, l1, l2],
            labels,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Name the output classes, in output order.
    pub fn with_labels(mut self, labels: Vec<String>) -> Result<Self> {
        if labels.len() != self.num_classes() {
            return Err(Error::Model(format!(
                "{} labels for {} classes",
                labels.len(),
                self.num_classes()
            )));
        }
        self.labels = labels;
        Ok(self)
    }

    pub fn input_size(&self) -> usize {
        self.layers[0].inputs
    }

    pub fn num_classes(&self) -> usize {
        self.layers[2].outputs
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Independent per-class probabilities for one feature vector.
    pub fn classify(&self, features: &[f64]) -> Result<Vec<ClassScore>> {
        if features.len() != self.input_size() {
            return Err(Error::Model(format!(
                "expected {} features, got {}",
                self.input_size(),
                features.len()
            )));
        }
        let [l0, l1, l2] = &self.layers;
        let hidden = relu(l1.forward(&relu(l0.forward(features))));
        Ok(l2
            .forward(&hidden)
            .into_iter()
            .zip(&self.labels)
            .map(|(logit, label)| ClassScore {
                label: label.clone(),
                score: sigmoid(logit),
            })
            .collect())
    }
}

/// The `k` highest scores, best first
pub fn top_k(scores: &[ClassScore], k: usize) -> Vec<ClassScore> {
    scores
        .iter()
        .sorted_by(|a, b| b.score.total_cmp(&a.score))
        .take(k)
        .cloned()
        .collect()
}

/// Scores at or above `threshold`, best first
pub fn above_threshold(scores: &[ClassScore], threshold: f64) -> Vec<ClassScore> {
    scores
        .iter()
        .filter(|s| s.score >= threshold)
        .sorted_by(|a, b| b.score.total_cmp(&a.score))
        .cloned()
        .collect()
}

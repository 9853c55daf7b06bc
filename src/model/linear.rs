// 该文件是 Saomiao （扫描） 项目的一部分。
// src/model/linear.rs - 线性分类模型
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  frame::{Frame, RGB_CHANNELS},
  model::{Classifier, InferenceError},
};

#[derive(Error, Debug)]
pub enum LinearModelError {
  #[error("JSON 解析错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("模型没有任何类别")]
  NoLabels,
  #[error("池化网格不能为空: {0}x{1}")]
  EmptyGrid(usize, usize),
  #[error("权重行数 {actual} 与类别数 {expected} 不一致")]
  WeightRows { expected: usize, actual: usize },
  #[error("第 {row} 行权重长度 {actual}，期望 {expected}")]
  WeightColumns {
    row: usize,
    expected: usize,
    actual: usize,
  },
  #[error("偏置长度 {actual} 与类别数 {expected} 不一致")]
  BiasLength { expected: usize, actual: usize },
  #[error("模型参数包含非有限值")]
  NonFinite,
}

/// 模型文件格式
///
/// ```json
/// { "labels": ["cat", "dog"], "grid": [4, 4],
///   "weights": [[...], [...]], "bias": [0.0, 0.0] }
/// ```
///
/// 每行权重长度为 `grid[0] * grid[1] * 3`。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModelSpec {
  pub labels: Vec<String>,
  /// 池化网格 [宽, 高]
  pub grid: [usize; 2],
  pub weights: Vec<Vec<f32>>,
  pub bias: Vec<f32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub metadata: Option<serde_json::Value>,
}

/// 网格平均池化特征上的线性层 + softmax
#[derive(Debug, Clone)]
pub struct LinearClassifier {
  labels: Vec<String>,
  grid_w: usize,
  grid_h: usize,
  weights: Vec<Vec<f32>>,
  bias: Vec<f32>,
  name: Option<String>,
}

impl LinearClassifier {
  pub fn from_json(bytes: &[u8]) -> Result<Self, LinearModelError> {
    let spec: LinearModelSpec = serde_json::from_slice(bytes)?;
    Self::from_spec(spec)
  }

  pub fn from_spec(spec: LinearModelSpec) -> Result<Self, LinearModelError> {
    let classes = spec.labels.len();
    if classes == 0 {
      return Err(LinearModelError::NoLabels);
    }

    let [grid_w, grid_h] = spec.grid;
    if grid_w == 0 || grid_h == 0 {
      return Err(LinearModelError::EmptyGrid(grid_w, grid_h));
    }

    if spec.weights.len() != classes {
      return Err(LinearModelError::WeightRows {
        expected: classes,
        actual: spec.weights.len(),
      });
    }

    let features = grid_w * grid_h * RGB_CHANNELS;
    for (row, weights) in spec.weights.iter().enumerate() {
      if weights.len() != features {
        return Err(LinearModelError::WeightColumns {
          row,
          expected: features,
          actual: weights.len(),
        });
      }
    }

    if spec.bias.len() != classes {
      return Err(LinearModelError::BiasLength {
        expected: classes,
        actual: spec.bias.len(),
      });
    }

    let finite = spec
      .weights
      .iter()
      .flatten()
      .chain(spec.bias.iter())
      .all(|v| v.is_finite());
    if !finite {
      return Err(LinearModelError::NonFinite);
    }

    // Teachable Machine 风格的元数据只用于日志
    let name = spec
      .metadata
      .as_ref()
      .and_then(|m| m.get("modelName"))
      .and_then(|v| v.as_str())
      .map(String::from);

    Ok(Self {
      labels: spec.labels,
      grid_w,
      grid_h,
      weights: spec.weights,
      bias: spec.bias,
      name,
    })
  }

  pub fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  pub fn grid(&self) -> (usize, usize) {
    (self.grid_w, self.grid_h)
  }
}

impl Classifier for LinearClassifier {
  fn labels(&self) -> &[String] {
    &self.labels
  }

  fn infer(&self, frame: &Frame) -> Result<Vec<f32>, InferenceError> {
    let features = frame.pooled(self.grid_w, self.grid_h);

    let logits: Vec<f32> = self
      .weights
      .iter()
      .zip(&self.bias)
      .map(|(row, bias)| row.iter().zip(&features).map(|(w, x)| w * x).sum::<f32>() + bias)
      .collect();

    Ok(softmax(&logits))
  }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
  let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
  let sum: f32 = exps.iter().sum();
  exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn red_blue_json() -> String {
    // 1x1 网格：第一类偏好红色，第二类偏好蓝色
    serde_json::json!({
      "labels": ["red", "blue"],
      "grid": [1, 1],
      "weights": [[4.0, 0.0, -4.0], [-4.0, 0.0, 4.0]],
      "bias": [0.0, 0.0],
      "metadata": { "modelName": "colors" }
    })
    .to_string()
  }

  #[test]
  fn classifies_by_pooled_color() {
    let model = LinearClassifier::from_json(red_blue_json().as_bytes()).unwrap();
    assert_eq!(model.name(), Some("colors"));

    let red = model.infer(&Frame::filled(8, 8, [255, 0, 0])).unwrap();
    assert!(red[0] > 0.99 && red[1] < 0.01);

    let blue = model.infer(&Frame::filled(8, 8, [0, 0, 255])).unwrap();
    assert!(blue[1] > blue[0]);

    let gray = model.infer(&Frame::filled(8, 8, [128, 128, 128])).unwrap();
    assert_eq!(gray[0], gray[1]);
    assert!((gray.iter().sum::<f32>() - 1.0).abs() < 1e-6);
  }

  #[test]
  fn rejects_inconsistent_shapes() {
    let spec = |weights: Vec<Vec<f32>>, bias: Vec<f32>| LinearModelSpec {
      labels: vec!["a".into(), "b".into()],
      grid: [1, 1],
      weights,
      bias,
      metadata: None,
    };

    assert!(matches!(
      LinearClassifier::from_spec(spec(vec![vec![0.0; 3]], vec![0.0, 0.0])),
      Err(LinearModelError::WeightRows { .. })
    ));
    assert!(matches!(
      LinearClassifier::from_spec(spec(vec![vec![0.0; 3], vec![0.0; 2]], vec![0.0, 0.0])),
      Err(LinearModelError::WeightColumns { row: 1, .. })
    ));
    assert!(matches!(
      LinearClassifier::from_spec(spec(vec![vec![0.0; 3]; 2], vec![0.0])),
      Err(LinearModelError::BiasLength { .. })
    ));
    assert!(matches!(
      LinearClassifier::from_spec(spec(vec![vec![f32::INFINITY; 3]; 2], vec![0.0, 0.0])),
      Err(LinearModelError::NonFinite)
    ));
  }

  #[test]
  fn rejects_garbage_and_empty_models() {
    assert!(matches!(
      LinearClassifier::from_json(b"<html>404</html>"),
      Err(LinearModelError::Json(_))
    ));
    let empty = br#"{"labels": [], "grid": [1, 1], "weights": [], "bias": []}"#;
    assert!(matches!(
      LinearClassifier::from_json(empty),
      Err(LinearModelError::NoLabels)
    ));
  }

  #[test]
  fn softmax_is_stable_for_large_logits() {
    let p = softmax(&[1000.0, 1000.0, 0.0]);
    assert!((p[0] - 0.5).abs() < 1e-6);
    assert_eq!(p[2], 0.0);
  }
}

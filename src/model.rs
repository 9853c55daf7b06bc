// 该文件是 Saomiao （扫描） 项目的一部分。
// src/model.rs - 分类模型
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

use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::frame::{Frame, FrameShapeError};

#[derive(Debug, Clone, PartialEq)]
pub struct ClassScore {
  pub label: String,
  pub probability: f32,
}

/// 一次推理的结果，按类别索引排列（不按概率排序）
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Prediction {
  scores: Vec<ClassScore>,
}

impl Prediction {
  pub fn new(scores: Vec<ClassScore>) -> Self {
    Self { scores }
  }

  pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (S, f32)>) -> Self {
    Self::new(
      pairs
        .into_iter()
        .map(|(label, probability)| ClassScore {
          label: label.into(),
          probability,
        })
        .collect(),
    )
  }

  pub fn len(&self) -> usize {
    self.scores.len()
  }

  pub fn is_empty(&self) -> bool {
    self.scores.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, ClassScore> {
    self.scores.iter()
  }

  pub fn as_slice(&self) -> &[ClassScore] {
    &self.scores
  }
}

impl<'a> IntoIterator for &'a Prediction {
  type Item = &'a ClassScore;
  type IntoIter = std::slice::Iter<'a, ClassScore>;

  fn into_iter(self) -> Self::IntoIter {
    self.scores.iter()
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
  #[error("模型地址无法访问: {locator}: {reason}")]
  Unreachable { locator: String, reason: String },
  #[error("模型数据格式错误: {locator}: {reason}")]
  Malformed { locator: String, reason: String },
  #[error("不支持的模型地址方案: {0}")]
  UnsupportedScheme(String),
  #[error("模型加载中断: {0}")]
  Interrupted(String),
}

impl LoadError {
  pub fn unreachable(locator: &Url, reason: impl ToString) -> Self {
    LoadError::Unreachable {
      locator: locator.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn malformed(locator: &Url, reason: impl ToString) -> Self {
    LoadError::Malformed {
      locator: locator.to_string(),
      reason: reason.to_string(),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("输入帧无效: {0}")]
  MalformedFrame(#[from] FrameShapeError),
  #[error("模型句柄无效: {0}")]
  InvalidHandle(String),
  #[error("模型输出数量不匹配: 期望 {expected}, 实际 {actual}")]
  ClassCountMismatch { expected: usize, actual: usize },
  #[error("类别 {label} 的概率超出范围: {probability}")]
  ProbabilityOutOfRange { label: String, probability: f32 },
  #[error("推理超时: {0:?}")]
  Timeout(Duration),
  #[error("推理后端错误: {0}")]
  Backend(String),
}

/// 分类模型
///
/// `infer` 返回与 `labels` 等长、按类别索引排列的概率。
pub trait Classifier: Send + Sync {
  fn labels(&self) -> &[String];
  fn infer(&self, frame: &Frame) -> Result<Vec<f32>, InferenceError>;
}

/// 已加载模型的共享句柄
#[derive(Clone)]
pub struct ClassifierHandle {
  locator: Url,
  model: Arc<dyn Classifier>,
}

impl fmt::Debug for ClassifierHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ClassifierHandle")
      .field("locator", &self.locator.as_str())
      .field("classes", &self.class_count())
      .finish()
  }
}

impl ClassifierHandle {
  pub fn new(locator: Url, model: impl Classifier + 'static) -> Self {
    Self::from_arc(locator, Arc::new(model))
  }

  pub fn from_arc(locator: Url, model: Arc<dyn Classifier>) -> Self {
    Self { locator, model }
  }

  pub fn locator(&self) -> &Url {
    &self.locator
  }

  pub fn labels(&self) -> &[String] {
    self.model.labels()
  }

  pub fn class_count(&self) -> usize {
    self.model.labels().len()
  }

  /// 两个句柄是否指向同一个已加载模型
  pub fn same_model(&self, other: &ClassifierHandle) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(&self.model), Arc::as_ptr(&other.model))
  }
}

pub trait ModelLoader: Send + Sync {
  fn load(&self, locator: &Url) -> Result<ClassifierHandle, LoadError>;
}

impl<L: ModelLoader + ?Sized> ModelLoader for Arc<L> {
  fn load(&self, locator: &Url) -> Result<ClassifierHandle, LoadError> {
    (**self).load(locator)
  }
}

/// 对一帧运行推理，保证结果长度等于模型类别数且每个概率都在 [0, 1] 内
pub fn predict(handle: &ClassifierHandle, frame: &Frame) -> Result<Prediction, InferenceError> {
  frame.check_shape()?;

  let labels = handle.labels();
  if labels.is_empty() {
    return Err(InferenceError::InvalidHandle(format!(
      "模型 {} 没有任何类别",
      handle.locator()
    )));
  }

  let probabilities = handle.model.infer(frame)?;
  if probabilities.len() != labels.len() {
    return Err(InferenceError::ClassCountMismatch {
      expected: labels.len(),
      actual: probabilities.len(),
    });
  }

  let scores = labels
    .iter()
    .zip(probabilities)
    .map(|(label, probability)| {
      if (0.0..=1.0).contains(&probability) {
        Ok(ClassScore {
          label: label.clone(),
          probability,
        })
      } else {
        Err(InferenceError::ProbabilityOutOfRange {
          label: label.clone(),
          probability,
        })
      }
    })
    .collect::<Result<Vec<_>, _>>()?;

  debug!("帧 {} 推理完成，{} 个类别", frame.index(), scores.len());
  Ok(Prediction::new(scores))
}

mod cache;
mod fetch;
mod linear;

pub use self::cache::ClassifierCache;
pub use self::fetch::ModelFetcher;
pub use self::linear::{LinearClassifier, LinearModelSpec};

#[cfg(test)]
mod tests {
  use super::*;

  struct Fixed {
    labels: Vec<String>,
    output: Vec<f32>,
  }

  impl Classifier for Fixed {
    fn labels(&self) -> &[String] {
      &self.labels
    }

    fn infer(&self, _frame: &Frame) -> Result<Vec<f32>, InferenceError> {
      Ok(self.output.clone())
    }
  }

  fn handle(labels: &[&str], output: Vec<f32>) -> ClassifierHandle {
    ClassifierHandle::new(
      Url::parse("memory://fixed").unwrap(),
      Fixed {
        labels: labels.iter().map(|s| s.to_string()).collect(),
        output,
      },
    )
  }

  #[test]
  fn predict_keeps_class_index_order() {
    let handle = handle(&["cat", "dog", "bird"], vec![0.1, 0.7, 0.2]);
    let prediction = predict(&handle, &Frame::filled(2, 2, [0, 0, 0])).unwrap();
    assert_eq!(
      prediction,
      Prediction::from_pairs([("cat", 0.1), ("dog", 0.7), ("bird", 0.2)])
    );
  }

  #[test]
  fn predict_rejects_malformed_frame() {
    let handle = handle(&["cat"], vec![1.0]);
    let err = predict(&handle, &Frame::new(4, 4, Vec::new())).unwrap_err();
    assert!(matches!(err, InferenceError::MalformedFrame(_)));
  }

  #[test]
  fn predict_rejects_invalid_handle_and_bad_output() {
    let frame = Frame::filled(1, 1, [0, 0, 0]);

    let empty = handle(&[], vec![]);
    assert!(matches!(
      predict(&empty, &frame),
      Err(InferenceError::InvalidHandle(_))
    ));

    let short = handle(&["a", "b"], vec![1.0]);
    assert_eq!(
      predict(&short, &frame).unwrap_err(),
      InferenceError::ClassCountMismatch {
        expected: 2,
        actual: 1
      }
    );

    let nan = handle(&["a"], vec![f32::NAN]);
    assert!(matches!(
      predict(&nan, &frame),
      Err(InferenceError::ProbabilityOutOfRange { .. })
    ));
  }

  #[test]
  fn cloned_handles_share_the_model() {
    let a = handle(&["x"], vec![1.0]);
    let b = a.clone();
    let c = handle(&["x"], vec![1.0]);
    assert!(a.same_model(&b));
    assert!(!a.same_model(&c));
  }
}

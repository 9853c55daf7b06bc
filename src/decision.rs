// 该文件是 Saomiao （扫描） 项目的一部分。
// src/decision.rs - 分类结果归约
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

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::model::Prediction;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceError {
  #[error("分类结果为空")]
  EmptyInput,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
  Label {
    label: String,
    probability: f32,
    /// 类别索引
    index: usize,
  },
  NoDecision,
}

impl Decision {
  pub fn label(&self) -> Option<&str> {
    match self {
      Decision::Label { label, .. } => Some(label),
      Decision::NoDecision => None,
    }
  }

  pub fn probability(&self) -> Option<f32> {
    match self {
      Decision::Label { probability, .. } => Some(*probability),
      Decision::NoDecision => None,
    }
  }
}

impl fmt::Display for Decision {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Decision::Label {
        label, probability, ..
      } => write!(f, "{} ({:.1}%)", label, probability * 100.0),
      Decision::NoDecision => write!(f, "无结论"),
    }
  }
}

/// 选出概率最大的类别
///
/// 按类别索引顺序扫描，只有严格更大的概率才会替换当前结果，
/// 因此概率相同时索引最小的类别胜出。
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecisionReducer {
  min_probability: Option<f32>,
}

impl DecisionReducer {
  pub fn new() -> Self {
    Self::default()
  }

  /// 最大概率低于该值时给出 `Decision::NoDecision`
  pub fn with_min_probability(mut self, min_probability: Option<f32>) -> Self {
    self.min_probability = min_probability;
    self
  }

  pub fn reduce(&self, prediction: &Prediction) -> Result<Decision, ReduceError> {
    let mut scores = prediction.iter().enumerate();
    let (mut index, mut best) = scores.next().ok_or(ReduceError::EmptyInput)?;
    for (i, score) in scores {
      if score.probability > best.probability {
        index = i;
        best = score;
      }
    }

    if let Some(min) = self.min_probability
      && best.probability < min
    {
      debug!(
        "最大概率 {:.3} ({}) 低于阈值 {:.3}",
        best.probability, best.label, min
      );
      return Ok(Decision::NoDecision);
    }

    Ok(Decision::Label {
      label: best.label.clone(),
      probability: best.probability,
      index,
    })
  }
}

pub fn reduce(prediction: &Prediction) -> Result<Decision, ReduceError> {
  DecisionReducer::default().reduce(prediction)
}

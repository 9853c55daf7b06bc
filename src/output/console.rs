// 该文件是 Saomiao （扫描） 项目的一部分。
// src/output/console.rs - 控制台输出
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

use std::io::Write;

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  decision::Decision,
  model::Prediction,
  output::Render,
  pipeline::{Outcome, PipelineError},
};

#[derive(Error, Debug)]
pub enum ConsoleOutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 在标准输出打印识别结论
///
/// 地址格式: `console:`，加上 `?scores` 同时打印每个类别的概率。
#[derive(Debug, Clone, Default)]
pub struct ConsoleOutput {
  scores: bool,
}

impl FromUrlWithScheme for ConsoleOutput {
  const SCHEME: &'static str = "console";
}

impl FromUrl for ConsoleOutput {
  type Error = ConsoleOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConsoleOutputError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(ConsoleOutput {
      scores: url.query_pairs().any(|(k, _)| k == "scores"),
    })
  }
}

impl ConsoleOutput {
  fn write_outcome(&self, out: &mut impl Write, outcome: &Outcome) -> std::io::Result<()> {
    match &outcome.decision {
      Decision::Label { .. } => writeln!(out, "扫描结果: {}", outcome.decision)?,
      Decision::NoDecision => writeln!(out, "扫描结果: 无结论")?,
    }
    if self.scores {
      write_scores(out, &outcome.prediction)?;
    }
    Ok(())
  }
}

fn write_scores(out: &mut impl Write, prediction: &Prediction) -> std::io::Result<()> {
  for (index, score) in prediction.iter().enumerate() {
    writeln!(out, "  [{}] {}: {:.4}", index, score.label, score.probability)?;
  }
  Ok(())
}

impl Render<Outcome> for ConsoleOutput {
  type Error = ConsoleOutputError;

  fn render_result(&self, result: &Outcome) -> Result<(), Self::Error> {
    let mut stdout = std::io::stdout().lock();
    self.write_outcome(&mut stdout, result)?;
    Ok(())
  }

  fn render_failure(&self, error: &PipelineError) -> Result<(), Self::Error> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "识别失败 [{}]: {}", error.kind(), error)?;
    Ok(())
  }
}

// 该文件是 Saomiao （扫描） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::path::{Path, PathBuf};

use chrono::{Datelike, Local};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  decision::Decision,
  frame::FrameShapeError,
  output::Render,
  pipeline::Outcome,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("帧数据无效: {0}")]
  InvalidFrame(#[from] FrameShapeError),
  #[error("目录路径编码无效: {0}")]
  InvalidPath(String),
}

/// 按日期目录保存识别到的帧与结果
///
/// 地址格式: `folder:///path/to/dir`，文件保存为 `YYYY/MM/DD/HH-MM-SS-XXXX.png`，
/// 同名 `.txt` 记录结论与每个类别的概率。
/// - `?always` 无结论时也保存
/// - `?record=id` 记录类别索引而不是类别名
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counter: Mutex<u16>,
  always: bool,
  label_with_name: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    let label_with_name = !uri.query_pairs().any(|(k, v)| k == "record" && v == "id");

    let directory = urlencoding::decode(uri.path())
      .map_err(|e| DirectoryRecordOutputError::InvalidPath(e.to_string()))?;

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(directory.into_owned()),
      frame_counter: Mutex::new(0),
      always,
      label_with_name,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn frame_id(&self) -> u16 {
    let mut counter = self.frame_counter.lock();
    *counter = counter.wrapping_add(1);
    *counter
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Local::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }

  fn record(&self, outcome: &Outcome, path: &Path) -> Result<(), std::io::Error> {
    let name = |index: usize, label: &str| {
      if self.label_with_name {
        label.to_string()
      } else {
        index.to_string()
      }
    };

    let mut records = Vec::with_capacity(outcome.prediction.len() + 1);
    records.push(match &outcome.decision {
      Decision::Label {
        label,
        probability,
        index,
      } => format!("decision, {}, {:.4}", name(*index, label), probability),
      Decision::NoDecision => "decision, none".to_string(),
    });
    for (index, score) in outcome.prediction.iter().enumerate() {
      records.push(format!(
        "{}, {:.4}",
        name(index, &score.label),
        score.probability
      ));
    }
    std::fs::write(path.with_extension("txt"), records.join("\n"))
  }
}

impl Render<Outcome> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, result: &Outcome) -> Result<(), Self::Error> {
    if !self.always && result.decision == Decision::NoDecision {
      debug!("无结论，跳过记录");
      return Ok(());
    }

    result.frame.check_shape()?;
    let image = result
      .frame
      .to_rgb_image()
      .ok_or(FrameShapeError {
        width: result.frame.width(),
        height: result.frame.height(),
        len: result.frame.as_nhwc().len(),
      })?;

    let path = self.frame_path()?;
    image.save(&path)?;
    self.record(result, &path)?;
    info!("记录识别结果: {}", path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{decision::reduce, frame::Frame, model::Prediction};

  fn outcome(prediction: Prediction, decision: Decision) -> Outcome {
    Outcome {
      frame: Frame::filled(4, 3, [200, 10, 10]),
      prediction,
      decision,
    }
  }

  fn recorder(dir: &Path, query: &str) -> DirectoryRecordOutput {
    let url = url::Url::from_directory_path(dir).unwrap();
    let url = url::Url::parse(&format!("folder://{}{}", url.path(), query)).unwrap();
    DirectoryRecordOutput::from_url(&url).unwrap()
  }

  fn saved_files(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
      for entry in std::fs::read_dir(current).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          pending.push(path);
        } else if path.extension().is_some_and(|e| e == extension) {
          found.push(path);
        }
      }
    }
    found
  }

  #[test]
  fn saves_frame_and_record_under_date_directory() {
    let dir = tempfile::tempdir().unwrap();
    let output = recorder(dir.path(), "");

    let prediction = Prediction::from_pairs([("cat", 0.2), ("dog", 0.8)]);
    let decision = reduce(&prediction).unwrap();
    output.render_result(&outcome(prediction, decision)).unwrap();

    let images = saved_files(dir.path(), "png");
    assert_eq!(images.len(), 1);
    let image = image::open(&images[0]).unwrap().to_rgb8();
    assert_eq!(image.dimensions(), (4, 3));

    // YYYY/MM/DD/HH-MM-SS-0001.png
    let relative = images[0].strip_prefix(dir.path()).unwrap();
    assert_eq!(relative.components().count(), 4);
    assert!(relative.to_string_lossy().ends_with("-0001.png"));

    let text = std::fs::read_to_string(images[0].with_extension("txt")).unwrap();
    assert_eq!(text, "decision, dog, 0.8000\ncat, 0.2000\ndog, 0.8000");
  }

  #[test]
  fn decodes_escaped_directory() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("记录 目录");
    let output = recorder(&target, "");
    assert_eq!(output.directory(), target.as_path());

    let prediction = Prediction::from_pairs([("cat", 0.9), ("dog", 0.1)]);
    let decision = reduce(&prediction).unwrap();
    output.render_result(&outcome(prediction, decision)).unwrap();
    assert_eq!(saved_files(&target, "png").len(), 1);
  }

  #[test]
  fn no_decision_is_skipped_unless_always() {
    let dir = tempfile::tempdir().unwrap();
    let prediction = Prediction::from_pairs([("cat", 0.5), ("dog", 0.5)]);

    recorder(dir.path(), "")
      .render_result(&outcome(prediction.clone(), Decision::NoDecision))
      .unwrap();
    assert!(saved_files(dir.path(), "png").is_empty());

    recorder(dir.path(), "?always&record=id")
      .render_result(&outcome(prediction, Decision::NoDecision))
      .unwrap();
    let records = saved_files(dir.path(), "txt");
    assert_eq!(records.len(), 1);
    let text = std::fs::read_to_string(&records[0]).unwrap();
    assert_eq!(text, "decision, none\n0, 0.5000\n1, 0.5000");
  }
}

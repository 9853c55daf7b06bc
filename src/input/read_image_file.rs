// 该文件是 Saomiao （扫描） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::PathBuf;

use image::ImageReader;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{CaptureError, FrameSource},
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("Empty image path")]
  EmptyPath,
  #[error("Invalid image path encoding: {0}")]
  InvalidPath(String),
}

/// 把一张图片当作摄像头使用
///
/// 图片在 `start` 时解码，解码失败视为设备不可用。
pub struct ImageFileInput {
  path: PathBuf,
  frame: Option<Frame>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let path = urlencoding::decode(url.path())
      .map_err(|e| ImageFileInputError::InvalidPath(e.to_string()))?;
    if path.is_empty() || path == "/" {
      return Err(ImageFileInputError::EmptyPath);
    }

    Ok(ImageFileInput::new(path.into_owned()))
  }
}

impl ImageFileInput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      frame: None,
    }
  }

  fn decode(&self) -> Result<Frame, CaptureError> {
    let device = self.path.display().to_string();
    let image = ImageReader::open(&self.path)
      .map_err(|e| CaptureError::unavailable(&device, e))?
      .decode()
      .map_err(|e| CaptureError::unavailable(&device, e))?
      .to_rgb8();
    Ok(Frame::from_rgb_image(&image))
  }
}

impl FrameSource for ImageFileInput {
  fn start(&mut self) -> Result<(), CaptureError> {
    let frame = self.decode()?;
    info!(
      "图片已加载: {} ({}x{})",
      self.path.display(),
      frame.width(),
      frame.height()
    );
    self.frame = Some(frame);
    Ok(())
  }

  fn stop(&mut self) {
    self.frame = None;
  }

  fn current_frame(&self) -> Result<Frame, CaptureError> {
    self.frame.clone().ok_or(CaptureError::NotReady)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn start_decodes_and_stop_releases() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("still.png");
    image::RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]))
      .save(&path)
      .unwrap();

    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&format!("image://{}", url.path())).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    assert_eq!(input.current_frame().unwrap_err(), CaptureError::NotReady);

    input.start().unwrap();
    let frame = input.current_frame().unwrap();
    assert_eq!((frame.width(), frame.height()), (3, 2));
    assert_eq!(&frame.as_nhwc()[..3], &[10, 20, 30]);

    input.stop();
    input.stop();
    assert_eq!(input.current_frame().unwrap_err(), CaptureError::NotReady);
  }

  #[test]
  fn decodes_spaces_and_cjk_in_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("my photo 猫.png");
    image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]))
      .save(&path)
      .unwrap();

    let url = Url::from_file_path(&path).unwrap();
    assert!(url.path().contains("%20"));
    let url = Url::parse(&format!("image://{}", url.path())).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    assert_eq!(input.path, path);

    input.start().unwrap();
    assert_eq!(input.current_frame().unwrap().width(), 2);
  }

  #[test]
  fn rejects_non_utf8_escapes() {
    let url = Url::parse("image:///tmp/%FF%FE.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::InvalidPath(_))
    ));
  }

  #[test]
  fn missing_file_is_device_unavailable() {
    let mut input = ImageFileInput::new("/definitely/not/here.png");
    assert!(matches!(
      input.start(),
      Err(CaptureError::DeviceUnavailable { .. })
    ));
  }
}

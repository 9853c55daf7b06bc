// 该文件是 Saomiao （扫描） 项目的一部分。
// src/frame.rs - RGB 帧定义
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

use std::sync::Arc;

use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("帧形状错误: {width}x{height}, 数据长度 {len}")]
pub struct FrameShapeError {
  pub width: u32,
  pub height: u32,
  pub len: usize,
}

/// 单帧 RGB 图像（HWC 排列）
///
/// 像素数据通过 `Arc` 共享，克隆帧不会复制像素。
/// 构造时不做校验，推理前由 [`Frame::check_shape`] 检查。
#[derive(Debug, Clone)]
pub struct Frame {
  data: Arc<[u8]>,
  width: u32,
  height: u32,
  /// 帧索引
  index: u64,
  /// 时间戳（毫秒，相对于采集开始）
  timestamp_ms: u64,
}

impl Frame {
  pub fn new(width: u32, height: u32, data: impl Into<Arc<[u8]>>) -> Self {
    Self {
      data: data.into(),
      width,
      height,
      index: 0,
      timestamp_ms: 0,
    }
  }

  /// 纯色帧，主要用于测试和预热
  pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
    let pixels = width as usize * height as usize;
    let data: Vec<u8> = rgb.iter().copied().cycle().take(pixels * RGB_CHANNELS).collect();
    Self::new(width, height, data)
  }

  pub fn with_sequence(mut self, index: u64, timestamp_ms: u64) -> Self {
    self.index = index;
    self.timestamp_ms = timestamp_ms;
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn index(&self) -> u64 {
    self.index
  }

  pub fn timestamp_ms(&self) -> u64 {
    self.timestamp_ms
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }

  pub fn check_shape(&self) -> Result<(), FrameShapeError> {
    let expected = self.width as usize * self.height as usize * RGB_CHANNELS;
    if self.width == 0 || self.height == 0 || self.data.len() != expected {
      return Err(FrameShapeError {
        width: self.width,
        height: self.height,
        len: self.data.len(),
      });
    }
    Ok(())
  }

  /// 按网格做平均池化，输出 `grid_w * grid_h * 3` 个归一化到 [0, 1] 的特征。
  ///
  /// 特征按网格行优先排列，每个格子内依次为 R、G、B。
  /// 调用前帧必须通过 [`Frame::check_shape`]。
  pub fn pooled(&self, grid_w: usize, grid_h: usize) -> Vec<f32> {
    debug_assert!(self.check_shape().is_ok());
    debug_assert!(grid_w > 0 && grid_h > 0);

    let width = self.width as usize;
    let height = self.height as usize;
    let mut features = vec![0.0f32; grid_w * grid_h * RGB_CHANNELS];

    for gy in 0..grid_h {
      let y0 = gy * height / grid_h;
      let y1 = ((gy + 1) * height / grid_h).max(y0 + 1).min(height);
      for gx in 0..grid_w {
        let x0 = gx * width / grid_w;
        let x1 = ((gx + 1) * width / grid_w).max(x0 + 1).min(width);

        let mut sum = [0u64; RGB_CHANNELS];
        for y in y0..y1 {
          for x in x0..x1 {
            let idx = (y * width + x) * RGB_CHANNELS;
            for (c, acc) in sum.iter_mut().enumerate() {
              *acc += self.data[idx + c] as u64;
            }
          }
        }

        let count = ((y1 - y0) * (x1 - x0)) as f32;
        let base = (gy * grid_w + gx) * RGB_CHANNELS;
        for (c, acc) in sum.iter().enumerate() {
          features[base + c] = *acc as f32 / count / 255.0;
        }
      }
    }

    features
  }
}

#[cfg(feature = "image")]
impl Frame {
  pub fn from_rgb_image(image: &image::RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self::new(width, height, image.as_raw().clone())
  }

  pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
    image::RgbImage::from_raw(self.width, self.height, self.data.to_vec())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn check_shape_rejects_empty_and_mismatched_buffers() {
    assert!(Frame::new(0, 0, Vec::new()).check_shape().is_err());
    assert!(Frame::new(2, 2, vec![0u8; 11]).check_shape().is_err());
    assert!(Frame::new(2, 2, vec![0u8; 12]).check_shape().is_ok());
  }

  #[test]
  fn clone_shares_pixels() {
    let frame = Frame::filled(4, 4, [1, 2, 3]);
    let copy = frame.clone();
    assert!(std::ptr::eq(frame.as_nhwc(), copy.as_nhwc()));
  }

  #[test]
  fn pooled_averages_each_cell() {
    // 左半红，右半蓝
    let mut data = Vec::new();
    for _y in 0..2 {
      data.extend_from_slice(&[255, 0, 0, 255, 0, 0, 0, 0, 255, 0, 0, 255]);
    }
    let frame = Frame::new(4, 2, data);

    let features = frame.pooled(2, 1);
    assert_eq!(features, vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);

    let whole = frame.pooled(1, 1);
    assert_eq!(whole, vec![0.5, 0.0, 0.5]);
  }

  #[test]
  fn pooled_handles_grid_larger_than_frame() {
    let frame = Frame::filled(1, 1, [51, 102, 255]);
    let features = frame.pooled(3, 2);
    assert_eq!(features.len(), 3 * 2 * 3);
    for cell in features.chunks(3) {
      assert_eq!(cell, &[0.2, 0.4, 1.0]);
    }
  }
}

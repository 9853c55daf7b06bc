// 该文件是 Saomiao （扫描） 项目的一部分。
// src/input/v4l_input.rs - V4L2 摄像头输入
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

use std::{io, time::Duration};

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{
    CaptureError, FrameSource,
    capture_worker::{CaptureWorker, DEFAULT_OPEN_TIMEOUT, FrameSink},
  },
};

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("Invalid query parameter: {0}")]
  InvalidParameter(String),
}

const V4L_DEFAULT_DEVICE: &str = "/dev/video0";
const V4L_DEFAULT_WIDTH: u32 = 640;
const V4L_DEFAULT_HEIGHT: u32 = 480;
const V4L_BUFFER_COUNT: u32 = 4;
/// 单次等待帧的上限，超时后回到循环检查是否需要停止
const V4L_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// V4L2 摄像头输入
///
/// 地址格式: `v4l:///dev/video0?width=640&height=480`，设备以 YUYV 格式采集。
pub struct V4lInput {
  device_path: String,
  width: u32,
  height: u32,
  worker: Option<CaptureWorker>,
}

impl FromUrlWithScheme for V4lInput {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lInput {
  type Error = V4lInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemaMismatch);
    }

    // v4l:///dev/video0 或 v4l://localhost/dev/video0
    let device_path = if url.path().is_empty() || url.path() == "/" {
      V4L_DEFAULT_DEVICE.to_string()
    } else {
      url.path().to_string()
    };

    let mut width = V4L_DEFAULT_WIDTH;
    let mut height = V4L_DEFAULT_HEIGHT;
    for (k, v) in url.query_pairs() {
      let parsed = || {
        v.parse::<u32>()
          .ok()
          .filter(|n| *n > 0)
          .ok_or_else(|| V4lInputError::InvalidParameter(format!("{}={}", k, v)))
      };
      match k.as_ref() {
        "width" => width = parsed()?,
        "height" => height = parsed()?,
        _ => debug!("忽略未知参数: {}={}", k, v),
      }
    }

    Ok(V4lInput {
      device_path,
      width,
      height,
      worker: None,
    })
  }
}

impl V4lInput {
  fn capture_loop(
    device_path: &str,
    width: u32,
    height: u32,
    sink: &mut FrameSink,
  ) -> Result<(), String> {
    let device = Device::with_path(device_path).map_err(|e| e.to_string())?;

    let mut format = device.format().map_err(|e| e.to_string())?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format).map_err(|e| e.to_string())?;
    if format.fourcc != FourCC::new(b"YUYV") {
      return Err(format!("设备不支持 YUYV 格式: {}", format.fourcc));
    }
    let (width, height) = (format.width, format.height);
    info!("V4L2 采集格式: {}x{} {}", width, height, format.fourcc);

    let mut stream = Stream::with_buffers(&device, Type::VideoCapture, V4L_BUFFER_COUNT)
      .map_err(|e| e.to_string())?;
    stream.set_timeout(V4L_POLL_TIMEOUT);
    sink.ready();

    while sink.is_running() {
      let (buffer, _meta) = match stream.next() {
        Ok(next) => next,
        Err(e) if is_poll_timeout(&e) => {
          debug!("{:?} 内没有新帧", V4L_POLL_TIMEOUT);
          continue;
        }
        Err(e) => return Err(e.to_string()),
      };
      let rgb = yuyv_to_rgb(buffer, width, height);
      sink.push(Frame::new(width, height, rgb));
    }
    Ok(())
  }
}

impl FrameSource for V4lInput {
  fn start(&mut self) -> Result<(), CaptureError> {
    if self.worker.is_some() {
      return Ok(());
    }
    let device_path = self.device_path.clone();
    let (width, height) = (self.width, self.height);
    let worker = CaptureWorker::spawn(&self.device_path, DEFAULT_OPEN_TIMEOUT, move |sink| {
      Self::capture_loop(&device_path, width, height, sink)
    })?;
    self.worker = Some(worker);
    Ok(())
  }

  fn stop(&mut self) {
    if let Some(mut worker) = self.worker.take() {
      worker.shutdown();
    }
  }

  fn current_frame(&self) -> Result<Frame, CaptureError> {
    self
      .worker
      .as_ref()
      .ok_or(CaptureError::NotReady)?
      .current_frame()
  }
}

/// 设备暂时没有帧，不是采集失败
fn is_poll_timeout(e: &io::Error) -> bool {
  e.kind() == io::ErrorKind::TimedOut
}

/// 将 YUYV 格式转换为 RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let pixels = (width * height) as usize;
  let mut rgb = Vec::with_capacity(pixels * 3);

  for chunk in yuyv.chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  // 驱动偶尔会给出带填充的缓冲区
  rgb.resize(pixels * 3, 0);
  rgb
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yuyv_gray_maps_to_gray() {
    let rgb = yuyv_to_rgb(&[128, 128, 64, 128], 2, 1);
    assert_eq!(rgb, vec![128, 128, 128, 64, 64, 64]);
  }

  #[test]
  fn url_defaults_and_overrides() {
    let input = V4lInput::from_url(&Url::parse("v4l:///dev/video2?width=320&height=240").unwrap())
      .unwrap();
    assert_eq!(input.device_path, "/dev/video2");
    assert_eq!((input.width, input.height), (320, 240));

    let input = V4lInput::from_url(&Url::parse("v4l://").unwrap()).unwrap();
    assert_eq!(input.device_path, V4L_DEFAULT_DEVICE);

    assert!(V4lInput::from_url(&Url::parse("v4l:///dev/video0?width=abc").unwrap()).is_err());
  }

  #[test]
  fn only_poll_timeout_keeps_the_loop_going() {
    assert!(is_poll_timeout(&io::Error::new(
      io::ErrorKind::TimedOut,
      "VIDIOC_DQBUF"
    )));
    assert!(!is_poll_timeout(&io::Error::from_raw_os_error(19)));
    assert!(!is_poll_timeout(&io::Error::new(
      io::ErrorKind::Interrupted,
      "poll"
    )));
  }

  #[test]
  fn stop_before_start_is_harmless() {
    let mut input = V4lInput::from_url(&Url::parse("v4l:///dev/video0").unwrap()).unwrap();
    input.stop();
    assert_eq!(input.current_frame().unwrap_err(), CaptureError::NotReady);
  }
}

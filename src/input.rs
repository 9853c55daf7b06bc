// 该文件是 Saomiao （扫描） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use thiserror::Error;
use tracing::{debug, info};

use crate::{FromUrl, frame::Frame};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
  #[error("采集设备不可用: {device}: {reason}")]
  DeviceUnavailable { device: String, reason: String },
  #[error("尚未采集到任何帧")]
  NotReady,
}

impl CaptureError {
  pub fn unavailable(device: impl Into<String>, reason: impl ToString) -> Self {
    CaptureError::DeviceUnavailable {
      device: device.into(),
      reason: reason.to_string(),
    }
  }
}

/// 帧来源
///
/// `stop` 必须是幂等的：未启动时调用、重复调用都不能出错。
/// `current_frame` 在启动前或第一帧到达前返回 [`CaptureError::NotReady`]。
pub trait FrameSource: Send {
  fn start(&mut self) -> Result<(), CaptureError>;
  fn stop(&mut self);
  fn current_frame(&self) -> Result<Frame, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn start(&mut self) -> Result<(), CaptureError> {
    (**self).start()
  }

  fn stop(&mut self) {
    (**self).stop()
  }

  fn current_frame(&self) -> Result<Frame, CaptureError> {
    (**self).current_frame()
  }
}

/// 保证释放的采集作用域
///
/// 启动失败时立即 `stop`，析构时总是 `stop`。
pub struct ScopedCapture<S: FrameSource> {
  source: S,
  started: bool,
}

impl<S: FrameSource> ScopedCapture<S> {
  pub fn new(source: S) -> Self {
    Self {
      source,
      started: false,
    }
  }

  pub fn start(&mut self) -> Result<(), CaptureError> {
    if self.started {
      debug!("采集已启动，忽略重复启动");
      return Ok(());
    }
    match self.source.start() {
      Ok(()) => {
        self.started = true;
        info!("采集已启动");
        Ok(())
      }
      Err(e) => {
        self.source.stop();
        Err(e)
      }
    }
  }

  pub fn stop(&mut self) {
    self.source.stop();
    if self.started {
      self.started = false;
      info!("采集已停止");
    }
  }

  pub fn is_started(&self) -> bool {
    self.started
  }

  pub fn current_frame(&self) -> Result<Frame, CaptureError> {
    self.source.current_frame()
  }

  pub fn source(&self) -> &S {
    &self.source
  }
}

impl<S: FrameSource> Drop for ScopedCapture<S> {
  fn drop(&mut self) {
    self.stop();
  }
}

mod still;
pub use self::still::StillSource;

#[cfg_attr(
  not(any(feature = "v4l_input", feature = "gstreamer_input")),
  allow(dead_code)
)]
mod capture_worker;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lInput, V4lInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerInput, GStreamerInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L input error: {0}")]
  V4lInputError(#[from] V4lInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
}

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "v4l_input")]
  V4l(V4lInput),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        return Ok(InputWrapper::ReadImageFile(ImageFileInput::from_url(url)?));
      }
    }
    #[cfg(feature = "v4l_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4lInput::SCHEME {
        return Ok(InputWrapper::V4l(V4lInput::from_url(url)?));
      }
    }
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInput::SCHEME {
        return Ok(InputWrapper::GStreamer(GStreamerInput::from_url(url)?));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl FrameSource for InputWrapper {
  fn start(&mut self) -> Result<(), CaptureError> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.start(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.start(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.start(),
      #[allow(unreachable_patterns)]
      _ => Err(CaptureError::unavailable("none", "没有启用任何输入特性")),
    }
  }

  fn stop(&mut self) {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.stop(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.stop(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.stop(),
      #[allow(unreachable_patterns)]
      _ => {}
    }
  }

  fn current_frame(&self) -> Result<Frame, CaptureError> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.current_frame(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.current_frame(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.current_frame(),
      #[allow(unreachable_patterns)]
      _ => Err(CaptureError::NotReady),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  use super::*;

  #[derive(Default)]
  struct Counters {
    starts: AtomicUsize,
    stops: AtomicUsize,
  }

  struct Probe {
    counters: Arc<Counters>,
    fail_start: bool,
  }

  impl FrameSource for Probe {
    fn start(&mut self) -> Result<(), CaptureError> {
      self.counters.starts.fetch_add(1, Ordering::SeqCst);
      if self.fail_start {
        return Err(CaptureError::unavailable("probe", "permission denied"));
      }
      Ok(())
    }

    fn stop(&mut self) {
      self.counters.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn current_frame(&self) -> Result<Frame, CaptureError> {
      Err(CaptureError::NotReady)
    }
  }

  #[test]
  fn failed_start_releases_device() {
    let counters = Arc::new(Counters::default());
    let mut capture = ScopedCapture::new(Probe {
      counters: counters.clone(),
      fail_start: true,
    });

    let err = capture.start().unwrap_err();
    assert!(matches!(err, CaptureError::DeviceUnavailable { .. }));
    assert!(!capture.is_started());
    assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn drop_stops_started_capture() {
    let counters = Arc::new(Counters::default());
    {
      let mut capture = ScopedCapture::new(Probe {
        counters: counters.clone(),
        fail_start: false,
      });
      capture.start().unwrap();
      capture.start().unwrap();
    }
    assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
    assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn stop_is_idempotent() {
    let counters = Arc::new(Counters::default());
    let mut capture = ScopedCapture::new(Probe {
      counters: counters.clone(),
      fail_start: false,
    });
    capture.stop();
    capture.stop();
    assert!(!capture.is_started());
    assert_eq!(capture.current_frame().unwrap_err(), CaptureError::NotReady);
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = url::Url::parse("ftp://camera/0").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch(scheme)) if scheme == "ftp"
    ));
  }
}

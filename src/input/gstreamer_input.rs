// 该文件是 Saomiao （扫描） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入模块
//!
//! 支持的地址：
//! - `gst://camera/dev/video0?width=640&height=480&fps=15&rotate=90`：V4L2 摄像头
//! - `gst://auto?width=640&height=480`：系统默认摄像头（`autovideosrc`）
//! - `gst://test?pattern=ball`：测试视频源
//!
//! 管道末端统一转换为 RGB 并接入 `appsink`，采集线程只保留最新一帧。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{
    CaptureError, FrameSource,
    capture_worker::{CaptureWorker, DEFAULT_OPEN_TIMEOUT, FrameSink},
  },
};

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不匹配（期望 "gst://"）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// 未知的输入类型
  #[error("Unknown GStreamer source: {0}")]
  UnknownSource(String),
  /// 查询参数无效
  #[error("Invalid query parameter: {0}")]
  InvalidParameter(String),
}

const GSTREAMER_DEFAULT_WIDTH: u32 = 640;
const GSTREAMER_DEFAULT_HEIGHT: u32 = 480;
const GSTREAMER_DEFAULT_FPS: u32 = 15;
const GSTREAMER_PULL_TIMEOUT_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq)]
enum GStreamerInputBuilderItem {
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    format: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  AutoSource,
  TestSource {
    pattern: String,
  },
  Scale {
    width: u32,
    height: u32,
  },
  VideoFlip {
    method: u32,
    direction: u32,
  },
  TargetFormat {
    format: String,
  },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode_str = if let Some(mode) = io_mode {
          format!(" io-mode={}", mode)
        } else {
          "".to_string()
        };
        format!(
          "v4l2src device={}{} ! video/x-raw,format={},width={},height={},framerate={}/1",
          camera, io_mode_str, format, width, height, fps
        )
      }
      GStreamerInputBuilderItem::AutoSource => "autovideosrc".to_string(),
      GStreamerInputBuilderItem::TestSource { pattern } => {
        format!("videotestsrc is-live=true pattern={}", pattern)
      }
      GStreamerInputBuilderItem::Scale { width, height } => {
        format!(
          "videoconvert ! videoscale ! video/x-raw,width={},height={}",
          width, height
        )
      }
      GStreamerInputBuilderItem::VideoFlip { method, direction } => {
        format!("videoflip method={} video-direction={}", method, direction)
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
    }
  }
}

/// GStreamer 摄像头输入
///
/// 管道在 `start` 时于采集线程中创建并进入 Playing 状态，
/// `stop` 时回到 Null 状态并释放设备。
pub struct GStreamerInput {
  items: Vec<GStreamerInputBuilderItem>,
  worker: Option<CaptureWorker>,
}

impl FromUrlWithScheme for GStreamerInput {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInput {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let width = parse_u32(&query, "width", GSTREAMER_DEFAULT_WIDTH)?;
    let height = parse_u32(&query, "height", GSTREAMER_DEFAULT_HEIGHT)?;

    let mut items = Vec::new();
    match url.host_str() {
      Some("camera") => {
        items.push(GStreamerInputBuilderItem::CameraSource {
          camera: url.path().to_string(),
          io_mode: query.get("io-mode").and_then(|v| v.parse::<u32>().ok()),
          format: query
            .get("format")
            .map(String::from)
            .unwrap_or(String::from("YUY2")),
          width,
          height,
          fps: parse_u32(&query, "fps", GSTREAMER_DEFAULT_FPS)?,
        });
      }
      Some("auto") => {
        items.push(GStreamerInputBuilderItem::AutoSource);
        items.push(GStreamerInputBuilderItem::Scale { width, height });
      }
      Some("test") => {
        items.push(GStreamerInputBuilderItem::TestSource {
          pattern: query
            .get("pattern")
            .map(String::from)
            .unwrap_or(String::from("smpte")),
        });
        items.push(GStreamerInputBuilderItem::Scale { width, height });
      }
      other => {
        return Err(GStreamerInputError::UnknownSource(
          other.unwrap_or_default().to_string(),
        ));
      }
    }

    if let Some(video_flip) = video_flip(query.get("rotate").map(|s| s.as_ref())) {
      items.push(video_flip);
    }
    items.push(GStreamerInputBuilderItem::TargetFormat {
      format: "RGB".to_string(),
    });

    Ok(GStreamerInput {
      items,
      worker: None,
    })
  }
}

fn parse_u32(
  query: &HashMap<String, String>,
  key: &str,
  default: u32,
) -> Result<u32, GStreamerInputError> {
  match query.get(key) {
    None => Ok(default),
    Some(v) => v
      .parse::<u32>()
      .ok()
      .filter(|n| *n > 0)
      .ok_or_else(|| GStreamerInputError::InvalidParameter(format!("{}={}", key, v))),
  }
}

fn video_flip(rotate: Option<&str>) -> Option<GStreamerInputBuilderItem> {
  let (method, direction) = match rotate? {
    "90" => (1, 1),
    "180" => (2, 2),
    "270" => (3, 3),
    _ => return None,
  };
  Some(GStreamerInputBuilderItem::VideoFlip { method, direction })
}

impl GStreamerInput {
  fn pipeline_description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    format!(
      "{} ! appsink max-buffers=2 drop=true sync=false name=sink",
      basic_pipeline
    )
  }

  fn capture_loop(description: &str, sink: &mut FrameSink) -> Result<(), String> {
    gst::init().map_err(|e| e.to_string())?;

    info!("GStreamer pipeline description: {}", description);
    let pipeline = gst::parse::launch(description)
      .map_err(|e| e.to_string())?
      .downcast::<gst::Pipeline>()
      .map_err(|_| "Failed to create pipeline".to_string())?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or("Failed to get appsink element")?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| "Failed to convert element to appsink".to_string())?;

    pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| e.to_string())?;

    let result = Self::pull_samples(&pipeline, &appsink, sink);

    if let Err(e) = pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
    result
  }

  fn pull_samples(
    pipeline: &gst::Pipeline,
    appsink: &gst_app::AppSink,
    sink: &mut FrameSink,
  ) -> Result<(), String> {
    let bus = pipeline.bus().ok_or("Pipeline without bus")?;
    let timeout = gst::ClockTime::from_mseconds(GSTREAMER_PULL_TIMEOUT_MS);
    let mut announced = false;

    while sink.is_running() {
      // 设备错误（权限、占用）会出现在总线上
      if let Some(message) = bus.pop_filtered(&[gst::MessageType::Error]) {
        if let gst::MessageView::Error(err) = message.view() {
          return Err(err.error().to_string());
        }
      }

      let Some(sample) = appsink.try_pull_sample(timeout) else {
        if appsink.is_eos() {
          return Err("End of stream".to_string());
        }
        continue;
      };

      match convert_sample(&sample) {
        Ok(frame) => {
          if !announced {
            // 第一帧到达才视为设备就绪
            sink.ready();
            announced = true;
          }
          sink.push(frame);
        }
        Err(e) => warn!("丢弃无法转换的帧: {}", e),
      }
    }
    Ok(())
  }
}

impl FrameSource for GStreamerInput {
  fn start(&mut self) -> Result<(), CaptureError> {
    if self.worker.is_some() {
      return Ok(());
    }
    let description = self.pipeline_description();
    let device = description.clone();
    let worker = CaptureWorker::spawn(&device, DEFAULT_OPEN_TIMEOUT, move |sink| {
      Self::capture_loop(&description, sink)
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

fn convert_sample(sample: &gst::Sample) -> Result<Frame, String> {
  let buffer = sample.buffer().ok_or("No buffer in sample")?;
  let caps = sample.caps().ok_or("No caps in sample")?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| "Failed to get video info from caps")?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer
    .map_readable()
    .map_err(|e| format!("Failed to map buffer for reading: {}", e))?;
  let data = map.as_slice();

  if width == 0 || height == 0 {
    return Err("Empty video frame".to_string());
  }

  // 行对齐可能带有填充
  let expected_size = stride * (height - 1) + width * 3;
  if data.len() < expected_size {
    return Err(format!(
      "Buffer size mismatch: expected {} bytes, got {} bytes",
      expected_size,
      data.len()
    ));
  }

  let swap = match video_info.format() {
    gst_video::VideoFormat::Rgb => false,
    gst_video::VideoFormat::Bgr => true,
    other => return Err(format!("Unsupported video format: {:?}", other)),
  };

  let mut rgb = Vec::with_capacity(width * height * 3);
  for row in data.chunks(stride).take(height) {
    for pixel in row[..width * 3].chunks_exact(3) {
      if swap {
        rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
      } else {
        rgb.extend_from_slice(pixel);
      }
    }
  }

  Ok(Frame::new(width as u32, height as u32, rgb))
}

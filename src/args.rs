// 该文件是 Saomiao （扫描） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::time::Duration;

use clap::Args;
use url::Url;

use crate::pipeline::PipelineConfig;

/// 各个程序共用的参数
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
  /// 模型地址（file:// 或 http(s)://）
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 输入来源
  /// 支持格式:
  /// - 图片: image:///path/to/photo.jpg
  /// - V4L2: v4l:///dev/video0?width=640&height=480
  /// - GStreamer: gst://camera/dev/video0、gst://auto、gst://test
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 输出方式（console: 或 folder:///path/to/dir）
  #[arg(long, value_name = "OUTPUT", default_value = "console:")]
  pub output: Url,

  /// 识别完成后保持结果的时间（毫秒）
  #[arg(long, value_name = "MS", default_value_t = 0)]
  pub settle_ms: u64,

  /// 推理超时（毫秒），不设置表示不限制
  #[arg(long, value_name = "MS")]
  pub inference_timeout_ms: Option<u64>,

  /// 最低置信度 (0.0 - 1.0)，低于该值时不给出结论
  #[arg(long, value_name = "THRESHOLD", value_parser = parse_probability)]
  pub min_probability: Option<f32>,
}

impl PipelineArgs {
  pub fn config(&self) -> PipelineConfig {
    PipelineConfig::default()
      .with_settle(Duration::from_millis(self.settle_ms))
      .with_inference_timeout(self.inference_timeout_ms.map(Duration::from_millis))
      .with_min_probability(self.min_probability)
  }
}

fn parse_probability(value: &str) -> Result<f32, String> {
  let p: f32 = value.parse().map_err(|e| format!("{}", e))?;
  if (0.0..=1.0).contains(&p) {
    Ok(p)
  } else {
    Err(format!("置信度必须在 0.0 到 1.0 之间: {}", p))
  }
}

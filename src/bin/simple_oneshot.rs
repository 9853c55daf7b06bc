// 该文件是 Saomiao （扫描） 项目的一部分。
// src/bin/simple_oneshot.rs - 单次扫描识别
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

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;

use saomiao::{
  FromUrl,
  args::PipelineArgs,
  input::InputWrapper,
  model::{ClassifierCache, ModelFetcher},
  output::OutputWrapper,
  pipeline::PipelineController,
  task::{OneShotTask, Task},
};
use tracing::info;

/// Saomiao 单次扫描
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub pipeline: PipelineArgs,

  /// 等待第一帧的最长时间（毫秒）
  #[arg(long, value_name = "MS", default_value_t = 5000)]
  pub warmup_ms: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.pipeline.model);
  info!("输入来源: {}", args.pipeline.input);
  info!("输出方式: {}", args.pipeline.output);

  let input = InputWrapper::from_url(&args.pipeline.input)?;
  let output = OutputWrapper::from_url(&args.pipeline.output)?;
  let cache = Arc::new(ClassifierCache::new(ModelFetcher::new()));
  let controller = PipelineController::new(
    input,
    cache,
    args.pipeline.model.clone(),
    args.pipeline.config(),
  );

  OneShotTask::default()
    .with_warmup(Duration::from_millis(args.warmup_ms))
    .run_task(&controller, &output)?;

  Ok(())
}

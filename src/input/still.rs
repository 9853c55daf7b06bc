// 该文件是 Saomiao （扫描） 项目的一部分。
// src/input/still.rs - 内存静态帧输入
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

use crate::{
  frame::Frame,
  input::{CaptureError, FrameSource},
};

/// 始终提供同一帧的输入源，启动后才可读取
#[derive(Debug, Clone)]
pub struct StillSource {
  frame: Frame,
  started: bool,
}

impl StillSource {
  pub fn new(frame: Frame) -> Self {
    Self {
      frame,
      started: false,
    }
  }
}

impl FrameSource for StillSource {
  fn start(&mut self) -> Result<(), CaptureError> {
    self.started = true;
    Ok(())
  }

  fn stop(&mut self) {
    self.started = false;
  }

  fn current_frame(&self) -> Result<Frame, CaptureError> {
    if !self.started {
      return Err(CaptureError::NotReady);
    }
    Ok(self.frame.clone())
  }
}

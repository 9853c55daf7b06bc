// 该文件是 Saomiao （扫描） 项目的一部分。
// src/input/capture_worker.rs - 后台采集线程
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

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, RecvTimeoutError},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{frame::Frame, input::CaptureError};

/// 等待设备就绪的默认时长
pub(crate) const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

enum Latest {
  Empty,
  Frame(Frame),
  Lost(String),
}

/// 采集线程内使用的帧出口
pub(crate) struct FrameSink {
  latest: Arc<Mutex<Latest>>,
  running: Arc<AtomicBool>,
  ready: Option<mpsc::SyncSender<Result<(), String>>>,
  start: Instant,
  index: u64,
}

impl FrameSink {
  /// 设备已打开，`spawn` 可以返回
  pub(crate) fn ready(&mut self) {
    if let Some(ready) = self.ready.take() {
      let _ = ready.send(Ok(()));
    }
  }

  pub(crate) fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  pub(crate) fn push(&mut self, frame: Frame) {
    let timestamp_ms = self.start.elapsed().as_millis() as u64;
    *self.latest.lock() = Latest::Frame(frame.with_sequence(self.index, timestamp_ms));
    self.index += 1;
  }

  fn fail(&mut self, reason: String) {
    match self.ready.take() {
      Some(ready) => {
        let _ = ready.send(Err(reason));
      }
      None => *self.latest.lock() = Latest::Lost(reason),
    }
  }
}

/// 采集线程句柄
///
/// 设备在线程内打开，`spawn` 会等待 [`FrameSink::ready`] 或失败结果；
/// 线程只保留最新一帧。
pub(crate) struct CaptureWorker {
  device: String,
  latest: Arc<Mutex<Latest>>,
  running: Arc<AtomicBool>,
  thread: Option<JoinHandle<()>>,
}

impl CaptureWorker {
  /// `run` 在采集线程中执行：打开设备，调用 `sink.ready()`，
  /// 然后在 `sink.is_running()` 期间不断 `push` 新帧。
  /// 就绪前返回错误或 `open_timeout` 内未就绪视为打开失败，就绪后返回错误视为设备丢失。
  /// `run` 需要定期检查 `sink.is_running()`，否则超时后无法回收线程。
  pub(crate) fn spawn<R>(
    device: &str,
    open_timeout: Duration,
    run: R,
  ) -> Result<Self, CaptureError>
  where
    R: FnOnce(&mut FrameSink) -> Result<(), String> + Send + 'static,
  {
    let latest = Arc::new(Mutex::new(Latest::Empty));
    let running = Arc::new(AtomicBool::new(true));
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);

    let mut sink = FrameSink {
      latest: latest.clone(),
      running: running.clone(),
      ready: Some(ready_tx),
      start: Instant::now(),
      index: 0,
    };

    let thread_device = device.to_string();
    let thread = thread::Builder::new()
      .name(format!("capture {}", device))
      .spawn(move || {
        sink.start = Instant::now();
        match run(&mut sink) {
          Ok(()) if !sink.is_running() => {}
          Ok(()) => sink.fail("采集提前结束".to_string()),
          Err(reason) => {
            error!("设备 {} 采集失败: {}", thread_device, reason);
            sink.fail(reason);
          }
        }
        debug!("采集线程退出: {}，共 {} 帧", thread_device, sink.index);
      })
      .map_err(|e| CaptureError::unavailable(device, e))?;

    let mut worker = CaptureWorker {
      device: device.to_string(),
      latest,
      running,
      thread: Some(thread),
    };

    match ready_rx.recv_timeout(open_timeout) {
      Ok(Ok(())) => {
        info!("设备已打开: {}", device);
        Ok(worker)
      }
      Ok(Err(reason)) => {
        worker.shutdown();
        Err(CaptureError::unavailable(device, reason))
      }
      Err(RecvTimeoutError::Timeout) => {
        error!("设备 {} 在 {:?} 内未就绪", device, open_timeout);
        worker.shutdown();
        Err(CaptureError::unavailable(
          device,
          format!("{:?} 内未就绪", open_timeout),
        ))
      }
      Err(RecvTimeoutError::Disconnected) => {
        worker.shutdown();
        Err(CaptureError::unavailable(device, "采集线程异常退出"))
      }
    }
  }

  pub(crate) fn current_frame(&self) -> Result<Frame, CaptureError> {
    match &*self.latest.lock() {
      Latest::Empty => Err(CaptureError::NotReady),
      Latest::Frame(frame) => Ok(frame.clone()),
      Latest::Lost(reason) => Err(CaptureError::unavailable(&self.device, reason)),
    }
  }

  pub(crate) fn shutdown(&mut self) {
    self.running.store(false, Ordering::Release);
    if let Some(thread) = self.thread.take()
      && thread.join().is_err()
    {
      warn!("采集线程异常退出: {}", self.device);
    }
  }
}

impl Drop for CaptureWorker {
  fn drop(&mut self) {
    self.shutdown();
  }
}

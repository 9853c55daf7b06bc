// 该文件是 Saomiao （扫描） 项目的一部分。
// src/task.rs - 识别任务
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
  thread,
  time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
  input::FrameSource,
  model::ModelLoader,
  output::Render,
  pipeline::{FailureKind, Outcome, PipelineController},
};

const WARMUP_POLL: Duration = Duration::from_millis(50);

pub trait Task<S: FrameSource, L: ModelLoader, O>: Sized {
  type Error;
  fn run_task(self, controller: &PipelineController<S, L>, output: &O) -> Result<(), Self::Error>;
}

/// 单次识别，对应一次“扫描”
///
/// 设备刚打开时可能还没有帧，`warmup` 内遇到 `NotReady` 会重试。
#[derive(Debug, Clone)]
pub struct OneShotTask {
  warmup: Duration,
}

impl Default for OneShotTask {
  fn default() -> Self {
    Self {
      warmup: Duration::from_secs(5),
    }
  }
}

impl OneShotTask {
  pub fn with_warmup(mut self, warmup: Duration) -> Self {
    self.warmup = warmup;
    self
  }
}

impl<
  S: FrameSource,
  L: ModelLoader,
  RE: std::error::Error + Sync + Send + 'static,
  O: Render<Outcome, Error = RE>,
> Task<S, L, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, controller: &PipelineController<S, L>, output: &O) -> Result<(), Self::Error> {
    info!("开始任务...");
    controller.start_capture()?;

    let started = Instant::now();
    let result = loop {
      match controller.run_once_detailed() {
        Err(e) if e.kind() == FailureKind::NotReady && started.elapsed() < self.warmup => {
          debug!("等待第一帧...");
          thread::sleep(WARMUP_POLL);
        }
        result => break result,
      }
    };
    controller.stop_capture();

    match result {
      Ok(outcome) => {
        info!("识别完成，耗时: {:.2?}", started.elapsed());
        output.render_result(&outcome)?;
        Ok(())
      }
      Err(e) => {
        output.render_failure(&e)?;
        Err(e.into())
      }
    }
  }
}

/// 重复识别同一来源，统计平均耗时
#[derive(Debug, Clone)]
pub struct RepeatShotTask {
  times: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { times: 1000 }
  }
}

impl RepeatShotTask {
  pub fn with_times(mut self, times: usize) -> Self {
    self.times = times;
    self
  }
}

impl<
  S: FrameSource,
  L: ModelLoader,
  RE: std::error::Error + Sync + Send + 'static,
  O: Render<Outcome, Error = RE>,
> Task<S, L, O> for RepeatShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, controller: &PipelineController<S, L>, output: &O) -> Result<(), Self::Error> {
    info!("开始任务...");
    controller.start_capture()?;

    let mut times = Vec::with_capacity(self.times);
    for i in 0..self.times {
      let now = Instant::now();
      let outcome = controller.run_once_detailed()?;
      let elapsed = now.elapsed();
      info!("({})识别完成，耗时: {:.2?}", i, elapsed);
      output.render_result(&outcome)?;
      times.push(elapsed);
    }
    controller.stop_capture();

    // 前两次包含模型加载和缓存预热
    if times.len() > 2 {
      warn!(
        "平均识别时间: {:.2?}",
        times.iter().skip(2).sum::<Duration>() / (times.len() - 2) as u32
      );
    }

    Ok(())
  }
}

/// 持续识别，直到达到指定次数或收到中断信号
#[derive(Default, Debug, Clone)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  interval: Duration,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }
}

impl<
  S: FrameSource,
  L: ModelLoader,
  RE: std::error::Error + Sync + Send + 'static,
  O: Render<Outcome, Error = RE>,
> Task<S, L, O> for ContinuousTask
{
  type Error = anyhow::Error;

  fn run_task(self, controller: &PipelineController<S, L>, output: &O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let (tx, rx) = std::sync::mpsc::channel();

    let installed = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    });
    match installed {
      Ok(()) => {}
      Err(ctrlc::Error::MultipleHandlers) => warn!("中断信号处理器已存在，沿用现有处理器"),
      Err(e) => return Err(e.into()),
    }

    controller.start_capture()?;

    let mut runs = 0usize;
    loop {
      let now = Instant::now();
      match controller.run_once_detailed() {
        Ok(outcome) => {
          runs += 1;
          info!("第 {} 次识别完成，耗时: {:.2?}", runs, now.elapsed());
          output.render_result(&outcome)?;
        }
        Err(e) if e.kind() == FailureKind::NotReady => debug!("帧尚未就绪"),
        Err(e) => {
          runs += 1;
          output.render_failure(&e)?;
        }
      }

      if self.frame_number.is_some_and(|n| runs >= n) {
        info!("达到指定次数 {}, 退出任务循环", runs);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      if !self.interval.is_zero() {
        thread::sleep(self.interval);
      }
    }

    controller.stop_capture();
    info!("任务完成，退出");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    frame::Frame,
    input::{CaptureError, StillSource},
    model::{Classifier, ClassifierCache, ClassifierHandle, InferenceError, LoadError},
    pipeline::{PipelineConfig, PipelineError},
  };
  use parking_lot::Mutex;
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };
  use url::Url;

  struct Fixed(Vec<String>);

  impl Classifier for Fixed {
    fn labels(&self) -> &[String] {
      &self.0
    }

    fn infer(&self, _frame: &Frame) -> Result<Vec<f32>, InferenceError> {
      Ok(vec![0.3, 0.7])
    }
  }

  struct FixedLoader;

  impl ModelLoader for FixedLoader {
    fn load(&self, locator: &Url) -> Result<ClassifierHandle, LoadError> {
      Ok(ClassifierHandle::new(
        locator.clone(),
        Fixed(vec!["cat".into(), "dog".into()]),
      ))
    }
  }

  /// 前 `empty_polls` 次读取返回 NotReady
  struct SlowStart {
    inner: StillSource,
    empty_polls: AtomicUsize,
  }

  impl FrameSource for SlowStart {
    fn start(&mut self) -> Result<(), CaptureError> {
      self.inner.start()
    }

    fn stop(&mut self) {
      self.inner.stop()
    }

    fn current_frame(&self) -> Result<Frame, CaptureError> {
      let left = self.empty_polls.load(Ordering::SeqCst);
      if left > 0 {
        self.empty_polls.store(left - 1, Ordering::SeqCst);
        return Err(CaptureError::NotReady);
      }
      self.inner.current_frame()
    }
  }

  #[derive(Default)]
  struct Collect {
    labels: Mutex<Vec<String>>,
    failures: Mutex<Vec<FailureKind>>,
  }

  impl Render<Outcome> for Collect {
    type Error = std::io::Error;

    fn render_result(&self, result: &Outcome) -> Result<(), Self::Error> {
      let label = result.decision.label().unwrap_or("-").to_string();
      self.labels.lock().push(label);
      Ok(())
    }

    fn render_failure(&self, error: &PipelineError) -> Result<(), Self::Error> {
      self.failures.lock().push(error.kind());
      Ok(())
    }
  }

  fn controller(empty_polls: usize) -> PipelineController<SlowStart, FixedLoader> {
    PipelineController::new(
      SlowStart {
        inner: StillSource::new(Frame::filled(2, 2, [1, 2, 3])),
        empty_polls: AtomicUsize::new(empty_polls),
      },
      Arc::new(ClassifierCache::new(FixedLoader)),
      Url::parse("memory://pets").unwrap(),
      PipelineConfig::default(),
    )
  }

  #[test]
  fn one_shot_waits_for_the_first_frame() {
    let controller = controller(3);
    let output = Collect::default();
    OneShotTask::default()
      .run_task(&controller, &output)
      .unwrap();
    assert_eq!(*output.labels.lock(), vec!["dog".to_string()]);
    assert!(!controller.is_capture_started());
  }

  #[test]
  fn one_shot_gives_up_after_warmup() {
    let controller = controller(usize::MAX);
    let output = Collect::default();
    let err = OneShotTask::default()
      .with_warmup(Duration::from_millis(120))
      .run_task(&controller, &output)
      .unwrap_err();
    assert_eq!(
      err.downcast_ref::<PipelineError>(),
      Some(&PipelineError::Capture(CaptureError::NotReady))
    );
    assert_eq!(*output.failures.lock(), vec![FailureKind::NotReady]);
  }

  #[test]
  fn repeat_shot_renders_every_run() {
    let controller = controller(0);
    let output = Collect::default();
    RepeatShotTask::default()
      .with_times(5)
      .run_task(&controller, &output)
      .unwrap();
    assert_eq!(output.labels.lock().len(), 5);
  }

  #[test]
  fn continuous_stops_after_frame_number() {
    let controller = controller(2);
    let output = Collect::default();
    ContinuousTask::default()
      .with_frame_number(Some(3))
      .run_task(&controller, &output)
      .unwrap();
    assert_eq!(output.labels.lock().len(), 3);
    assert!(output.failures.lock().is_empty());
  }
}

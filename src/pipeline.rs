// 该文件是 Saomiao （扫描） 项目的一部分。
// src/pipeline.rs - 识别流程控制
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
  fmt,
  sync::{
    Arc,
    mpsc::{self, Receiver, RecvTimeoutError, Sender},
  },
  thread,
  time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  decision::{Decision, DecisionReducer, ReduceError},
  frame::Frame,
  input::{CaptureError, FrameSource, ScopedCapture},
  model::{
    ClassifierCache, ClassifierHandle, InferenceError, LoadError, ModelLoader, Prediction,
    predict,
  },
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
  /// `Done` 保持多久后回到 `Idle`，零表示立即
  pub settle: Duration,
  /// 推理超时，`None` 表示不限制
  pub inference_timeout: Option<Duration>,
  pub min_probability: Option<f32>,
}

impl PipelineConfig {
  pub fn with_settle(mut self, settle: Duration) -> Self {
    self.settle = settle;
    self
  }

  pub fn with_inference_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.inference_timeout = timeout;
    self
  }

  pub fn with_min_probability(mut self, min_probability: Option<f32>) -> Self {
    self.min_probability = min_probability;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
  DeviceUnavailable,
  NotReady,
  LoadError,
  InferenceError,
  EmptyInput,
  Busy,
}

impl fmt::Display for FailureKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      FailureKind::DeviceUnavailable => "DeviceUnavailable",
      FailureKind::NotReady => "NotReady",
      FailureKind::LoadError => "LoadError",
      FailureKind::InferenceError => "InferenceError",
      FailureKind::EmptyInput => "EmptyInput",
      FailureKind::Busy => "Busy",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
  Idle,
  Capturing,
  Done,
  Failed(FailureKind),
}

impl fmt::Display for ControllerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ControllerState::Idle => f.write_str("Idle"),
      ControllerState::Capturing => f.write_str("Capturing"),
      ControllerState::Done => f.write_str("Done"),
      ControllerState::Failed(kind) => write!(f, "Failed({})", kind),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
  #[error("采集错误: {0}")]
  Capture(#[from] CaptureError),
  #[error("模型加载错误: {0}")]
  Load(#[from] LoadError),
  #[error("推理错误: {0}")]
  Inference(#[from] InferenceError),
  #[error("结果归约错误: {0}")]
  Reduce(#[from] ReduceError),
  #[error("上一次识别尚未完成")]
  Busy,
}

impl PipelineError {
  pub fn kind(&self) -> FailureKind {
    match self {
      PipelineError::Capture(CaptureError::DeviceUnavailable { .. }) => {
        FailureKind::DeviceUnavailable
      }
      PipelineError::Capture(CaptureError::NotReady) => FailureKind::NotReady,
      PipelineError::Load(_) => FailureKind::LoadError,
      PipelineError::Inference(_) => FailureKind::InferenceError,
      PipelineError::Reduce(ReduceError::EmptyInput) => FailureKind::EmptyInput,
      PipelineError::Busy => FailureKind::Busy,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
  pub from: ControllerState,
  pub to: ControllerState,
}

/// 一次成功识别的完整结果
#[derive(Debug, Clone)]
pub struct Outcome {
  pub frame: Frame,
  pub prediction: Prediction,
  pub decision: Decision,
}

struct Phase {
  state: ControllerState,
  since: Instant,
}

/// 状态与订阅者，结果保持计时线程与控制器共同持有
struct StateBoard {
  phase: Mutex<Phase>,
  subscribers: Mutex<Vec<Sender<StateChange>>>,
  settle: Duration,
}

impl StateBoard {
  fn expire_settle(&self, phase: &mut Phase) {
    if phase.state == ControllerState::Done && phase.since.elapsed() >= self.settle {
      self.transition(phase, ControllerState::Idle);
    }
  }

  fn transition(&self, phase: &mut Phase, to: ControllerState) {
    let from = phase.state;
    if from == to {
      return;
    }
    phase.state = to;
    phase.since = Instant::now();
    debug!("状态变化: {} -> {}", from, to);

    let change = StateChange { from, to };
    self
      .subscribers
      .lock()
      .retain(|subscriber| subscriber.send(change).is_ok());
  }
}

/// 识别流程控制器
///
/// 每次 `run_once` 依次执行 取帧 → 加载模型 → 推理 → 归约，任一步失败立即结束。
/// 同一时刻只允许一次识别，进行中的再次调用直接返回 [`PipelineError::Busy`]。
///
/// ```text
/// Idle ──run_once──▶ Capturing ──ok──▶ Done ──settle──▶ Idle
///                        └──err──▶ Failed ──run_once──▶ Idle ──▶ Capturing
/// ```
pub struct PipelineController<S: FrameSource, L: ModelLoader> {
  capture: Mutex<ScopedCapture<S>>,
  cache: Arc<ClassifierCache<L>>,
  locator: Url,
  reducer: DecisionReducer,
  config: PipelineConfig,
  board: Arc<StateBoard>,
  last_decision: Mutex<Option<Decision>>,
}

/// 进行中的识别；未正常结束（panic）时停止采集并回到 `Idle`
struct InFlight<'a, S: FrameSource, L: ModelLoader> {
  controller: &'a PipelineController<S, L>,
  finished: bool,
}

impl<S: FrameSource, L: ModelLoader> Drop for InFlight<'_, S, L> {
  fn drop(&mut self) {
    if !self.finished {
      error!("识别被中断，停止采集");
      self.controller.capture.lock().stop();
      let board = &self.controller.board;
      let mut phase = board.phase.lock();
      board.transition(&mut phase, ControllerState::Idle);
    }
  }
}

impl<S: FrameSource, L: ModelLoader> PipelineController<S, L> {
  pub fn new(
    source: S,
    cache: Arc<ClassifierCache<L>>,
    locator: Url,
    config: PipelineConfig,
  ) -> Self {
    let reducer = DecisionReducer::new().with_min_probability(config.min_probability);
    let board = Arc::new(StateBoard {
      phase: Mutex::new(Phase {
        state: ControllerState::Idle,
        since: Instant::now(),
      }),
      subscribers: Mutex::new(Vec::new()),
      settle: config.settle,
    });
    Self {
      capture: Mutex::new(ScopedCapture::new(source)),
      cache,
      locator,
      reducer,
      config,
      board,
      last_decision: Mutex::new(None),
    }
  }

  /// 打开采集设备；已启动时不做任何事
  pub fn start_capture(&self) -> Result<(), PipelineError> {
    self.capture.lock().start().map_err(|e| {
      error!("采集设备启动失败: {}", e);
      PipelineError::from(e)
    })
  }

  pub fn stop_capture(&self) {
    self.capture.lock().stop();
  }

  pub fn is_capture_started(&self) -> bool {
    self.capture.lock().is_started()
  }

  pub fn run_once(&self) -> Result<Decision, PipelineError> {
    self.run_once_detailed().map(|outcome| outcome.decision)
  }

  pub fn run_once_detailed(&self) -> Result<Outcome, PipelineError> {
    {
      let mut phase = self.board.phase.lock();
      self.board.expire_settle(&mut phase);
      if phase.state == ControllerState::Capturing {
        warn!("识别进行中，拒绝新的请求");
        return Err(PipelineError::Busy);
      }
      self.board.transition(&mut phase, ControllerState::Idle);
      self.board.transition(&mut phase, ControllerState::Capturing);
    }

    let mut in_flight = InFlight {
      controller: self,
      finished: false,
    };
    let started = Instant::now();
    let result = self.execute();
    in_flight.finished = true;

    let mut phase = self.board.phase.lock();
    match &result {
      Ok(outcome) => {
        info!("识别完成: {}，耗时 {:.2?}", outcome.decision, started.elapsed());
        *self.last_decision.lock() = Some(outcome.decision.clone());
        self.board.transition(&mut phase, ControllerState::Done);
        if self.config.settle.is_zero() {
          self.board.transition(&mut phase, ControllerState::Idle);
        } else {
          self.arm_settle(phase.since);
        }
      }
      Err(e) => {
        warn!("识别失败: {}", e);
        self
          .board
          .transition(&mut phase, ControllerState::Failed(e.kind()));
      }
    }
    result
  }

  fn execute(&self) -> Result<Outcome, PipelineError> {
    let frame = self.capture.lock().current_frame()?;
    debug!("取得第 {} 帧 ({}x{})", frame.index(), frame.width(), frame.height());
    let handle = self.cache.get_or_load(&self.locator)?;
    let prediction = self.infer(&handle, &frame)?;
    let decision = self.reducer.reduce(&prediction)?;
    Ok(Outcome {
      frame,
      prediction,
      decision,
    })
  }

  fn infer(&self, handle: &ClassifierHandle, frame: &Frame) -> Result<Prediction, InferenceError> {
    let Some(timeout) = self.config.inference_timeout else {
      return predict(handle, frame);
    };

    let (tx, rx) = mpsc::channel();
    let (handle, frame) = (handle.clone(), frame.clone());
    thread::Builder::new()
      .name("saomiao-infer".to_string())
      .spawn(move || {
        let _ = tx.send(predict(&handle, &frame));
      })
      .map_err(|e| InferenceError::Backend(e.to_string()))?;

    match rx.recv_timeout(timeout) {
      Ok(result) => result,
      Err(RecvTimeoutError::Timeout) => {
        warn!("推理超过 {:?} 未完成", timeout);
        Err(InferenceError::Timeout(timeout))
      }
      Err(RecvTimeoutError::Disconnected) => {
        Err(InferenceError::Backend("推理线程异常退出".to_string()))
      }
    }
  }

  /// `settle` 到期后把 `Done` 发布为 `Idle`，订阅者无需轮询 `state`
  fn arm_settle(&self, done_at: Instant) {
    let board = Arc::clone(&self.board);
    let spawned = thread::Builder::new()
      .name("saomiao-settle".to_string())
      .spawn(move || {
        thread::sleep(board.settle);
        let mut phase = board.phase.lock();
        // 期间已开始新的识别或已被查询过期
        if phase.state == ControllerState::Done && phase.since == done_at {
          board.transition(&mut phase, ControllerState::Idle);
        }
      });
    if let Err(e) = spawned {
      warn!("无法启动结果保持计时线程，改为查询时过期: {}", e);
    }
  }

  pub fn state(&self) -> ControllerState {
    let mut phase = self.board.phase.lock();
    self.board.expire_settle(&mut phase);
    phase.state
  }

  /// 最近一次成功识别的结论，失败的识别不会覆盖它
  pub fn last_decision(&self) -> Option<Decision> {
    self.last_decision.lock().clone()
  }

  pub fn subscribe(&self) -> Receiver<StateChange> {
    let (tx, rx) = mpsc::channel();
    self.board.subscribers.lock().push(tx);
    rx
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn locator(&self) -> &Url {
    &self.locator
  }
}

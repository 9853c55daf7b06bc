// 该文件是 Saomiao （扫描） 项目的一部分。
// src/model/cache.rs - 模型缓存
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

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::model::{ClassifierHandle, LoadError, ModelLoader};

type LoadResult = Result<ClassifierHandle, LoadError>;

#[derive(Default)]
struct PendingLoad {
  result: Mutex<Option<LoadResult>>,
  done: Condvar,
}

impl PendingLoad {
  fn wait(&self) -> LoadResult {
    let mut result = self.result.lock();
    loop {
      if let Some(result) = result.as_ref() {
        return result.clone();
      }
      self.done.wait(&mut result);
    }
  }

  fn complete(&self, result: LoadResult) {
    *self.result.lock() = Some(result);
    self.done.notify_all();
  }
}

enum Slot {
  Ready(ClassifierHandle),
  Loading(Arc<PendingLoad>),
}

/// 进行中的加载；未正常结束（加载器 panic）时在析构中唤醒等待者
struct LoadGuard<'a> {
  slots: &'a Mutex<HashMap<String, Slot>>,
  key: &'a str,
  pending: Arc<PendingLoad>,
  settled: bool,
}

impl LoadGuard<'_> {
  fn settle(&mut self, result: LoadResult) {
    self.settled = true;
    {
      let mut slots = self.slots.lock();
      let ours = matches!(
        slots.get(self.key),
        Some(Slot::Loading(pending)) if Arc::ptr_eq(pending, &self.pending)
      );
      if ours {
        match &result {
          Ok(handle) => {
            slots.insert(self.key.to_string(), Slot::Ready(handle.clone()));
          }
          Err(_) => {
            slots.remove(self.key);
          }
        }
      }
    }
    // 先更新表再唤醒，被唤醒的调用者再次查询时能看到结果
    self.pending.complete(result);
  }
}

impl Drop for LoadGuard<'_> {
  fn drop(&mut self) {
    if !self.settled {
      error!("模型加载异常中断: {}", self.key);
      self.settle(Err(LoadError::Interrupted(self.key.to_string())));
    }
  }
}

/// 按地址缓存已加载的模型
///
/// 同一地址同一时刻最多只有一次加载，并发调用者共享这次加载的结果。
/// 加载成功的模型在缓存存活期间一直保留；加载失败不会被缓存，下次调用会重新加载。
pub struct ClassifierCache<L> {
  loader: L,
  slots: Mutex<HashMap<String, Slot>>,
}

impl<L: ModelLoader> ClassifierCache<L> {
  pub fn new(loader: L) -> Self {
    Self {
      loader,
      slots: Mutex::new(HashMap::new()),
    }
  }

  pub fn get_or_load(&self, locator: &Url) -> Result<ClassifierHandle, LoadError> {
    let key = locator.as_str();

    let mut slots = self.slots.lock();
    let waiting = match slots.get(key) {
      Some(Slot::Ready(handle)) => {
        debug!("模型缓存命中: {}", key);
        return Ok(handle.clone());
      }
      Some(Slot::Loading(pending)) => Some(Arc::clone(pending)),
      None => None,
    };

    if let Some(pending) = waiting {
      drop(slots);
      info!("等待正在进行的模型加载: {}", key);
      return pending.wait();
    }

    let pending = Arc::new(PendingLoad::default());
    slots.insert(key.to_string(), Slot::Loading(Arc::clone(&pending)));
    drop(slots);

    let mut guard = LoadGuard {
      slots: &self.slots,
      key,
      pending,
      settled: false,
    };

    info!("开始加载模型: {}", key);
    let result = self.loader.load(locator);
    if let Err(e) = &result {
      warn!("模型加载失败: {}", e);
    }
    guard.settle(result.clone());
    result
  }

  /// 已加载完成的模型数量
  pub fn len(&self) -> usize {
    self
      .slots
      .lock()
      .values()
      .filter(|slot| matches!(slot, Slot::Ready(_)))
      .count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains(&self, locator: &Url) -> bool {
    matches!(self.slots.lock().get(locator.as_str()), Some(Slot::Ready(_)))
  }

  pub fn loader(&self) -> &L {
    &self.loader
  }
}

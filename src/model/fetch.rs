// 该文件是 Saomiao （扫描） 项目的一部分。
// src/model/fetch.rs - 模型文件获取
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

use tracing::{debug, info};
use url::Url;

use crate::model::{Classifier, ClassifierHandle, LinearClassifier, LoadError, ModelLoader};

/// 按地址获取并解析模型
///
/// 支持 `file://`，启用 `http_model` 特性后支持 `http://` 与 `https://`。
#[derive(Debug, Clone, Default)]
pub struct ModelFetcher {
  timeout: Option<Duration>,
}

impl ModelFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// 网络请求超时，仅对 HTTP 生效
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  fn fetch(&self, locator: &Url) -> Result<Vec<u8>, LoadError> {
    match locator.scheme() {
      "file" => {
        let path = locator
          .to_file_path()
          .map_err(|_| LoadError::unreachable(locator, "无效的文件路径"))?;
        std::fs::read(&path).map_err(|e| LoadError::unreachable(locator, e))
      }
      #[cfg(feature = "http_model")]
      "http" | "https" => self.fetch_http(locator),
      other => Err(LoadError::UnsupportedScheme(other.to_string())),
    }
  }

  #[cfg(feature = "http_model")]
  fn fetch_http(&self, locator: &Url) -> Result<Vec<u8>, LoadError> {
    use std::io::Read;

    let mut request = ureq::get(locator.as_str());
    if let Some(timeout) = self.timeout {
      request = request.timeout(timeout);
    }
    let response = request
      .call()
      .map_err(|e| LoadError::unreachable(locator, e))?;

    let mut bytes = Vec::new();
    response
      .into_reader()
      .read_to_end(&mut bytes)
      .map_err(|e| LoadError::unreachable(locator, e))?;
    Ok(bytes)
  }
}

impl ModelLoader for ModelFetcher {
  fn load(&self, locator: &Url) -> Result<ClassifierHandle, LoadError> {
    info!("加载模型文件: {}", locator);
    let bytes = self.fetch(locator)?;
    debug!("模型文件大小: {:.2} KB", bytes.len() as f64 / 1024.0);

    let model = LinearClassifier::from_json(&bytes).map_err(|e| LoadError::malformed(locator, e))?;
    info!(
      "模型加载完成: {}，{} 个类别",
      model.name().unwrap_or(locator.as_str()),
      model.labels().len()
    );

    Ok(ClassifierHandle::new(locator.clone(), model))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MODEL: &str = r#"{
    "labels": ["cat", "dog"],
    "grid": [1, 1],
    "weights": [[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
    "bias": [0.0, 0.0]
  }"#;

  #[test]
  fn loads_model_from_file_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    std::fs::write(&path, MODEL).unwrap();

    let locator = Url::from_file_path(&path).unwrap();
    let handle = ModelFetcher::new().load(&locator).unwrap();
    assert_eq!(handle.labels(), &["cat".to_string(), "dog".to_string()]);
    assert_eq!(handle.locator(), &locator);
  }

  #[test]
  fn classifies_failures() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ModelFetcher::new();

    let missing = Url::from_file_path(dir.path().join("missing.json")).unwrap();
    assert!(matches!(
      fetcher.load(&missing),
      Err(LoadError::Unreachable { .. })
    ));

    let garbage = dir.path().join("garbage.json");
    std::fs::write(&garbage, "not a model").unwrap();
    assert!(matches!(
      fetcher.load(&Url::from_file_path(&garbage).unwrap()),
      Err(LoadError::Malformed { .. })
    ));

    assert_eq!(
      fetcher
        .load(&Url::parse("ftp://models/zoo.json").unwrap())
        .unwrap_err(),
      LoadError::UnsupportedScheme("ftp".to_string())
    );
  }

  #[cfg(feature = "http_model")]
  #[test]
  fn loads_model_over_http() {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
      let (stream, _) = listener.accept().unwrap();
      let mut reader = BufReader::new(stream);
      let mut line = String::new();
      while reader.read_line(&mut line).unwrap() > 0 {
        if line == "\r\n" {
          break;
        }
        line.clear();
      }
      let mut stream = reader.into_inner();
      write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        MODEL.len(),
        MODEL
      )
      .unwrap();
    });

    let locator = Url::parse(&format!("http://127.0.0.1:{}/model.json", port)).unwrap();
    let handle = ModelFetcher::new()
      .with_timeout(Some(Duration::from_secs(5)))
      .load(&locator)
      .unwrap();
    assert_eq!(handle.class_count(), 2);
    server.join().unwrap();
  }
}

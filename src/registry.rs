// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/registry.rs - 模型登记表
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
  cmp::Ordering,
  fs, io,
  path::{Path, PathBuf},
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{DetectorSpec, ModelError};

#[derive(Error, Debug)]
pub enum RegistryError {
  #[error("登记表读写失败: {0}")]
  Io(#[from] io::Error),
  #[error("登记表文件损坏 {path}: {source}")]
  Corrupt {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("登记表序列化失败: {0}")]
  Serialize(#[source] serde_json::Error),
  #[error("模型不存在: {0}")]
  NotFound(String),
  #[error("不能删除当前启用的模型: {0}")]
  ActiveModel(String),
  #[error("不能直接停用当前启用的模型，请先启用其他模型: {0}")]
  DeactivateActive(String),
  #[error("模型记录无效: {0}")]
  InvalidRecord(String),
}

/// 一条已训练模型的元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
  pub name: String,
  pub date_built: NaiveDate,
  #[serde(default)]
  pub base_model: String,
  #[serde(default)]
  pub num_params: u64,
  #[serde(default)]
  pub map: Option<f32>,
  #[serde(default)]
  pub map_5095: Option<f32>,
  #[serde(default)]
  pub size: String,
  pub weights_path: String,
  #[serde(default)]
  pub is_active: bool,
}

impl ModelRecord {
  pub fn validate(&self) -> Result<(), RegistryError> {
    if self.name.trim().is_empty() {
      return Err(RegistryError::InvalidRecord("name 不能为空".to_string()));
    }
    if self.weights_path.trim().is_empty() {
      return Err(RegistryError::InvalidRecord(
        "weights_path 不能为空".to_string(),
      ));
    }
    Ok(())
  }

  /// 权重路径既可以是 `onnx://` URL，也可以是普通文件路径
  pub fn detector_spec(&self) -> Result<DetectorSpec, ModelError> {
    self.weights_path.parse()
  }
}

/// 启用的排在最前，其次构建日期新的在前，最后按名称升序
fn registry_order(a: &ModelRecord, b: &ModelRecord) -> Ordering {
  b.is_active
    .cmp(&a.is_active)
    .then_with(|| b.date_built.cmp(&a.date_built))
    .then_with(|| a.name.cmp(&b.name))
}

/// 以 JSON 文件持久化的模型登记表。
/// 任意时刻至多一条记录处于启用状态，每次修改后整体原子写回。
#[derive(Debug, Default)]
pub struct ModelRegistry {
  path: Option<PathBuf>,
  records: Vec<ModelRecord>,
}

impl ModelRegistry {
  /// 仅存在于内存中的登记表
  pub fn in_memory() -> Self {
    Self::default()
  }

  /// 打开登记表文件，文件不存在时视为空表
  pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
    let path = path.as_ref().to_path_buf();
    let records = match fs::read(&path) {
      Ok(bytes) => {
        serde_json::from_slice::<Vec<ModelRecord>>(&bytes).map_err(|source| {
          RegistryError::Corrupt {
            path: path.clone(),
            source,
          }
        })?
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
      Err(e) => return Err(e.into()),
    };

    let mut registry = Self {
      path: Some(path),
      records,
    };
    registry.normalize();
    info!(
      "模型登记表已加载: {} 条记录",
      registry.records.len()
    );
    Ok(registry)
  }

  pub fn list(&self) -> &[ModelRecord] {
    &self.records
  }

  pub fn get(&self, name: &str) -> Option<&ModelRecord> {
    self.records.iter().find(|r| r.name == name)
  }

  pub fn active(&self) -> Option<&ModelRecord> {
    self.records.iter().find(|r| r.is_active)
  }

  /// 新增或按名称替换记录。保存启用的记录会停用其余所有记录；
  /// 当前启用的记录不能通过替换被停用。
  pub fn upsert(&mut self, record: ModelRecord) -> Result<&ModelRecord, RegistryError> {
    record.validate()?;
    if !record.is_active && self.get(&record.name).is_some_and(|r| r.is_active) {
      return Err(RegistryError::DeactivateActive(record.name));
    }
    let mut next = self.records.clone();
    if record.is_active {
      next.iter_mut().for_each(|r| r.is_active = false);
    }
    let name = record.name.clone();
    match next.iter_mut().find(|r| r.name == name) {
      Some(existing) => *existing = record,
      None => next.push(record),
    }
    self.commit(next)?;
    debug!("模型记录已保存: {}", name);
    self.get(&name).ok_or(RegistryError::NotFound(name))
  }

  pub fn activate(&mut self, name: &str) -> Result<&ModelRecord, RegistryError> {
    if self.get(name).is_none() {
      return Err(RegistryError::NotFound(name.to_string()));
    }
    let mut next = self.records.clone();
    next
      .iter_mut()
      .for_each(|r| r.is_active = r.name == name);
    self.commit(next)?;
    info!("已启用模型: {}", name);
    self.get(name).ok_or_else(|| RegistryError::NotFound(name.to_string()))
  }

  pub fn remove(&mut self, name: &str) -> Result<ModelRecord, RegistryError> {
    let record = self
      .get(name)
      .cloned()
      .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
    if record.is_active {
      return Err(RegistryError::ActiveModel(name.to_string()));
    }
    let next = self
      .records
      .iter()
      .filter(|r| r.name != name)
      .cloned()
      .collect();
    self.commit(next)?;
    info!("已删除模型记录: {}", name);
    Ok(record)
  }

  // 先写入文件，成功后才替换内存中的记录
  fn commit(&mut self, mut next: Vec<ModelRecord>) -> Result<(), RegistryError> {
    next.sort_by(registry_order);
    if let Some(path) = &self.path {
      let bytes = serde_json::to_vec_pretty(&next).map_err(RegistryError::Serialize)?;
      let tmp = path.with_extension("json.tmp");
      if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
      }
      fs::write(&tmp, bytes)?;
      fs::rename(&tmp, path)?;
    }
    self.records = next;
    Ok(())
  }

  // 文件中若出现多条启用记录，只保留排序后的第一条
  fn normalize(&mut self) {
    self.records.sort_by(|a, b| {
      b.date_built
        .cmp(&a.date_built)
        .then_with(|| a.name.cmp(&b.name))
    });
    let mut seen_active = false;
    for r in self.records.iter_mut() {
      if r.is_active {
        r.is_active = !seen_active;
        seen_active = true;
      }
    }
    self.records.sort_by(registry_order);
  }
}

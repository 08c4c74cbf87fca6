// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/bin/pingpu_detect.rs - 单张图像检测命令行工具
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

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use clap::Parser;
use tracing::{info, warn};

use pingpu::{
  config::{InferenceArgs, init_tracing},
  model::{DetectorSpec, Device},
  task::run_on_bytes,
};

/// Pingpu 单张图像检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型
  /// 支持格式:
  /// - onnx:///path/to/best.onnx?device=cpu&classes=car,truck
  /// - /path/to/best.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: String,

  /// 输入图片路径
  #[arg(long, value_name = "FILE")]
  pub input: PathBuf,

  /// 标注结果图片输出路径 (JPEG)
  #[arg(long, value_name = "FILE")]
  pub output: Option<PathBuf>,

  /// 推理设备: auto, cpu, cuda, cuda:N, N
  #[arg(long, default_value = "auto", value_name = "DEVICE")]
  pub device: Device,

  /// 在输出的 JSON 中保留 base64 标注图
  #[arg(long)]
  pub embed_image: bool,

  /// 以 JSON 格式输出日志
  #[arg(long)]
  pub log_json: bool,

  #[command(flatten)]
  pub inference: InferenceArgs,
}

fn main() -> Result<()> {
  let args = Args::parse();
  init_tracing(args.log_json);

  info!("模型: {}", args.model);
  info!("输入图片: {}", args.input.display());

  let annotate = args.output.is_some() || args.embed_image;
  let params = args.inference.to_params(annotate)?;
  let spec: DetectorSpec = args.model.parse()?;
  let provider = spec.load(args.device)?;

  let bytes = fs::read(&args.input)
    .with_context(|| format!("无法读取输入图片 {}", args.input.display()))?;
  let mut result = run_on_bytes(&bytes, provider.detector(), &params)?;

  if let Some(output) = &args.output {
    match &result.image_b64 {
      Some(encoded) => {
        let jpeg = STANDARD.decode(encoded)?;
        fs::write(output, jpeg)
          .with_context(|| format!("无法写入标注图片 {}", output.display()))?;
        info!("标注图片已保存: {}", output.display());
      }
      None => warn!("没有可保存的标注图片"),
    }
  }
  if !args.embed_image {
    result.image_b64 = None;
  }

  println!("{}", serde_json::to_string_pretty(&result)?);
  Ok(())
}

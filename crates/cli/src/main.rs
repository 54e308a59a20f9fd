use std::{path::PathBuf, str::FromStr};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use layers::Layer;
use model::{ModelConfig, VideoClassifier};
use serde_json::{Map, Value};

#[derive(Parser, Debug)]
#[command(
    name = "videoclf",
    author,
    version,
    about = "Build a video classifier from a config and run it on synthetic frames",
    long_about = None
)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to a TOML or JSON model config")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a configuration value using a dot-separated path"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, default_value_t = 2, help = "Number of synthetic videos")]
    batch: usize,

    #[arg(long, help = "Frames per video; defaults to max_frames")]
    frames: Option<usize>,

    #[arg(long, help = "Evaluate with dropout and batch statistics enabled")]
    train: bool,

    #[arg(long, help = "Print the resolved configuration as TOML")]
    print_config: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: Value,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (path, raw) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        let path = path.trim();
        if path.is_empty() {
            return Err("override key must not be empty".into());
        }
        let raw = raw.trim();
        // Bare words that are not JSON literals are taken as strings.
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok(Self {
            path: path.to_string(),
            value,
        })
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("videoclf failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = ModelConfig::from_path(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
    }
    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let classifier = VideoClassifier::new(&config, vb)?;

    let parameters: usize = varmap.all_vars().iter().map(|var| var.elem_count()).sum();
    log::info!("{} parameters in {} tensors", parameters, varmap.all_vars().len());

    let frames = args.frames.unwrap_or(config.max_frames);
    let inputs = Tensor::randn(0f32, 1.0, (args.batch, frames, config.feature_size), &device)?;
    let predictions = classifier
        .forward_t(&inputs, args.train)
        .context("forward pass failed")?;
    let penalty = classifier.regularization_loss()?.to_vec0::<f32>()?;

    println!("input        {:?}", inputs.dims());
    println!("pooled dim   {}", config.pooled_dim());
    println!("predictions  {:?}", predictions.dims());
    println!("parameters   {parameters}");
    println!("l2 penalty   {penalty:.3e}");
    for (video, row) in predictions.to_vec2::<f32>()?.iter().enumerate() {
        let (class, score) = row
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });
        println!("video {video}: top class {class} ({score:.4})");
    }
    Ok(())
}

fn apply_overrides(config: ModelConfig, overrides: &[OverrideArg]) -> Result<ModelConfig> {
    let mut value = serde_json::to_value(config).context("failed to serialize config for overrides")?;
    for override_arg in overrides {
        set_value_at_path(&mut value, &override_arg.path, override_arg.value.clone())?;
    }
    serde_json::from_value(value).context("failed to deserialize config after overrides")
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<()> {
    let mut current = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let object = current
            .as_object_mut()
            .ok_or_else(|| anyhow!("override path segment '{segment}' points to a non-object value"))?;
        if segments.peek().is_none() {
            object.insert(segment.to_string(), new_value);
            return Ok(());
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    bail!("override path must not be empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_values_parse_as_json_or_string() {
        let number: OverrideArg = "head.num_mixtures=4".parse().unwrap();
        assert_eq!(number.path, "head.num_mixtures");
        assert_eq!(number.value, Value::from(4));

        let word: OverrideArg = "pooling.method = gem".parse().unwrap();
        assert_eq!(word.value, Value::String("gem".into()));

        assert!("=3".parse::<OverrideArg>().is_err());
        assert!("missing".parse::<OverrideArg>().is_err());
    }

    #[test]
    fn nested_paths_are_created() -> Result<()> {
        let mut value = serde_json::json!({ "gate": null, "num_classes": 3 });
        set_value_at_path(&mut value, "gate.kind", Value::from("mlp"))?;
        set_value_at_path(&mut value, "num_classes", Value::from(5))?;
        assert_eq!(value, serde_json::json!({ "gate": { "kind": "mlp" }, "num_classes": 5 }));

        assert!(set_value_at_path(&mut value, "num_classes.inner", Value::from(1)).is_err());
        Ok(())
    }
}

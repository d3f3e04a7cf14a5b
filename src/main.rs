//! knowledge-circuits CLI: assemble a circuit-discovery experiment and
//! report its metrics on the unpatched and fully patched model

use anyhow::Result;
use candle_core::Tensor;
use clap::{Parser, ValueEnum};
use knowledge_circuits::metrics::scalar;
use knowledge_circuits::{
    device_from_str, get_all_knowledge_things, one_item_per_batch, DataConfig, ExperimentConfig,
    HookPoint, Hooks, KnowledgeType, MaskSource, Metric,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Clone, Copy, ValueEnum)]
enum MaskArg {
    /// Repeat-candidate mask from the data files
    Repeat,
    /// Positions predicting the dataset answers
    Answers,
}

#[derive(Parser)]
#[command(name = "knowledge-circuits")]
#[command(about = "Assemble knowledge-circuit experiments and evaluate their metrics")]
#[command(version)]
struct Cli {
    /// Model name, alias (gptj, neox, llama) or local directory
    #[arg(short, long, default_value = "gpt2")]
    model: String,

    /// Examples per split
    #[arg(short, long, default_value_t = 10)]
    num_examples: usize,

    #[arg(long, default_value_t = 300)]
    seq_len: usize,

    /// kl_div, nll or match_nll
    #[arg(long, default_value = "kl_div")]
    metric: String,

    /// Seed for shuffling patch data
    #[arg(long, default_value_t = 42)]
    data_seed: u64,

    /// factual, commonsense, linguistic or bias
    #[arg(long, default_value = "factual")]
    knowledge_type: KnowledgeType,

    #[arg(long, default_value_t = 1)]
    nb_templates: usize,

    #[arg(long, default_value_t = 0)]
    dataset_seed: u64,

    #[arg(long, value_enum, default_value_t = MaskArg::Repeat)]
    mask: MaskArg,

    /// Directory holding the validation data and mask files
    #[arg(long, conflicts_with = "data_repo")]
    data_dir: Option<PathBuf>,

    /// Hub repository to download the data files from
    #[arg(long)]
    data_repo: Option<String>,

    /// Report one validation loss per position instead of the mean
    #[arg(long)]
    per_position: bool,

    /// cpu, cuda, cuda:N or metal
    #[arg(long, default_value = "cpu")]
    device: String,

    /// Write a JSON report here
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct Report {
    config: ExperimentConfig,
    validation_metric: f32,
    test_unpatched: BTreeMap<String, f32>,
    test_patched: BTreeMap<String, f32>,
    expanded_rows: usize,
    expanded_kl: f32,
}

/// Scalar value of a metric, averaging unreduced outputs
fn summarize(value: &Tensor) -> Result<f32> {
    if value.rank() == 0 {
        scalar(value)
    } else {
        scalar(&value.mean_all()?)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data = match (cli.data_dir, cli.data_repo) {
        (Some(dir), _) => DataConfig::local(dir),
        (None, Some(repo)) => DataConfig::hub(repo),
        (None, None) => DataConfig::default(),
    };
    let config = ExperimentConfig {
        num_examples: cli.num_examples,
        seq_len: cli.seq_len,
        model: cli.model,
        data_seed: cli.data_seed,
        metric: cli.metric,
        return_one_element: !cli.per_position,
        knowledge_type: cli.knowledge_type,
        nb_templates: cli.nb_templates,
        dataset_seed: cli.dataset_seed,
        mask_source: match cli.mask {
            MaskArg::Repeat => MaskSource::RepeatCandidates,
            MaskArg::Answers => MaskSource::AnswerPositions,
        },
        data,
    };

    println!("=== knowledge-circuits ===");
    println!("Model:    {}", config.model);
    println!("Examples: {} per split", config.num_examples);
    println!("Metric:   {}", config.metric);

    let device = device_from_str(&cli.device)?;
    let things = get_all_knowledge_things(&config, &device)?;
    let model = &things.model;
    println!("Params:   {}", model.model().n_params());

    // Unpatched model
    let validation_logits = model.forward(&things.validation_data)?;
    let validation_metric = summarize(&things.validation_metric.evaluate(&validation_logits)?)?;

    let test_logits = model.forward(&things.test_data)?;
    let mut test_unpatched = BTreeMap::new();
    for (kind, metric) in &things.test_metrics {
        test_unpatched.insert(kind.to_string(), summarize(&metric.evaluate(&test_logits)?)?);
    }

    // Fully patched: the final residual stream comes from the patch data
    let last = HookPoint::ResidPost(model.n_layers() - 1);
    let mut patch_hooks = Hooks::new().cache_only([last]);
    model.run_with_hooks(&things.test_patch_data, &mut patch_hooks)?;
    let patch_cache = patch_hooks
        .take_cache()
        .ok_or_else(|| anyhow::anyhow!("Patch run recorded nothing"))?;
    let mut hooks = Hooks::new().patch(last, patch_cache.require(last)?.clone());
    let patched_logits = model.run_with_hooks(&things.test_data, &mut hooks)?;
    let mut test_patched = BTreeMap::new();
    for (kind, metric) in &things.test_metrics {
        test_patched.insert(kind.to_string(), summarize(&metric.evaluate(&patched_logits)?)?);
    }
    info!("Patched forward pass done");

    // Per-target view of the validation split
    let expanded = one_item_per_batch(
        &things.validation_data,
        &things.validation_patch_data,
        &things.validation_mask,
        &things.validation_logprobs,
    )?;
    let expanded_kl = summarize(&expanded.metric.evaluate(&model.forward(&expanded.toks)?)?)?;

    println!("\n=== Results ===");
    println!("Validation {}: {:.4}", config.metric, validation_metric);
    for (name, value) in &test_unpatched {
        println!("Test {name:>10}: {value:.4} (patched: {:.4})", test_patched[name]);
    }
    println!(
        "Expanded {} targets, mean KL {:.4}",
        expanded.len(),
        expanded_kl
    );

    if let Some(path) = cli.output {
        let report = Report {
            config,
            validation_metric,
            test_unpatched,
            test_patched,
            expanded_rows: expanded.len(),
            expanded_kl,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        info!("Report saved to {}", path.display());
    }

    Ok(())
}

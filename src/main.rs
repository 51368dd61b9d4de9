//! Command-line front end.
//!
//! ```bash
//! # Train the reference model on a text file
//! puck train --data input.txt --preset shakespeare --checkpoint puck.ckpt --log metrics.csv
//!
//! # Quick experiment with overrides
//! puck train --data input.txt --preset tiny --steps 2000 --grad-clip 1.0 --nonfinite skip
//!
//! # Continue an interrupted run
//! puck train --data input.txt --resume puck.ckpt --checkpoint puck.ckpt
//!
//! # Sample from a trained model
//! puck generate --checkpoint puck.ckpt --prompt "ROMEO:" --tokens 500 --temperature 0.8
//!
//! # List presets
//! puck presets
//! ```
//!
//! Log verbosity follows `RUST_LOG` and defaults to `info`.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use puck::{
    generate_text, Activation, Checkpoint, DataSplit, Device, Gpt, NonFinitePolicy, RunConfig,
    Trainer, TrainingLogger, Vocabulary, PRESETS,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "puck", about = "Train and sample a character-level GPT", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model on a text corpus
    Train(TrainArgs),
    /// Generate text from a checkpoint
    Generate(GenerateArgs),
    /// List the named presets
    Presets,
}

#[derive(Args)]
struct TrainArgs {
    /// Path to the training text
    #[arg(long, default_value = "input.txt")]
    data: PathBuf,

    /// Named preset (see `puck presets`)
    #[arg(long, default_value = "tiny", conflicts_with = "config")]
    preset: String,

    /// JSON run configuration instead of a preset
    #[arg(long)]
    config: Option<PathBuf>,

    /// Continue from this checkpoint (model, vocabulary and optimizer state)
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Write a checkpoint here after every evaluation
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Append evaluation metrics to this CSV file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Prompt for the sample generated at each evaluation
    /// [default: newline, or the first vocabulary character if the corpus has none]
    #[arg(long)]
    sample_prompt: Option<String>,

    // Model architecture
    /// Context window length
    #[arg(long)]
    context: Option<usize>,

    /// Embedding width
    #[arg(long)]
    embd: Option<usize>,

    /// Attention heads per block
    #[arg(long)]
    heads: Option<usize>,

    /// Transformer blocks
    #[arg(long)]
    layers: Option<usize>,

    /// Dropout probability
    #[arg(long)]
    dropout: Option<f32>,

    /// Feed-forward nonlinearity (relu or gelu)
    #[arg(long)]
    activation: Option<Activation>,

    // Optimization
    /// Sequences per step
    #[arg(long)]
    batch_size: Option<usize>,

    /// Learning rate
    #[arg(long)]
    lr: Option<f32>,

    /// Total training iterations
    #[arg(long)]
    steps: Option<usize>,

    /// Iterations between loss estimates
    #[arg(long)]
    eval_interval: Option<usize>,

    /// Batches averaged per loss estimate
    #[arg(long)]
    eval_iters: Option<usize>,

    /// Weight decay for weight matrices
    #[arg(long)]
    weight_decay: Option<f32>,

    /// Clip the global gradient norm
    #[arg(long)]
    grad_clip: Option<f32>,

    /// What to do with a non-finite loss or gradient (abort or skip)
    #[arg(long)]
    nonfinite: Option<NonFinitePolicy>,

    /// Fraction of the corpus held out for validation
    #[arg(long)]
    val_fraction: Option<f32>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Compute device
    #[arg(long)]
    device: Option<Device>,
}

#[derive(Args)]
struct GenerateArgs {
    /// Checkpoint to load
    #[arg(long)]
    checkpoint: PathBuf,

    /// Text to continue
    #[arg(long, default_value = "\n")]
    prompt: String,

    /// Number of characters to generate
    #[arg(long)]
    tokens: Option<usize>,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Write the prompt's attention weights as JSON to this file
    #[arg(long)]
    dump_attention: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Train(args) => train(args),
        Command::Generate(args) => generate(args),
        Command::Presets => {
            print_presets();
            Ok(())
        }
    }
}

fn print_presets() {
    println!("{:<12} DESCRIPTION", "NAME");
    for (name, description) in PRESETS {
        println!("{name:<12} {description}");
    }
}

/// Preset or JSON file, with command-line overrides applied on top.
fn resolve_config(args: &TrainArgs) -> Result<RunConfig> {
    let mut run = match &args.config {
        Some(path) => RunConfig::from_json_file(path)
            .with_context(|| format!("reading run configuration {}", path.display()))?,
        None => RunConfig::preset(&args.preset)?,
    };

    let model = &mut run.model;
    if let Some(v) = args.context {
        model.context_length = v;
    }
    if let Some(v) = args.embd {
        model.n_embd = v;
    }
    if let Some(v) = args.heads {
        model.n_head = v;
    }
    if let Some(v) = args.layers {
        model.n_layer = v;
    }
    if let Some(v) = args.dropout {
        model.dropout = v;
    }
    if let Some(v) = args.activation {
        model.activation = v;
    }

    let train = &mut run.train;
    if let Some(v) = args.batch_size {
        train.batch_size = v;
    }
    if let Some(v) = args.lr {
        train.learning_rate = v;
    }
    if let Some(v) = args.steps {
        train.max_iters = v;
    }
    if let Some(v) = args.eval_interval {
        train.eval_interval = v;
    }
    if let Some(v) = args.eval_iters {
        train.eval_iters = v;
    }
    if let Some(v) = args.weight_decay {
        train.weight_decay = v;
    }
    if args.grad_clip.is_some() {
        train.grad_clip = args.grad_clip;
    }
    if let Some(v) = args.nonfinite {
        train.non_finite = v;
    }
    if let Some(v) = args.val_fraction {
        train.val_fraction = v;
    }
    if let Some(v) = args.seed {
        train.seed = v;
    }
    if let Some(v) = args.device {
        train.device = v;
    }
    Ok(run)
}

fn train(args: TrainArgs) -> Result<()> {
    let text = fs::read_to_string(&args.data)
        .with_context(|| format!("reading corpus {}", args.data.display()))?;
    info!(
        "loaded {} ({} characters)",
        args.data.display(),
        text.chars().count()
    );

    let mut run = resolve_config(&args)?;

    let mut trainer = match &args.resume {
        Some(path) => {
            let checkpoint = Checkpoint::load(path)
                .with_context(|| format!("loading checkpoint {}", path.display()))?;
            // Architecture comes from the checkpoint; only the schedule can change.
            run.model = checkpoint.model.config().clone();
            run.validate()?;
            Trainer::resume(checkpoint, run.train.clone())?
        }
        None => {
            let vocab = Vocabulary::from_text(&text);
            run.model.vocab_size = vocab.len();
            run.validate()?;
            info!("vocabulary: {} characters", vocab.len());

            let mut rng = StdRng::seed_from_u64(run.train.seed);
            let model = Gpt::new(&run.model, &mut rng)?;
            Trainer::new(model, vocab, run.train.clone())?
        }
    };

    let tokens = trainer
        .vocab
        .encode(&text)
        .context("corpus contains characters outside the vocabulary")?;
    let data = DataSplit::new(tokens, run.train.val_fraction);

    if let Some(path) = &args.log {
        let logger = TrainingLogger::create(path)
            .with_context(|| format!("creating metrics log {}", path.display()))?;
        trainer = trainer.with_logger(logger);
    }
    if let Some(path) = &args.checkpoint {
        trainer = trainer.with_checkpoint(path);
    }
    let sample_prompt = match &args.sample_prompt {
        Some(prompt) => prompt.clone(),
        None if trainer.vocab.id('\n').is_some() => "\n".to_string(),
        None => trainer
            .vocab
            .chars()
            .first()
            .map(char::to_string)
            .unwrap_or_default(),
    };
    trainer = trainer
        .with_sample_prompt(&sample_prompt)
        .with_context(|| format!("invalid sample prompt {sample_prompt:?}"))?;

    info!(
        "model: {} layers, {} heads, width {}, context {} ({} parameters)",
        run.model.n_layer,
        run.model.n_head,
        run.model.n_embd,
        run.model.context_length,
        trainer.model.num_parameters()
    );

    let summary = trainer.train(&data)?;
    info!(
        "done: {} steps applied, {} skipped, final train {:.4} / val {:.4}",
        summary.steps_applied,
        summary.steps_skipped,
        summary.final_loss.train,
        summary.final_loss.val
    );
    if let Some(best) = summary.best_val_loss {
        info!("best validation loss {best:.4}");
    }
    Ok(())
}

fn generate(args: GenerateArgs) -> Result<()> {
    let checkpoint = Checkpoint::load(&args.checkpoint)
        .with_context(|| format!("loading checkpoint {}", args.checkpoint.display()))?;

    let mut config = puck::GenerationConfig::default();
    if let Some(v) = args.tokens {
        config.max_new_tokens = v;
    }
    if let Some(v) = args.temperature {
        config.temperature = v;
    }
    if let Some(v) = args.seed {
        config.seed = v;
    }
    config.validate()?;

    if args.prompt.is_empty() {
        bail!("the prompt must contain at least one character");
    }

    if let Some(path) = &args.dump_attention {
        let ids = checkpoint
            .vocab
            .encode(&args.prompt)
            .context("prompt contains characters outside the vocabulary")?;
        let context_length = checkpoint.model.config().context_length;
        let window = &ids[ids.len().saturating_sub(context_length)..];
        let maps = checkpoint.model.attention_maps(window)?;
        fs::write(path, serde_json::to_string_pretty(&maps)?)
            .with_context(|| format!("writing attention maps to {}", path.display()))?;
        info!("wrote attention maps to {}", path.display());
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let text = generate_text(
        &checkpoint.model,
        &checkpoint.vocab,
        &args.prompt,
        config.max_new_tokens,
        config.temperature,
        &mut rng,
    )?;
    println!("{text}");
    Ok(())
}

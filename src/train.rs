//! Training
//!
//! ## One Step
//!
//! ```text
//! batch → forward (train mode) → loss → backward → [clip] → check → AdamW
//! ```
//!
//! Gradients are produced fresh by every backward pass, so there is nothing
//! to reset between steps. The loss and the global gradient norm are checked
//! before the optimizer runs: a NaN or infinity anywhere either aborts the run
//! or skips the batch ([`NonFinitePolicy`]), and in both cases parameters and
//! optimizer moments are left exactly as they were.
//!
//! ## The Loop
//!
//! [`Trainer::train`] runs `max_iters` steps on random training batches. The
//! loss on both splits is estimated in evaluation mode at iteration 0, every
//! `eval_interval` iterations and once more after the last step. Each
//! estimate is logged, optionally written to the CSV log, and optionally
//! followed by a checkpoint.

use crate::checkpoint::Checkpoint;
use crate::config::{NonFinitePolicy, TrainConfig};
use crate::data::{Batch, BatchSampler, DataSplit, Split};
use crate::error::{ModelError, Result};
use crate::generate::generate;
use crate::gradients::{clip_gradients, compute_grad_norm};
use crate::layers::Mode;
use crate::model::{Gpt, GptGradients};
use crate::optimizer::{AdamW, AdamWConfig};
use crate::training_logger::{EvalRecord, TrainingLogger};
use crate::vocab::Vocabulary;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

/// Characters generated for the sample shown at each evaluation.
const SAMPLE_TOKENS: usize = 100;

/// Result of a single training step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepOutcome {
    /// Parameters were updated.
    Applied { loss: f32, grad_norm: f32 },
    /// A non-finite value was found and the batch was dropped.
    Skipped { context: &'static str },
}

/// One optimization step on `batch`.
///
/// # Errors
///
/// Contract errors from the model, or [`ModelError::NonFinite`] under
/// [`NonFinitePolicy::Abort`].
pub fn training_step<R: Rng + ?Sized>(
    model: &mut Gpt,
    optimizer: &mut AdamW,
    batch: &Batch,
    config: &TrainConfig,
    rng: &mut R,
) -> Result<StepOutcome> {
    let (loss, grads) =
        match model.loss_and_gradients(&batch.inputs, &batch.targets, Mode::Train, rng) {
            Ok(result) => result,
            Err(ModelError::NonFinite { context }) => {
                return non_finite(config.non_finite, context)
            }
            Err(e) => return Err(e),
        };
    apply_gradients(model, optimizer, loss, grads, config)
}

/// Second half of [`training_step`]: optional clipping, the gradient norm
/// check, then the AdamW update.
pub fn apply_gradients(
    model: &mut Gpt,
    optimizer: &mut AdamW,
    loss: f32,
    mut grads: GptGradients,
    config: &TrainConfig,
) -> Result<StepOutcome> {
    let grad_norm = match config.grad_clip {
        Some(max_norm) => clip_gradients(&mut grads, max_norm),
        None => compute_grad_norm(&grads),
    };
    if !grad_norm.is_finite() {
        return non_finite(config.non_finite, "gradient norm");
    }

    optimizer.update(model, &grads, config.learning_rate)?;
    Ok(StepOutcome::Applied { loss, grad_norm })
}

fn non_finite(policy: NonFinitePolicy, context: &'static str) -> Result<StepOutcome> {
    match policy {
        NonFinitePolicy::Abort => Err(ModelError::NonFinite { context }),
        NonFinitePolicy::Skip => {
            warn!("non-finite {context}; skipping batch without updating parameters");
            Ok(StepOutcome::Skipped { context })
        }
    }
}

/// Mean loss on each split.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossEstimate {
    pub train: f32,
    pub val: f32,
}

/// Average the loss over `eval_iters` random batches from each split, with
/// dropout disabled.
pub fn estimate_loss<R: Rng + ?Sized>(
    model: &Gpt,
    data: &DataSplit,
    sampler: &BatchSampler,
    eval_iters: usize,
    rng: &mut R,
) -> Result<LossEstimate> {
    let mut mean = |split: Split| -> Result<f32> {
        let mut total = 0.0;
        for _ in 0..eval_iters {
            let batch = sampler.sample_split(data, split, rng)?;
            let (_, loss) = model.forward(&batch.inputs, Some(&batch.targets), Mode::Eval, rng)?;
            total += loss.unwrap_or(f32::NAN);
        }
        Ok(total / eval_iters as f32)
    };
    let train = mean(Split::Train)?;
    let val = mean(Split::Val)?;
    Ok(LossEstimate { train, val })
}

/// Totals reported at the end of [`Trainer::train`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainSummary {
    pub steps_applied: usize,
    pub steps_skipped: usize,
    pub final_loss: LossEstimate,
    pub best_val_loss: Option<f32>,
}

/// Owns everything that changes during training.
pub struct Trainer {
    pub model: Gpt,
    pub optimizer: AdamW,
    pub vocab: Vocabulary,
    pub config: TrainConfig,
    /// Iterations completed, including skipped ones
    pub step: usize,
    pub best_val_loss: Option<f32>,
    /// Step of the most recent loss estimate
    last_eval_step: Option<usize>,
    rng: StdRng,
    logger: Option<TrainingLogger>,
    checkpoint_path: Option<PathBuf>,
    sample_seed: Option<Vec<usize>>,
}

impl Trainer {
    /// Start a fresh run.
    pub fn new(model: Gpt, vocab: Vocabulary, config: TrainConfig) -> Result<Self> {
        Self::check_vocab(&model, &vocab)?;
        config.validate()?;
        let optimizer = AdamW::new(
            &model,
            AdamWConfig {
                weight_decay: config.weight_decay,
                ..AdamWConfig::default()
            },
        );
        Ok(Self::assemble(model, optimizer, vocab, config, 0, None, None))
    }

    /// Continue a run from a checkpoint. Missing optimizer state starts from zero.
    pub fn resume(checkpoint: Checkpoint, config: TrainConfig) -> Result<Self> {
        Self::check_vocab(&checkpoint.model, &checkpoint.vocab)?;
        config.validate()?;
        let optimizer = match checkpoint.optimizer {
            Some(mut opt) => {
                opt.config.weight_decay = config.weight_decay;
                opt
            }
            None => AdamW::new(
                &checkpoint.model,
                AdamWConfig {
                    weight_decay: config.weight_decay,
                    ..AdamWConfig::default()
                },
            ),
        };
        info!("resuming from step {}", checkpoint.step);
        Ok(Self::assemble(
            checkpoint.model,
            optimizer,
            checkpoint.vocab,
            config,
            checkpoint.step,
            checkpoint.best_val_loss,
            checkpoint.last_eval_step,
        ))
    }

    fn assemble(
        model: Gpt,
        optimizer: AdamW,
        vocab: Vocabulary,
        config: TrainConfig,
        step: usize,
        best_val_loss: Option<f32>,
        last_eval_step: Option<usize>,
    ) -> Self {
        // Offset by the step so a resumed run does not replay the same batches.
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(step as u64));
        Self {
            model,
            optimizer,
            vocab,
            config,
            step,
            best_val_loss,
            last_eval_step,
            rng,
            logger: None,
            checkpoint_path: None,
            sample_seed: None,
        }
    }

    fn check_vocab(model: &Gpt, vocab: &Vocabulary) -> Result<()> {
        if model.config().vocab_size != vocab.len() {
            return Err(ModelError::Config(format!(
                "model vocab_size {} does not match vocabulary of {} characters",
                model.config().vocab_size,
                vocab.len()
            )));
        }
        Ok(())
    }

    /// Append every evaluation to a CSV log.
    pub fn with_logger(mut self, logger: TrainingLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Save a checkpoint after every evaluation.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Generate a short sample from `prompt` at every evaluation.
    ///
    /// # Errors
    ///
    /// [`ModelError::UnknownChar`] if the prompt uses a character outside the
    /// vocabulary, or [`ModelError::Shape`] if it is empty.
    pub fn with_sample_prompt(mut self, prompt: &str) -> Result<Self> {
        let ids = self.vocab.encode(prompt)?;
        if ids.is_empty() {
            return Err(ModelError::shape(
                "sample prompt",
                "at least one character",
                "0 characters",
            ));
        }
        self.sample_seed = Some(ids);
        Ok(self)
    }

    /// Run until `config.max_iters` iterations are complete.
    pub fn train(&mut self, data: &DataSplit) -> Result<TrainSummary> {
        let sampler = BatchSampler::new(self.config.batch_size, self.model.config().context_length);
        info!(
            "training {} parameters for {} iterations on {} ({} train / {} val tokens)",
            self.model.num_parameters(),
            self.config.max_iters,
            self.config.device,
            data.tokens(Split::Train).len(),
            data.tokens(Split::Val).len()
        );

        let mut steps_applied = 0;
        let mut steps_skipped = 0;
        while self.step < self.config.max_iters {
            if self.step % self.config.eval_interval == 0 && !self.evaluated_now() {
                self.evaluate(data, &sampler)?;
            }

            let batch = sampler.sample_split(data, Split::Train, &mut self.rng)?;
            match training_step(
                &mut self.model,
                &mut self.optimizer,
                &batch,
                &self.config,
                &mut self.rng,
            )? {
                StepOutcome::Applied { loss, grad_norm } => {
                    steps_applied += 1;
                    debug!("step {} loss {loss:.4} grad norm {grad_norm:.4}", self.step);
                }
                StepOutcome::Skipped { .. } => steps_skipped += 1,
            }
            self.step += 1;
        }

        let final_loss = if self.evaluated_now() {
            // Already logged and checkpointed; only the numbers are needed.
            estimate_loss(
                &self.model,
                data,
                &sampler,
                self.config.eval_iters,
                &mut self.rng,
            )?
        } else {
            self.evaluate(data, &sampler)?
        };
        Ok(TrainSummary {
            steps_applied,
            steps_skipped,
            final_loss,
            best_val_loss: self.best_val_loss,
        })
    }

    fn evaluated_now(&self) -> bool {
        self.last_eval_step == Some(self.step)
    }

    fn evaluate(&mut self, data: &DataSplit, sampler: &BatchSampler) -> Result<LossEstimate> {
        let estimate = estimate_loss(
            &self.model,
            data,
            sampler,
            self.config.eval_iters,
            &mut self.rng,
        )?;
        if self.best_val_loss.map_or(true, |best| estimate.val < best) {
            self.best_val_loss = Some(estimate.val);
        }

        let sample = match &self.sample_seed {
            Some(seed) => {
                let ids = generate(&self.model, seed, SAMPLE_TOKENS, 1.0, &mut self.rng)?;
                Some(self.vocab.decode(&ids)?)
            }
            None => None,
        };

        let record = EvalRecord {
            step: self.step,
            learning_rate: self.config.learning_rate,
            train_loss: estimate.train,
            val_loss: estimate.val,
            sample: sample.as_deref(),
        };
        match &mut self.logger {
            Some(logger) => logger.log(&record)?,
            None => info!(
                "step {}: train loss {:.4}, val loss {:.4}",
                self.step, estimate.train, estimate.val
            ),
        }

        self.last_eval_step = Some(self.step);
        if let Some(path) = &self.checkpoint_path {
            self.checkpoint().save(path)?;
        }
        Ok(estimate)
    }

    /// Snapshot of the current state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            model: self.model.clone(),
            vocab: self.vocab.clone(),
            optimizer: Some(self.optimizer.clone()),
            step: self.step,
            best_val_loss: self.best_val_loss,
            last_eval_step: self.last_eval_step,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    const TEXT: &str = "the quick brown fox jumps over the lazy dog.\n";

    fn setup(dropout: f32) -> (Gpt, Vocabulary) {
        let vocab = Vocabulary::from_text(TEXT);
        let config = ModelConfig {
            vocab_size: vocab.len(),
            context_length: 8,
            n_embd: 16,
            n_head: 2,
            n_layer: 1,
            dropout,
            activation: Default::default(),
        };
        let model = Gpt::new(&config, &mut StdRng::seed_from_u64(0)).unwrap();
        (model, vocab)
    }

    fn corpus(vocab: &Vocabulary) -> Vec<usize> {
        vocab.encode(&TEXT.repeat(20)).unwrap()
    }

    #[test]
    fn test_overfitting_one_batch_lowers_loss() {
        let (mut model, vocab) = setup(0.0);
        let tokens = corpus(&vocab);
        let mut rng = StdRng::seed_from_u64(1);
        let batch = BatchSampler::new(4, 8).sample(&tokens, &mut rng).unwrap();
        let config = TrainConfig {
            learning_rate: 1e-2,
            ..TrainConfig::default()
        };
        let mut opt = AdamW::new(&model, AdamWConfig::default());

        let (_, before) = model
            .forward(&batch.inputs, Some(&batch.targets), Mode::Eval, &mut rng)
            .unwrap();
        for _ in 0..50 {
            let outcome = training_step(&mut model, &mut opt, &batch, &config, &mut rng).unwrap();
            assert!(matches!(outcome, StepOutcome::Applied { .. }));
        }
        let (_, after) = model
            .forward(&batch.inputs, Some(&batch.targets), Mode::Eval, &mut rng)
            .unwrap();

        let (before, after) = (before.unwrap(), after.unwrap());
        assert!(after < before * 0.5, "loss went from {before} to {after}");
        assert_eq!(opt.step, 50);
    }

    #[test]
    fn test_non_finite_policy_leaves_parameters_untouched() {
        let (mut model, vocab) = setup(0.0);
        let tokens = corpus(&vocab);
        let mut rng = StdRng::seed_from_u64(2);
        let batch = BatchSampler::new(2, 8).sample(&tokens, &mut rng).unwrap();

        model.lm_head.weight.data[0] = f32::NAN;
        let snapshot: Vec<_> = model.params().into_iter().cloned().collect();
        let mut opt = AdamW::new(&model, AdamWConfig::default());

        let mut config = TrainConfig::default();
        let err = training_step(&mut model, &mut opt, &batch, &config, &mut rng).unwrap_err();
        assert!(matches!(err, ModelError::NonFinite { .. }));

        config.non_finite = NonFinitePolicy::Skip;
        let outcome = training_step(&mut model, &mut opt, &batch, &config, &mut rng).unwrap();
        assert!(matches!(outcome, StepOutcome::Skipped { .. }));

        let after: Vec<_> = model.params().into_iter().cloned().collect();
        for (a, b) in snapshot.iter().zip(&after) {
            // NaN != NaN, so compare bit patterns
            let a_bits: Vec<u32> = a.data.iter().map(|v| v.to_bits()).collect();
            let b_bits: Vec<u32> = b.data.iter().map(|v| v.to_bits()).collect();
            assert_eq!(a_bits, b_bits);
        }
        assert_eq!(opt.step, 0);
        assert!(opt.m.iter().all(|m| m.data.iter().all(|&v| v == 0.0)));
    }

    #[test]
    fn test_estimate_loss_is_deterministic_without_dropout_sampling() {
        let (model, vocab) = setup(0.3);
        let data = DataSplit::new(corpus(&vocab), 0.1);
        let sampler = BatchSampler::new(4, 8);
        let a = estimate_loss(&model, &data, &sampler, 5, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = estimate_loss(&model, &data, &sampler, 5, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
        let uniform = (vocab.len() as f32).ln();
        assert!((a.train - uniform).abs() < 0.2);
        assert!((a.val - uniform).abs() < 0.2);
    }

    #[test]
    fn test_trainer_runs_schedule_and_resumes() {
        let (model, vocab) = setup(0.1);
        let data = DataSplit::new(corpus(&vocab), 0.1);
        let config = TrainConfig {
            batch_size: 4,
            learning_rate: 3e-3,
            max_iters: 30,
            eval_interval: 10,
            eval_iters: 2,
            ..TrainConfig::default()
        };

        let mut trainer = Trainer::new(model, vocab, config.clone())
            .unwrap()
            .with_sample_prompt("the")
            .unwrap();
        let summary = trainer.train(&data).unwrap();
        assert_eq!(summary.steps_applied, 30);
        assert_eq!(summary.steps_skipped, 0);
        assert_eq!(trainer.step, 30);
        assert_eq!(trainer.optimizer.step, 30);
        assert!(summary.best_val_loss.is_some());

        let resumed_config = TrainConfig {
            max_iters: 40,
            ..config
        };
        let mut resumed = Trainer::resume(trainer.checkpoint(), resumed_config).unwrap();
        let summary = resumed.train(&data).unwrap();
        assert_eq!(summary.steps_applied, 10);
        assert_eq!(resumed.optimizer.step, 40);
    }

    /// Writer that keeps everything it receives, shared with the test.
    #[derive(Clone, Default)]
    struct Shared(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Shared {
        fn logged_steps(&self) -> Vec<usize> {
            let text = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            text.lines()
                .skip(1)
                .filter_map(|row| row.split(',').next())
                .map(|step| step.parse().unwrap())
                .collect()
        }
    }

    fn snapshot(model: &Gpt) -> Vec<Vec<u32>> {
        model
            .params()
            .iter()
            .map(|t| t.data.iter().map(|v| v.to_bits()).collect())
            .collect()
    }

    #[test]
    fn test_non_finite_gradients_with_finite_loss_are_caught() {
        let (mut model, vocab) = setup(0.0);
        let tokens = corpus(&vocab);
        let mut rng = StdRng::seed_from_u64(5);
        let batch = BatchSampler::new(2, 8).sample(&tokens, &mut rng).unwrap();
        let before = snapshot(&model);
        let mut opt = AdamW::new(&model, AdamWConfig::default());

        let configs = [
            TrainConfig::default(),
            TrainConfig {
                non_finite: NonFinitePolicy::Skip,
                ..TrainConfig::default()
            },
            TrainConfig {
                non_finite: NonFinitePolicy::Skip,
                grad_clip: Some(1.0),
                ..TrainConfig::default()
            },
            TrainConfig {
                grad_clip: Some(1.0),
                ..TrainConfig::default()
            },
        ];
        for (i, config) in configs.iter().enumerate() {
            let (loss, mut grads) = model
                .loss_and_gradients(&batch.inputs, &batch.targets, Mode::Train, &mut rng)
                .unwrap();
            assert!(loss.is_finite());
            let bad = if i % 2 == 0 { f32::NAN } else { f32::INFINITY };
            grads.blocks[0].ffwd.fc1.weight.data[3] = bad;

            let result = apply_gradients(&mut model, &mut opt, loss, grads, config);
            match config.non_finite {
                NonFinitePolicy::Abort => assert!(matches!(
                    result,
                    Err(ModelError::NonFinite {
                        context: "gradient norm"
                    })
                )),
                NonFinitePolicy::Skip => assert_eq!(
                    result.unwrap(),
                    StepOutcome::Skipped {
                        context: "gradient norm"
                    }
                ),
            }
        }

        assert_eq!(snapshot(&model), before);
        assert_eq!(opt.step, 0);
        assert!(opt
            .m
            .iter()
            .chain(&opt.v)
            .all(|t| t.data.iter().all(|&v| v == 0.0)));
    }

    #[test]
    fn test_sample_prompt_outside_vocabulary_fails_before_training() {
        let text = "no newline here, just one long line of text ";
        let vocab = Vocabulary::from_text(text);
        let config = ModelConfig::tiny(vocab.len());
        let model = Gpt::new(&config, &mut StdRng::seed_from_u64(0)).unwrap();
        let trainer = Trainer::new(model, vocab, TrainConfig::default()).unwrap();

        assert!(matches!(
            trainer.with_sample_prompt("\n"),
            Err(ModelError::UnknownChar('\n'))
        ));
    }

    #[test]
    fn test_resume_does_not_repeat_the_last_evaluation() {
        let (model, vocab) = setup(0.0);
        let data = DataSplit::new(corpus(&vocab), 0.1);
        let config = TrainConfig {
            batch_size: 2,
            max_iters: 20,
            eval_interval: 10,
            eval_iters: 1,
            ..TrainConfig::default()
        };

        let first_log = Shared::default();
        let mut trainer = Trainer::new(model, vocab, config.clone())
            .unwrap()
            .with_logger(TrainingLogger::from_writer(first_log.clone()).unwrap());
        trainer.train(&data).unwrap();
        assert_eq!(first_log.logged_steps(), vec![0, 10, 20]);

        let resume = |max_iters| {
            let log = Shared::default();
            let config = TrainConfig {
                max_iters,
                ..config.clone()
            };
            let mut resumed = Trainer::resume(trainer.checkpoint(), config)
                .unwrap()
                .with_logger(TrainingLogger::from_writer(log.clone()).unwrap());
            let summary = resumed.train(&data).unwrap();
            (log.logged_steps(), summary)
        };

        let (steps, summary) = resume(30);
        assert_eq!(steps, vec![30]);
        assert_eq!(summary.steps_applied, 10);

        // Nothing left to do: the loss is reported but not logged again
        let (steps, summary) = resume(20);
        assert!(steps.is_empty());
        assert_eq!(summary.steps_applied, 0);
        assert!(summary.final_loss.val.is_finite());
    }

    #[test]
    fn test_vocab_mismatch_is_rejected() {
        let (model, _) = setup(0.0);
        let other = Vocabulary::from_text("ab");
        assert!(matches!(
            Trainer::new(model, other, TrainConfig::default()),
            Err(ModelError::Config(_))
        ));
    }
}

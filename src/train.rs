use std::{collections::BTreeMap, fs, io::IsTerminal, path::Path, sync::Arc};

use burn::{config::Config, data::{dataloader::{DataLoader, DataLoaderBuilder}, dataset::{Dataset, InMemDataset}}, grad_clipping::GradientClippingConfig, module::AutodiffModule, optim::AdamWConfig, record::CompactRecorder, tensor::{backend::AutodiffBackend, ElementConversion}, train::{metric::LossMetric, renderer::{MetricState, MetricsRenderer, TrainingProgress}, ClassificationOutput, LearnerBuilder}};
use derive_builder::Builder;
use log::{debug, info, warn};

use crate::{args::TrainingArguments, bert::{BertForMaskedLM, BertForMaskedLMConfig, DataCollatorForLanguageModeling, MlmBatch, MlmInputItem, IGNORE_INDEX}, checkpoint, data::TextDataset, error::{self, Error}};

/// Records how far the training went
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
/// Sub directory of the output dir where the learner keeps its checkpoints
pub const CHECKPOINT_DIR: &str = "checkpoint";

/// The operations the driver needs from a training loop.
pub trait LanguageModelTrainer {
    /// Trains the model, continuing the run saved in `resume_from` if there is one
    fn train(&mut self, resume_from: Option<&Path>) -> error::Result<()>;
    /// Evaluates the model on the eval dataset. The result holds at least the "loss"
    fn evaluate(&mut self) -> error::Result<BTreeMap<String, f64>>;
    /// Saves the model so that it can be reloaded from `output_dir`
    fn save_model(&self, output_dir: &Path) -> error::Result<()>;
    /// Whether this process is the one in charge of the writes
    fn is_world_master(&self) -> bool;
}

#[derive(Debug, Config)]
pub struct TrainerState {
    /// number of completed epochs
    pub epoch: usize,
}

/// A trainer built on top of burn's learner
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
pub struct BurnTrainer<B: AutodiffBackend> {
    args: TrainingArguments,
    model_config: BertForMaskedLMConfig,
    model: BertForMaskedLM<B>,
    collator: DataCollatorForLanguageModeling<B>,
    #[builder(default)]
    train_dataset: Option<TextDataset>,
    #[builder(default)]
    eval_dataset: Option<TextDataset>,
    /// when set, evaluation only reports the loss
    #[builder(default = "true")]
    prediction_loss_only: bool,
    device: B::Device,
}

impl <B: AutodiffBackend> BurnTrainer<B> {
    pub fn model(&self) -> &BertForMaskedLM<B> {
        &self.model
    }

    fn valid_loader<D>(&self, dataset: D) -> Arc<dyn DataLoader<MlmBatch<B::InnerBackend>>>
        where D: Dataset<MlmInputItem> + 'static
    {
        let mut builder = DataLoaderBuilder::new(self.collator.for_backend::<B::InnerBackend>())
            .batch_size(self.args.per_device_eval_batch_size);
        if self.args.dataloader_num_workers > 0 {
            builder = builder.num_workers(self.args.dataloader_num_workers);
        }
        builder.build(dataset)
    }

    fn train_loader(&self, dataset: TextDataset) -> Arc<dyn DataLoader<MlmBatch<B>>> {
        let mut builder = DataLoaderBuilder::new(self.collator.clone())
            .batch_size(self.args.per_device_train_batch_size)
            .shuffle(self.args.seed);
        if self.args.dataloader_num_workers > 0 {
            builder = builder.num_workers(self.args.dataloader_num_workers);
        }
        builder.build(dataset)
    }

    /// Brings the checkpoint of the run saved in `dir` where the learner looks
    /// for it. Returns the epoch to restart from.
    fn prepare_resume(&self, dir: &Path) -> error::Result<Option<usize>> {
        let state_file = dir.join(TRAINER_STATE_FILE);
        if !state_file.is_file() {
            info!("no trainer state in {}, training starts from the loaded weights", dir.display());
            return Ok(None);
        }
        let state = TrainerState::load(state_file)?;
        let from = dir.join(CHECKPOINT_DIR);
        if state.epoch == 0 || !from.is_dir() {
            warn!("no checkpoint to resume from in {}", dir.display());
            return Ok(None);
        }

        let to = self.args.output_dir.join(CHECKPOINT_DIR);
        fs::create_dir_all(&to)?;
        if fs::canonicalize(&from)? != fs::canonicalize(&to)? {
            let suffix = format!("-{}", state.epoch);
            for entry in fs::read_dir(&from)? {
                let path = entry?.path();
                let is_of_epoch = path.file_stem()
                    .map(|stem| stem.to_string_lossy().ends_with(&suffix))
                    .unwrap_or(false);
                if is_of_epoch {
                    if let Some(name) = path.file_name() {
                        fs::copy(&path, to.join(name))?;
                    }
                }
            }
        }
        info!("Continuing training from epoch {}", state.epoch);
        Ok(Some(state.epoch))
    }
}

impl <B: AutodiffBackend> LanguageModelTrainer for BurnTrainer<B> {
    fn train(&mut self, resume_from: Option<&Path>) -> error::Result<()> {
        let train = self.train_dataset.clone()
            .ok_or_else(|| Error::configuration("Trainer: training requires a train dataset (--train_data_file)."))?;
        fs::create_dir_all(&self.args.output_dir)?;
        let start = match resume_from {
            Some(dir) => self.prepare_resume(dir)?,
            None => None,
        };

        info!("***** Running training *****");
        info!("  Num examples = {}", train.len());
        info!("  Num Epochs = {}", self.args.num_train_epochs);
        info!("  Batch size = {}", self.args.per_device_train_batch_size);

        let dataloader_train = self.train_loader(train);
        let dataloader_valid = match self.eval_dataset.clone() {
            Some(eval) => self.valid_loader(eval),
            None => self.valid_loader(InMemDataset::new(Vec::new())),
        };

        let optimizer = AdamWConfig::new()
            .with_weight_decay(self.args.weight_decay as f32)
            .with_epsilon(self.args.adam_epsilon as f32)
            .with_grad_clipping(Some(GradientClippingConfig::Norm(self.args.max_grad_norm as f32)));

        let artifact_dir = self.args.output_dir.to_string_lossy().into_owned();
        let mut builder = LearnerBuilder::new(&artifact_dir)
            .metric_train_numeric(LossMetric::new())
            .metric_valid_numeric(LossMetric::new())
            .with_file_checkpointer(CompactRecorder::new())
            .with_application_logger(None)
            .devices(vec![self.device.clone()])
            .num_epochs(self.args.num_train_epochs)
            .summary();
        // the interactive dashboard needs a terminal; logs are used otherwise
        if !(std::io::stdout().is_terminal() && self.is_world_master()) {
            builder = builder.renderer(LogMetricsRenderer::default());
        }
        if let Some(epoch) = start {
            builder = builder.checkpoint(epoch);
        }

        let learner = builder.build(
            self.model.clone(),
            optimizer.init(),
            self.args.learning_rate,
        );
        self.model = learner.fit(dataloader_train, dataloader_valid);

        TrainerState::new(self.args.num_train_epochs)
            .save(self.args.output_dir.join(TRAINER_STATE_FILE))?;
        Ok(())
    }

    fn evaluate(&mut self) -> error::Result<BTreeMap<String, f64>> {
        let eval = self.eval_dataset.clone()
            .ok_or_else(|| Error::configuration("Trainer: evaluation requires an eval dataset (--eval_data_file)."))?;
        info!("***** Running evaluation *****");
        info!("  Num examples = {}", eval.len());
        info!("  Batch size = {}", self.args.per_device_eval_batch_size);

        let model = self.model.valid();
        let loader = self.valid_loader(eval);

        let mut losses = vec![];
        let (mut correct, mut total) = (0_i64, 0_i64);
        for batch in loader.iter() {
            let output = model.forward_loss(batch);
            if !self.prediction_loss_only {
                let (c, t) = prediction_hits(&output);
                correct += c;
                total += t;
            }
            losses.push(output.loss.into_scalar().elem::<f64>());
        }
        if losses.is_empty() {
            return Err(Error::configuration("the evaluation dataset is empty"));
        }

        let mut metrics = BTreeMap::new();
        metrics.insert("loss".to_string(), losses.iter().sum::<f64>() / losses.len() as f64);
        if !self.prediction_loss_only {
            metrics.insert("accuracy".to_string(), correct as f64 / total.max(1) as f64);
        }
        Ok(metrics)
    }

    fn save_model(&self, output_dir: &Path) -> error::Result<()> {
        info!("Saving model checkpoint to {}", output_dir.display());
        checkpoint::save_model(output_dir, &self.model_config, &self.model)
    }

    fn is_world_master(&self) -> bool {
        self.args.is_primary()
    }
}

/// Number of correctly predicted labels, number of labels
fn prediction_hits<B: burn::prelude::Backend>(output: &ClassificationOutput<B>) -> (i64, i64) {
    let kept = output.targets.clone().equal_elem(IGNORE_INDEX).bool_not().int();
    let predicted = output.output.clone().argmax(1).squeeze::<1>(1);
    let hits = predicted.equal(output.targets.clone()).int() * kept.clone();

    (hits.sum().into_scalar().elem::<i64>(), kept.sum().into_scalar().elem::<i64>())
}

/// Reports the training progress through the log
#[derive(Debug, Default)]
pub struct LogMetricsRenderer {
    last_loss: Option<f64>,
}

impl MetricsRenderer for LogMetricsRenderer {
    fn update_train(&mut self, state: MetricState) {
        if let MetricState::Numeric(entry, value) = state {
            if entry.name == "Loss" {
                self.last_loss = Some(value);
            }
        }
    }

    fn update_valid(&mut self, state: MetricState) {
        if let MetricState::Numeric(entry, _) = state {
            debug!("valid {} = {}", entry.name, entry.formatted);
        }
    }

    fn render_train(&mut self, item: TrainingProgress) {
        info!(
            "epoch {}/{} - iteration {} - {}/{} items - loss {:?}",
            item.epoch, item.epoch_total, item.iteration,
            item.progress.items_processed, item.progress.items_total,
            self.last_loss,
        );
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        debug!("validation of epoch {} - {}/{} items", item.epoch, item.progress.items_processed, item.progress.items_total);
    }
}

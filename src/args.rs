//! Command line arguments of the pretraining driver.
//!
//! The arguments are split in three groups: what model to start from,
//! what data to train on, and how the trainer should behave.
use std::{fmt, fs, path::PathBuf, str::FromStr};

use structopt::StructOpt;

use crate::error::{Error, Result};

/// The architectures that can be trained from scratch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Bert,
    Roberta,
    Longformer,
}

impl ModelType {
    pub const VARIANTS: &'static [&'static str] = &["bert", "roberta", "longformer"];
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bert"    => Ok(ModelType::Bert),
            "roberta" => Ok(ModelType::Roberta),
            "longformer" => Ok(ModelType::Longformer),
            other     => Err(format!("unknown model type '{other}', expected one of: {}", Self::VARIANTS.join(", "))),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::Bert    => write!(f, "bert"),
            ModelType::Roberta => write!(f, "roberta"),
            ModelType::Longformer => write!(f, "longformer"),
        }
    }
}

/// Arguments pertaining to which model/config/tokenizer we are going to fine-tune, or train from scratch.
#[derive(Debug, Clone, StructOpt)]
#[structopt(rename_all = "snake_case")]
pub struct ModelArguments {
    /// The model checkpoint for weights initialization. Point it to a missing directory and pass
    /// --model_type if you want to train a model from scratch.
    #[structopt(long, default_value = "/home/t-avic/PycharmProjects/coref_former/longformer-base-4096/")]
    pub model_name_or_path: String,
    /// If training from scratch, pass a model type from the list: bert, roberta, longformer
    #[structopt(long, possible_values = ModelType::VARIANTS, case_insensitive = true)]
    pub model_type: Option<ModelType>,
    /// Pretrained config name or path if not the same as model_name
    #[structopt(long, default_value = "/home/t-avic/PycharmProjects/coref_former/longformer-base-4096/")]
    pub config_name: String,
    /// Pretrained tokenizer name or path if not the same as model_name
    #[structopt(long, default_value = "RobertaTokenizer")]
    pub tokenizer_name: String,
    /// Where do you want to store the pretrained models downloaded from the hub
    #[structopt(long, default_value = "/home/t-avic/PycharmProjects/coref_former/finetuned")]
    pub cache_dir: String,
}

/// Arguments pertaining to what data we are going to input our model for training and eval.
#[derive(Debug, Clone, StructOpt)]
#[structopt(rename_all = "snake_case")]
pub struct DataTrainingArguments {
    /// The input training data file (a text file).
    #[structopt(long, default_value = "train.txt.src")]
    pub train_data_file: String,
    /// An optional input evaluation data file to evaluate the perplexity on (a text file).
    #[structopt(long)]
    pub eval_data_file: Option<String>,
    /// Whether distinct lines of text in the dataset are to be handled as distinct sequences.
    #[structopt(long)]
    pub line_by_line: bool,
    /// Whether only the special tokens are assigned with global attention.
    #[structopt(long)]
    pub globalize_special_tokens: bool,
    /// Train with masked-language modeling loss instead of language modeling (disable with --no_mlm).
    #[structopt(long = "no_mlm", parse(from_flag = std::ops::Not::not))]
    pub mlm: bool,
    /// Ratio of tokens to mask for masked language modeling loss
    #[structopt(long, default_value = "0.15")]
    pub mlm_probability: f64,
    /// Optional input sequence length after tokenization. The training dataset will be truncated
    /// in block of this size for training. Default to the model max input length for single
    /// sentence inputs (take into account special tokens).
    #[structopt(long, default_value = "-1", allow_hyphen_values = true)]
    pub block_size: i64,
    /// Overwrite the cached training and evaluation sets
    #[structopt(long)]
    pub overwrite_cache: bool,
}

/// Arguments pertaining to the training loop itself.
#[derive(Debug, Clone, StructOpt)]
#[structopt(rename_all = "snake_case")]
pub struct TrainingArguments {
    /// The output directory where the model predictions and checkpoints will be written.
    #[structopt(long, parse(from_os_str))]
    pub output_dir: PathBuf,
    /// Overwrite the content of the output directory.
    #[structopt(long)]
    pub overwrite_output_dir: bool,
    /// Whether to run training.
    #[structopt(long)]
    pub do_train: bool,
    /// Whether to run eval on the dev set.
    #[structopt(long)]
    pub do_eval: bool,
    /// Batch size per device for training.
    #[structopt(long, default_value = "8")]
    pub per_device_train_batch_size: usize,
    /// Batch size per device for evaluation.
    #[structopt(long, default_value = "8")]
    pub per_device_eval_batch_size: usize,
    /// The initial learning rate for AdamW.
    #[structopt(long, default_value = "5e-5")]
    pub learning_rate: f64,
    /// Weight decay for AdamW if we apply some.
    #[structopt(long, default_value = "0.0")]
    pub weight_decay: f64,
    /// Epsilon for AdamW optimizer.
    #[structopt(long, default_value = "1e-8")]
    pub adam_epsilon: f64,
    /// Max gradient norm.
    #[structopt(long, default_value = "1.0")]
    pub max_grad_norm: f64,
    /// Total number of training epochs to perform.
    #[structopt(long, default_value = "3")]
    pub num_train_epochs: usize,
    /// Number of worker threads used to collate batches (0 collates on the training thread).
    #[structopt(long, default_value = "0")]
    pub dataloader_num_workers: usize,
    /// Random seed for initialization.
    #[structopt(long, default_value = "42")]
    pub seed: u64,
    /// Whether to use 16-bit (mixed) precision instead of 32-bit.
    #[structopt(long)]
    pub fp16: bool,
    /// For distributed training: local_rank
    #[structopt(long, default_value = "-1", allow_hyphen_values = true)]
    pub local_rank: i64,
    /// Do not use a GPU even when one is available.
    #[structopt(long)]
    pub no_cuda: bool,
}

impl TrainingArguments {
    /// Name of the device the model runs on
    pub fn device(&self) -> &'static str {
        if self.no_cuda { "cpu" } else { "wgpu" }
    }
    /// Number of gpus used by this process
    pub fn n_gpu(&self) -> usize {
        if self.no_cuda { 0 } else { 1 }
    }
    pub fn is_distributed(&self) -> bool {
        self.local_rank != -1
    }
    /// The primary process is the one in charge of the writes that must not be duplicated
    pub fn is_primary(&self) -> bool {
        is_primary_rank(self.local_rank)
    }
}

pub fn is_primary_rank(local_rank: i64) -> bool {
    local_rank == -1 || local_rank == 0
}

/// All the arguments of the driver.
#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "run_language_modeling",
    about = "Fine-tunes a pretrained encoder on a text file with a masked language modeling loss."
)]
pub struct Arguments {
    #[structopt(flatten)]
    pub model: ModelArguments,
    #[structopt(flatten)]
    pub data: DataTrainingArguments,
    #[structopt(flatten)]
    pub training: TrainingArguments,
}

impl Arguments {
    /// Checks the preconditions that must hold before anything gets loaded.
    pub fn validate(&self) -> Result<()> {
        if self.training.do_eval && self.data.eval_data_file.is_none() {
            return Err(Error::configuration(
                "Cannot do evaluation without an evaluation data file. Either supply a file to --eval_data_file \
                 or remove the --do_eval argument."));
        }
        if self.training.do_train && self.data.train_data_file.is_empty() {
            return Err(Error::configuration(
                "Cannot do training without a training data file. Either supply a file to --train_data_file \
                 or remove the --do_train argument."));
        }
        if !(0.0..=1.0).contains(&self.data.mlm_probability) {
            return Err(Error::configuration(format!(
                "--mlm_probability must lie in [0, 1], got {}", self.data.mlm_probability)));
        }
        if self.training.do_train && !self.training.overwrite_output_dir && is_non_empty_dir(&self.training.output_dir)? {
            return Err(Error::configuration(format!(
                "Output directory ({}) already exists and is not empty. Use --overwrite_output_dir to overcome.",
                self.training.output_dir.display())));
        }
        Ok(())
    }
}

fn is_non_empty_dir(path: &std::path::Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(fs::read_dir(path)?.next().is_some())
}

#[cfg(test)]
mod tests {
    use structopt::StructOpt;

    use crate::error::Error;

    use super::{Arguments, ModelType};

    fn parse(extra: &[&str]) -> Arguments {
        let mut argv = vec!["run_language_modeling"];
        argv.extend_from_slice(extra);
        Arguments::from_iter_safe(argv).unwrap()
    }

    #[test]
    fn defaults_are_preserved() {
        let args = parse(&["--output_dir", "out"]);
        assert_eq!(args.model.model_name_or_path, "/home/t-avic/PycharmProjects/coref_former/longformer-base-4096/");
        assert_eq!(args.model.tokenizer_name, "RobertaTokenizer");
        assert_eq!(args.model.cache_dir, "/home/t-avic/PycharmProjects/coref_former/finetuned");
        assert_eq!(args.model.model_type, None);
        assert_eq!(args.data.train_data_file, "train.txt.src");
        assert_eq!(args.data.eval_data_file, None);
        assert!(args.data.mlm);
        assert!(!args.data.line_by_line);
        assert!(!args.data.globalize_special_tokens);
        assert_eq!(args.data.mlm_probability, 0.15);
        assert_eq!(args.data.block_size, -1);
        assert_eq!(args.training.local_rank, -1);
        assert_eq!(args.training.seed, 42);
        assert!(args.training.is_primary());
        assert!(!args.training.is_distributed());
    }

    #[test]
    fn longformer_is_a_model_type() {
        let args = parse(&["--output_dir", "out", "--model_type", "Longformer"]);
        assert_eq!(args.model.model_type, Some(ModelType::Longformer));
        assert_eq!(args.model.config_name, "/home/t-avic/PycharmProjects/coref_former/longformer-base-4096/");
    }

    #[test]
    fn train_without_file_is_fatal() {
        let args = parse(&["--output_dir", "out", "--do_train", "--train_data_file", ""]);
        match args.validate() {
            Err(Error::Configuration(msg)) => assert!(msg.contains("--train_data_file")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn flags_are_parsed() {
        let args = parse(&[
            "--output_dir", "out", "--no_mlm", "--mlm_probability", "0.3",
            "--model_type", "roberta", "--local_rank", "1", "--block_size", "-1", "--do_train",
        ]);
        assert!(!args.data.mlm);
        assert_eq!(args.data.mlm_probability, 0.3);
        assert_eq!(args.model.model_type, Some(ModelType::Roberta));
        assert!(!args.training.is_primary());
        assert!(args.training.do_train);
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let res = Arguments::from_iter_safe(["run_language_modeling", "--output_dir", "out", "--nope"]);
        assert!(res.is_err());
    }

    #[test]
    fn unsupported_model_type_is_rejected() {
        let res = Arguments::from_iter_safe(["run_language_modeling", "--output_dir", "out", "--model_type", "gpt2"]);
        let err = res.unwrap_err().to_string();
        assert!(err.contains("model_type"));
    }

    #[test]
    fn bad_value_names_the_flag() {
        let res = Arguments::from_iter_safe(["run_language_modeling", "--output_dir", "out", "--seed", "abc"]);
        let err = res.unwrap_err().to_string();
        assert!(err.contains("seed"));
    }

    #[test]
    fn eval_without_file_is_fatal() {
        let args = parse(&["--output_dir", "out", "--do_eval"]);
        match args.validate() {
            Err(Error::Configuration(msg)) => assert!(msg.contains("--eval_data_file")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_empty_output_dir_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("previous_run.txt"), "x").unwrap();
        let out = dir.path().to_str().unwrap();

        let args = parse(&["--output_dir", out, "--do_train"]);
        match args.validate() {
            Err(Error::Configuration(msg)) => assert!(msg.contains("--overwrite_output_dir")),
            other => panic!("unexpected {other:?}"),
        }

        let args = parse(&["--output_dir", out, "--do_train", "--overwrite_output_dir"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn empty_output_dir_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let args = parse(&["--output_dir", dir.path().to_str().unwrap(), "--do_train"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn mlm_probability_is_bounded() {
        let args = parse(&["--output_dir", "out", "--mlm_probability", "1.5"]);
        assert!(matches!(args.validate(), Err(Error::Configuration(_))));
    }
}

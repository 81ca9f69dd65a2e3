//! Where the model and the tokenizer come from, and where they go.
//!
//! A checkpoint is a directory holding the model configuration
//! (`config.json`), its weights (`model.mpk`) and the tokenizer
//! (`tokenizer.json`).
use std::path::{Path, PathBuf};

use burn::{config::Config, module::Module, prelude::Backend, record::CompactRecorder};
use log::info;
use tokenizers::Tokenizer;

use crate::{args::ModelArguments, bert::{BertForMaskedLM, BertForMaskedLMConfig}, error::{Error, Result}};

pub const CONFIG_FILE: &str = "config.json";
/// the recorder appends the `.mpk` extension
pub const WEIGHTS_FILE: &str = "model";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Loads the pretrained artifacts a run starts from.
pub trait CheckpointLoader<B: Backend> {
    fn load_tokenizer(&mut self, args: &ModelArguments) -> Result<Tokenizer>;
    fn load_model(&mut self, args: &ModelArguments, device: &B::Device) -> Result<(BertForMaskedLMConfig, BertForMaskedLM<B>)>;
}

/// Loads the artifacts from the file system (or from the hub for tokenizers).
#[derive(Debug, Default, Clone, Copy)]
pub struct FileCheckpointLoader;

impl <B: Backend> CheckpointLoader<B> for FileCheckpointLoader {
    /// The tokenizer is looked up as `--tokenizer_name` (file or checkpoint
    /// directory), then in the `--model_name_or_path` checkpoint, and finally
    /// fetched from the hub under the `--tokenizer_name` identifier.
    fn load_tokenizer(&mut self, args: &ModelArguments) -> Result<Tokenizer> {
        let local = [&args.tokenizer_name, &args.model_name_or_path]
            .into_iter()
            .find_map(|name| local_file(name, TOKENIZER_FILE));
        if let Some(path) = local {
            info!("loading tokenizer from {}", path.display());
            return Ok(Tokenizer::from_file(path)?);
        }

        let name = args.tokenizer_name.as_str();
        if name.is_empty() {
            return Err(Error::configuration(
                "You are instantiating a new tokenizer from scratch. This is not supported, \
                 but you can do it from another script, save it, and load it from here, using --tokenizer_name"));
        }
        if !args.cache_dir.is_empty() {
            std::env::set_var("HF_HOME", &args.cache_dir);
        }
        info!("fetching tokenizer {name} from the hub");
        Ok(Tokenizer::from_pretrained(name, None)?)
    }

    fn load_model(&mut self, args: &ModelArguments, device: &B::Device) -> Result<(BertForMaskedLMConfig, BertForMaskedLM<B>)> {
        let config = load_config(args)?;
        let model = config.init::<B>(device);

        let weights = Some(Path::new(&args.model_name_or_path).join(WEIGHTS_FILE))
            .filter(|w| w.with_extension("mpk").is_file());

        let model = match weights {
            Some(weights) => {
                info!("loading weights from {}", weights.display());
                model.load_file(weights, &CompactRecorder::new(), device)?
            },
            None => {
                info!("Training new model from scratch");
                model
            },
        };
        Ok((config, model))
    }
}

/// `name` itself when it is a file, `name/file` when name is a directory holding that file
fn local_file(name: &str, file: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if name.is_empty() {
        None
    } else if path.is_file() {
        Some(path.to_path_buf())
    } else if path.join(file).is_file() {
        Some(path.join(file))
    } else {
        None
    }
}

fn load_config(args: &ModelArguments) -> Result<BertForMaskedLMConfig> {
    let local = [&args.config_name, &args.model_name_or_path]
        .into_iter()
        .find_map(|name| local_file(name, CONFIG_FILE));
    if let Some(path) = local {
        info!("loading model config from {}", path.display());
        return Ok(BertForMaskedLMConfig::load(path)?);
    }

    match args.model_type {
        Some(model_type) => {
            info!("You are instantiating a new {model_type} config instance from scratch.");
            Ok(BertForMaskedLMConfig::from_model_type(model_type))
        },
        None => Err(Error::configuration(format!(
            "No model checkpoint found at {}. Pass --model_type to train a model from scratch.",
            args.model_name_or_path))),
    }
}

/// Writes the model so that it can later be loaded by `FileCheckpointLoader`
pub fn save_model<B: Backend>(dir: &Path, config: &BertForMaskedLMConfig, model: &BertForMaskedLM<B>) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    config.save(dir.join(CONFIG_FILE))?;
    model.clone().save_file(dir.join(WEIGHTS_FILE), &CompactRecorder::new())?;
    Ok(())
}

/// Writes the tokenizer next to the model
pub fn save_tokenizer(dir: &Path, tokenizer: &Tokenizer) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    tokenizer.save(dir.join(TOKENIZER_FILE), false)?;
    Ok(())
}

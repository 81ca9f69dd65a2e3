//! The pretraining run, from the arguments to the evaluation results.
use std::{collections::BTreeMap, fs::File, io::{BufWriter, Write}, path::{Path, PathBuf}};

use burn::tensor::backend::AutodiffBackend;
use log::{info, warn};
use tokenizers::Tokenizer;

use crate::{
    args::Arguments,
    bert::{BertForMaskedLMConfig, DataCollatorForLanguageModelingBuilder},
    checkpoint::{self, CheckpointLoader, FileCheckpointLoader},
    context::RunContext,
    data::{add_doc_tokens, get_dataset, mask_token_id, pad_token_id, special_token_ids},
    error::{Error, Result},
    train::{BurnTrainerBuilder, LanguageModelTrainer},
};

/// Sequence length the corpus is cut into, whatever the arguments say
pub const FORCED_BLOCK_SIZE: i64 = 4096;
/// Name of the file the evaluation metrics are written to
pub const EVAL_RESULTS_FILE: &str = "eval_results_lm.txt";

/// Runs the whole pretraining with the artifacts found on the file system.
pub fn run<B: AutodiffBackend>(args: Arguments, device: B::Device) -> Result<BTreeMap<String, f64>> {
    run_with::<B, _>(args, &mut FileCheckpointLoader, device)
}

/// Runs the whole pretraining with the artifacts provided by `loader`.
pub fn run_with<B, L>(mut args: Arguments, loader: &mut L, device: B::Device) -> Result<BTreeMap<String, f64>>
    where B: AutodiffBackend,
          L: CheckpointLoader<B>,
{
    args.validate()?;
    let mut ctx = RunContext::init::<B>(&args.training);

    let mut tokenizer = loader.load_tokenizer(&args.model)?;
    let added = add_doc_tokens(&mut tokenizer);
    info!("added {added} document boundary tokens to the vocabulary");
    let (mut model_config, model) = loader.load_model(&args.model, &device)?;

    let block_size = effective_block_size(FORCED_BLOCK_SIZE, &model_config);
    if (block_size as i64) < FORCED_BLOCK_SIZE {
        warn!("the model handles at most {block_size} positions: the corpus is cut in blocks of {block_size} tokens");
    }
    args.data.block_size = block_size as i64;

    let train_dataset = if args.training.do_train {
        Some(get_dataset(&args.data, &tokenizer, false, ctx.local_rank)?)
    } else {
        None
    };
    let eval_dataset = if args.training.do_eval {
        Some(get_dataset(&args.data, &tokenizer, true, ctx.local_rank)?)
    } else {
        None
    };

    let vocab_size = tokenizer.get_vocab_size(true);
    let model = model.resize_token_embeddings(vocab_size, model_config.initializer_range);
    model_config.vocab_size = vocab_size;

    let collator = DataCollatorForLanguageModelingBuilder::<B>::default()
        .mlm(args.data.mlm)
        .mlm_probability(args.data.mlm_probability)
        .globalize_special_tokens(args.data.globalize_special_tokens)
        .mask_token_id(mask_token_id(&tokenizer))
        .pad_token_id(pad_token_id(&tokenizer).unwrap_or(model_config.pad_token_id as u32))
        .max_seq_length(block_size)
        .voc_size(vocab_size)
        .special_token_ids(special_token_ids(&tokenizer))
        .seed(ctx.next_seed())
        .device(device.clone())
        .build()?;

    let mut trainer = BurnTrainerBuilder::default()
        .args(args.training.clone())
        .model_config(model_config)
        .model(model)
        .collator(collator)
        .train_dataset(train_dataset)
        .eval_dataset(eval_dataset)
        .prediction_loss_only(true)
        .device(device)
        .build()?;

    let resume_from = resume_path(&args);
    finish(&mut trainer, &tokenizer, &args, resume_from.as_deref())
}

/// The longest block the model can take in one go, at most `requested`
pub fn effective_block_size(requested: i64, config: &BertForMaskedLMConfig) -> usize {
    (requested.max(1) as usize).min(config.max_position_embeddings)
}

/// The checkpoint directory training continues from, if any
pub fn resume_path(args: &Arguments) -> Option<PathBuf> {
    Some(PathBuf::from(&args.model.model_name_or_path))
        .filter(|p| p.is_dir())
}

/// Trains, saves what must be saved, evaluates and reports.
pub fn finish<T: LanguageModelTrainer>(trainer: &mut T, tokenizer: &Tokenizer, args: &Arguments, resume_from: Option<&Path>) -> Result<BTreeMap<String, f64>> {
    let output_dir = &args.training.output_dir;

    if args.training.do_train {
        trainer.train(resume_from)?;
        if trainer.is_world_master() {
            trainer.save_model(output_dir)?;
        }
    }
    // the extended vocabulary is needed to read the results back, trained or not
    if trainer.is_world_master() {
        checkpoint::save_tokenizer(output_dir, tokenizer)?;
    }

    let mut results = BTreeMap::new();
    if args.training.do_eval {
        info!("*** Evaluate ***");
        let eval_output = trainer.evaluate()?;
        let loss = *eval_output.get("loss")
            .ok_or_else(|| Error::configuration("the trainer reported no evaluation loss"))?;

        let mut result = BTreeMap::new();
        result.insert("perplexity".to_string(), perplexity(loss));

        if trainer.is_world_master() {
            write_results(&output_dir.join(EVAL_RESULTS_FILE), &result)?;
        }
        results.extend(result);
    }
    Ok(results)
}

/// exp(loss): an overflowing loss yields an infinite perplexity
pub fn perplexity(loss: f64) -> f64 {
    loss.exp()
}

/// Writes one `key = value` line per metric, in key order
pub fn write_results(path: &Path, results: &BTreeMap<String, f64>) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    info!("***** Eval results *****");
    for (key, value) in results {
        info!("  {key} = {value}");
        writeln!(writer, "{key} = {value}")?;
    }
    writer.flush()?;
    Ok(())
}

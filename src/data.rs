use std::{collections::HashSet, fs::{self, File}, io::{BufReader, BufWriter, Write}, path::{Path, PathBuf}, thread, time::{Duration, SystemTime}};

use burn::data::dataset::Dataset;
use log::{debug, info};
use rayon::prelude::*;
use tokenizers::{AddedToken, Encoding, Tokenizer, TruncationParams};

use crate::{args::{is_primary_rank, DataTrainingArguments}, bert::MlmInputItem, error::{Error, Result}};

/// Marks the beginning of a document in a multi-document example
pub const DOC_START: &str = "<doc-s>";
/// Marks the end of a document in a multi-document example
pub const DOC_END: &str = "</doc-s>";

/// Block size used when neither the arguments nor the tokenizer tell
const FALLBACK_BLOCK_SIZE: usize = 512;
/// How often a secondary process checks whether the primary one wrote the cache
const CACHE_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Processes of a run are launched together: a completion marker older than
/// this (relative to a secondary's start) belongs to a previous run
const LAUNCH_WINDOW: Duration = Duration::from_secs(60);

/// Registers the document boundary tokens as special tokens.
/// Returns the number of tokens that were actually added.
pub fn add_doc_tokens(tok: &mut Tokenizer) -> usize {
    tok.add_special_tokens(&[
        AddedToken::from(DOC_START, true),
        AddedToken::from(DOC_END, true),
    ])
}

/// The ids of all the tokens the tokenizer considers special
pub fn special_token_ids(tok: &Tokenizer) -> HashSet<u32> {
    tok.get_added_tokens_decoder()
        .into_iter()
        .filter(|(_, token)| token.special)
        .map(|(id, _)| id)
        .collect()
}

/// The id of the mask token (roberta or bert flavour)
pub fn mask_token_id(tok: &Tokenizer) -> Option<u32> {
    tok.token_to_id("<mask>").or_else(|| tok.token_to_id("[MASK]"))
}

/// The id of the pad token (roberta or bert flavour)
pub fn pad_token_id(tok: &Tokenizer) -> Option<u32> {
    tok.get_padding().map(|p| p.pad_id)
        .or_else(|| tok.token_to_id("<pad>"))
        .or_else(|| tok.token_to_id("[PAD]"))
}

/// A non positive block size means "whatever the tokenizer accepts"
pub fn resolve_block_size(block_size: i64, tok: &Tokenizer) -> usize {
    if block_size > 0 {
        block_size as usize
    } else {
        tok.get_truncation().map(|t| t.max_length).unwrap_or(FALLBACK_BLOCK_SIZE)
    }
}

/// A tokenized text file.
///
/// Each non-empty line of the file is a document (or a cluster of documents
/// delimited with DOC_START/DOC_END). By default, every line is cut into
/// windows of `block_size` tokens and each window is an example. In line by
/// line mode, each line is one example truncated to `block_size` tokens.
#[derive(Debug, Clone)]
pub struct TextDataset {
    /// "train" or "dev"
    pub split: String,
    /// the file the examples come from
    pub file_path: PathBuf,
    /// max number of tokens per example (special tokens included)
    pub block_size: usize,
    /// whether each line is a single example
    pub line_by_line: bool,
    examples: Vec<MlmInputItem>,
}

impl TextDataset {
    /// Tokenizes the file (or reuses the cached tokenization).
    ///
    /// Only the primary process (rank -1 or 0) creates the cache; the others
    /// wait until the primary marks it complete and read it. When the cache
    /// is being rebuilt, the others ignore the marker left by a previous run.
    pub fn new(
        tokenizer: &Tokenizer,
        split: &str,
        file_path: impl AsRef<Path>,
        block_size: usize,
        local_rank: i64,
        line_by_line: bool,
        overwrite_cache: bool,
    ) -> Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();
        let cache = cache_path(&file_path, split, block_size, line_by_line);

        let marker = done_marker(&cache);

        let examples = if !is_primary_rank(local_rank) {
            let not_before = overwrite_cache
                .then(|| SystemTime::now().checked_sub(LAUNCH_WINDOW))
                .flatten();
            wait_for(&marker, not_before);
            info!("Loading features from cached file {}", cache.display());
            read_cache(&cache)?
        } else if cache.exists() && !overwrite_cache {
            info!("Loading features from cached file {}", cache.display());
            let examples = read_cache(&cache)?;
            if !marker.exists() {
                File::create(&marker)?;
            }
            examples
        } else {
            if marker.exists() {
                fs::remove_file(&marker)?;
            }
            info!("Creating features from dataset file at {}", file_path.display());
            let text = fs::read_to_string(&file_path)?;
            let examples = tokenize(tokenizer, &text, block_size, line_by_line)?;
            write_cache(&cache, &examples)?;
            File::create(&marker)?;
            info!("Saving features into cached file {}", cache.display());
            examples
        };

        Ok(Self { split: split.to_string(), file_path, block_size, line_by_line, examples })
    }

    pub fn examples(&self) -> &[MlmInputItem] {
        &self.examples
    }
}

impl Dataset<MlmInputItem> for TextDataset {
    fn get(&self, index: usize) -> Option<MlmInputItem> {
        self.examples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.examples.len()
    }
}

/// Builds the train dataset, or the dev one when `evaluate` is set.
/// The rank must be the one of the calling process so that only one process
/// writes the tokenization cache.
pub fn get_dataset(args: &DataTrainingArguments, tokenizer: &Tokenizer, evaluate: bool, local_rank: i64) -> Result<TextDataset> {
    let (file_path, flag) = if evaluate {
        (args.eval_data_file.as_deref(), "--eval_data_file")
    } else {
        (Some(args.train_data_file.as_str()), "--train_data_file")
    };
    let file_path = file_path.filter(|f| !f.is_empty()).ok_or_else(|| Error::configuration(format!("{flag} must be given")))?;

    TextDataset::new(
        tokenizer,
        if evaluate { "dev" } else { "train" },
        file_path,
        resolve_block_size(args.block_size, tokenizer),
        local_rank,
        args.line_by_line,
        args.overwrite_cache,
    )
}

fn encoding_to_vec(mut e: Encoding, first_only: bool) -> Vec<MlmInputItem> {
    let mut out = vec![MlmInputItem { input_ids: e.get_ids().to_vec() }];
    if !first_only {
        for o in e.take_overflowing() {
            out.push(MlmInputItem { input_ids: o.get_ids().to_vec() });
        }
    }
    out
}

fn tokenize(tokenizer: &Tokenizer, text: &str, block_size: usize, line_by_line: bool) -> Result<Vec<MlmInputItem>> {
    let mut tok = tokenizer.clone();
    tok.with_truncation(Some(TruncationParams { max_length: block_size, ..Default::default() }))?;

    let lines = text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>();

    let encoded = lines.par_iter()
        .map(|line| tok.encode(*line, true).map(|e| encoding_to_vec(e, line_by_line)))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(encoded.into_iter().flatten().collect())
}

fn cache_path(file_path: &Path, split: &str, block_size: usize, line_by_line: bool) -> PathBuf {
    let kind = if line_by_line { "lines" } else { "lm" };
    let name = file_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let dir = file_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("cached_{kind}_{split}_{block_size}_{name}.json"))
}

/// Written by the primary process once the cache is complete
fn done_marker(cache: &Path) -> PathBuf {
    cache.with_extension("json.done")
}

/// Blocks until `marker` exists and, when `not_before` is given, was written
/// no earlier than that.
fn wait_for(marker: &Path, not_before: Option<SystemTime>) {
    let is_ready = || match fs::metadata(marker) {
        Err(_) => false,
        Ok(meta) => match (not_before, meta.modified()) {
            (None, _) => true,
            (Some(limit), Ok(written)) => written >= limit,
            (Some(_), Err(_)) => true,
        },
    };
    while !is_ready() {
        debug!("waiting for the primary process to write {}", marker.display());
        thread::sleep(CACHE_POLL_INTERVAL);
    }
}

fn read_cache(cache: &Path) -> Result<Vec<MlmInputItem>> {
    let reader = BufReader::new(File::open(cache)?);
    Ok(serde_json::from_reader(reader)?)
}

/// The cache only shows up under its final name once it is complete.
fn write_cache(cache: &Path, examples: &[MlmInputItem]) -> Result<()> {
    let tmp = cache.with_extension("json.tmp");
    let mut writer = BufWriter::new(File::create(&tmp)?);
    serde_json::to_writer(&mut writer, examples)?;
    writer.flush()?;
    drop(writer);
    fs::rename(&tmp, cache)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs::{self, File}, thread, time::{Duration, SystemTime}};

    use burn::data::dataset::Dataset;
    use structopt::StructOpt;

    use crate::{args::Arguments, error::Error, testing::{word_level_tokenizer, write_lines}};

    use super::{add_doc_tokens, cache_path, get_dataset, mask_token_id, pad_token_id, resolve_block_size, special_token_ids, TextDataset, DOC_END, DOC_START};

    fn data_args(extra: &[&str]) -> Arguments {
        let mut argv = vec!["run_language_modeling", "--output_dir", "out"];
        argv.extend_from_slice(extra);
        Arguments::from_iter_safe(argv).unwrap()
    }

    #[test]
    fn doc_tokens_are_added_once() {
        let mut tok = word_level_tokenizer();
        let before = tok.get_vocab_size(true);

        assert_eq!(add_doc_tokens(&mut tok), 2);
        assert_eq!(tok.get_vocab_size(true), before + 2);
        assert_eq!(add_doc_tokens(&mut tok), 0);
        assert_eq!(tok.get_vocab_size(true), before + 2);

        let specials = special_token_ids(&tok);
        assert!(specials.contains(&tok.token_to_id(DOC_START).unwrap()));
        assert!(specials.contains(&tok.token_to_id(DOC_END).unwrap()));
    }

    #[test]
    fn doc_tokens_are_not_split() {
        let mut tok = word_level_tokenizer();
        add_doc_tokens(&mut tok);
        let start = tok.token_to_id(DOC_START).unwrap();
        let end = tok.token_to_id(DOC_END).unwrap();

        let enc = tok.encode("<doc-s> the cat </doc-s>", false).unwrap();
        assert_eq!(enc.get_ids(), &[start, 5, 6, end]);
    }

    #[test]
    fn special_ids_are_found() {
        let tok = word_level_tokenizer();
        assert_eq!(mask_token_id(&tok), Some(4));
        assert_eq!(pad_token_id(&tok), Some(0));
        assert_eq!(resolve_block_size(-1, &tok), 512);
        assert_eq!(resolve_block_size(64, &tok), 64);
    }

    #[test]
    fn lines_are_cut_in_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(dir.path(), "train.txt", &["the cat sat on a mat dog ran", "", "big red fox"]);
        let tok = word_level_tokenizer();

        let dset = TextDataset::new(&tok, "train", &path, 6, -1, false, false).unwrap();
        // 8 words in windows of 4 (+ [CLS] and [SEP]), then 3 words
        assert_eq!(dset.len(), 3);
        assert_eq!(dset.get(0).unwrap().input_ids, vec![2, 5, 6, 7, 8, 3]);
        assert_eq!(dset.get(1).unwrap().input_ids, vec![2, 9, 10, 11, 12, 3]);
        assert_eq!(dset.get(2).unwrap().input_ids, vec![2, 15, 16, 19, 3]);
    }

    #[test]
    fn line_by_line_keeps_one_example_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(dir.path(), "train.txt", &["the cat sat on a mat dog ran", "big red fox"]);
        let tok = word_level_tokenizer();

        let dset = TextDataset::new(&tok, "train", &path, 6, -1, true, false).unwrap();
        assert_eq!(dset.len(), 2);
        assert_eq!(dset.get(0).unwrap().input_ids, vec![2, 5, 6, 7, 8, 3]);
        assert_eq!(dset.get(1).unwrap().input_ids, vec![2, 15, 16, 19, 3]);
    }

    #[test]
    fn cache_is_reused_unless_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(dir.path(), "train.txt", &["the cat sat"]);
        let tok = word_level_tokenizer();

        let first = TextDataset::new(&tok, "train", &path, 8, -1, false, false).unwrap();
        assert!(cache_path(&path, "train", 8, false).exists());

        // the cache wins over the file as long as it is not overwritten
        fs::write(&path, "dog ran").unwrap();
        let cached = TextDataset::new(&tok, "train", &path, 8, -1, false, false).unwrap();
        assert_eq!(cached.examples(), first.examples());

        let rebuilt = TextDataset::new(&tok, "train", &path, 8, -1, false, true).unwrap();
        assert_eq!(rebuilt.get(0).unwrap().input_ids, vec![2, 11, 12, 3]);
    }

    #[test]
    fn secondary_rank_waits_for_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(dir.path(), "train.txt", &["the cat sat"]);
        let tok = word_level_tokenizer();

        let secondary = {
            let (tok, path) = (tok.clone(), path.clone());
            thread::spawn(move || TextDataset::new(&tok, "train", &path, 8, 1, false, false).unwrap())
        };
        let primary = TextDataset::new(&tok, "train", &path, 8, 0, false, false).unwrap();
        let secondary = secondary.join().unwrap();

        assert_eq!(primary.examples(), secondary.examples());
    }

    #[test]
    fn secondary_rank_ignores_a_stale_cache_being_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(dir.path(), "train.txt", &["the cat sat"]);
        let tok = word_level_tokenizer();

        // a complete cache left by an earlier run on an older version of the file
        TextDataset::new(&tok, "train", &path, 8, -1, false, false).unwrap();
        let marker = super::done_marker(&super::cache_path(&path, "train", 8, false));
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        File::options().write(true).open(&marker).unwrap().set_modified(an_hour_ago).unwrap();
        fs::write(&path, "dog ran").unwrap();

        let secondary = {
            let (tok, path) = (tok.clone(), path.clone());
            thread::spawn(move || TextDataset::new(&tok, "train", &path, 8, 1, false, true).unwrap())
        };
        // leave the secondary the time to look at the stale cache
        thread::sleep(Duration::from_millis(200));
        let primary = TextDataset::new(&tok, "train", &path, 8, 0, false, true).unwrap();
        let secondary = secondary.join().unwrap();

        assert_eq!(primary.get(0).unwrap().input_ids, vec![2, 11, 12, 3]);
        assert_eq!(primary.examples(), secondary.examples());
    }

    #[test]
    fn train_split_reads_the_train_file() {
        let dir = tempfile::tempdir().unwrap();
        let train = write_lines(dir.path(), "train.txt", &["the cat"]);
        let tok = word_level_tokenizer();

        let args = data_args(&["--train_data_file", train.to_str().unwrap(), "--block_size", "16"]);
        let dset = get_dataset(&args.data, &tok, false, -1).unwrap();
        assert_eq!(dset.split, "train");
        assert_eq!(dset.file_path, train);
        assert_eq!(dset.get(0).unwrap().input_ids, vec![2, 5, 6, 3]);
    }

    #[test]
    fn dev_split_reads_the_eval_file() {
        let dir = tempfile::tempdir().unwrap();
        let train = write_lines(dir.path(), "train.txt", &["the cat"]);
        let eval = write_lines(dir.path(), "eval.txt", &["dog ran"]);
        let tok = word_level_tokenizer();

        let args = data_args(&[
            "--train_data_file", train.to_str().unwrap(),
            "--eval_data_file", eval.to_str().unwrap(),
            "--block_size", "16",
        ]);
        let dset = get_dataset(&args.data, &tok, true, -1).unwrap();
        assert_eq!(dset.split, "dev");
        assert_eq!(dset.file_path, eval);
        assert_eq!(dset.get(0).unwrap().input_ids, vec![2, 11, 12, 3]);

        // the train file plays no role in the dev split
        let mut args = args;
        args.data.train_data_file = String::new();
        let dset = get_dataset(&args.data, &tok, true, -1).unwrap();
        assert_eq!(dset.file_path, eval);
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let tok = word_level_tokenizer();
        let args = data_args(&[]);
        assert!(matches!(get_dataset(&args.data, &tok, true, -1), Err(Error::Configuration(_))));
    }
}

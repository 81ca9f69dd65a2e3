use std::{collections::HashSet, sync::{Arc, Mutex, PoisonError}};

use burn::{config::Config, data::dataloader::batcher::Batcher, module::Module, nn::attention::{generate_autoregressive_mask, generate_padding_mask, GeneratePaddingMask}, prelude::Backend, tensor::{activation::log_softmax, backend::AutodiffBackend, Int, Tensor, TensorData}, train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep}};
use derive_builder::Builder;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::args::ModelType;

use super::{BertInputBatch, BertLMPredictionHead, BertModel};

/// Label of the positions that do not contribute to the loss
pub const IGNORE_INDEX: i64 = -100;

/// One single input item for the masked language model: a block of token ids
/// (special tokens included).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlmInputItem {
    pub input_ids: Vec<u32>,
}

/// A batch ready to be fed to the model.
#[derive(Debug, Clone)]
pub struct MlmBatch<B: Backend> {
    pub input: BertInputBatch<B>,
    /// The labels of the lm task (IGNORE_INDEX where there is nothing to predict)
    /// Shape: [batch, sequence]
    pub labels: Tensor<B, 2, Int>,
    /// true when the labels must be predicted from the left context only
    pub causal: bool,
}

/// Creates an MlmBatch from a series of token blocks.
///
/// In mlm mode, a fraction of the tokens is selected for prediction; out of
/// these, 80% are replaced by the mask token, 10% by a random token and 10%
/// are left unchanged. Otherwise, the batch is prepared for causal language
/// modeling.
#[derive(Debug, Clone, Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct DataCollatorForLanguageModeling<B: Backend> {
    /// whether to do masked language modeling (causal language modeling otherwise)
    #[builder(default = "true")]
    pub mlm: bool,
    /// probability that a token be selected for prediction
    #[builder(default = "0.15")]
    pub mlm_probability: f64,
    /// whether the special tokens only (rather than the predicted ones) get global attention
    #[builder(default = "false")]
    pub globalize_special_tokens: bool,
    /// the identifier of the mask token in the vocabulary (mandatory for mlm)
    #[builder(default)]
    pub mask_token_id: Option<u32>,
    /// the identifier of the pad token in the vocabulary
    pub pad_token_id: u32,
    /// maximum sequence length of a batch; longer blocks get truncated
    pub max_seq_length: usize,
    /// the size of the vocabulary
    pub voc_size: usize,
    /// the tokens that are never selected for prediction
    #[builder(default)]
    pub special_token_ids: HashSet<u32>,
    /// source of the masking decisions
    #[builder(setter(custom), default = "Arc::new(Mutex::new(StdRng::from_entropy()))")]
    rng: Arc<Mutex<StdRng>>,
    /// the device where the tensors must be created
    pub device: B::Device,
}

impl <B: Backend> DataCollatorForLanguageModelingBuilder<B> {
    /// Makes the masking decisions reproducible
    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.rng = Some(Arc::new(Mutex::new(StdRng::seed_from_u64(seed))));
        self
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(p) = self.mlm_probability {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("mlm probability must lie in [0, 1], got {p}"));
            }
        }
        if self.mlm.unwrap_or(true) && self.mask_token_id.flatten().is_none() {
            return Err("this tokenizer has no mask token which is necessary for masked language modeling; \
                        use --no_mlm to do causal language modeling instead".to_string());
        }
        Ok(())
    }
}

impl <B: Backend> DataCollatorForLanguageModeling<B> {
    /// The same collator producing tensors for another backend living on the 
    /// same device (e.g. the inner backend of an autodiff one). The masking
    /// decisions keep being drawn from the same generator.
    pub fn for_backend<B2: Backend<Device = B::Device>>(&self) -> DataCollatorForLanguageModeling<B2> {
        DataCollatorForLanguageModeling {
            mlm: self.mlm,
            mlm_probability: self.mlm_probability,
            globalize_special_tokens: self.globalize_special_tokens,
            mask_token_id: self.mask_token_id,
            pad_token_id: self.pad_token_id,
            max_seq_length: self.max_seq_length,
            voc_size: self.voc_size,
            special_token_ids: self.special_token_ids.clone(),
            rng: Arc::clone(&self.rng),
            device: self.device.clone(),
        }
    }

    /// Selects the tokens to predict and corrupts them in place. Returns the labels.
    pub fn mask_tokens(&self, input_ids: &mut [Vec<u32>]) -> Vec<Vec<i64>> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut labels = Vec::with_capacity(input_ids.len());

        for sequence in input_ids.iter_mut() {
            let mut seq_labels = Vec::with_capacity(sequence.len());
            for id in sequence.iter_mut() {
                if self.special_token_ids.contains(&*id) || !rng.gen_bool(self.mlm_probability) {
                    seq_labels.push(IGNORE_INDEX);
                    continue;
                }
                seq_labels.push(*id as i64);

                // 80% of the selected tokens will be replaced by [MASK]
                if rng.gen_bool(0.8) {
                    if let Some(mask) = self.mask_token_id {
                        *id = mask;
                    }
                // 10% of the selected tokens will be replaced by some random token
                } else if rng.gen_bool(0.5) {
                    *id = rng.gen_range(0..self.voc_size as u32);
                }
                // the remaining 10% are left unchanged
            }
            labels.push(seq_labels);
        }
        labels
    }

    /// In causal mode, every token is a label: the loss shifts them by one position.
    fn causal_labels(&self, input_ids: &[Vec<u32>]) -> Vec<Vec<i64>> {
        input_ids.iter()
            .map(|seq| seq.iter().map(|id| *id as i64).collect())
            .collect()
    }

    fn global_attention(&self, special: &[Vec<bool>], labels: &[Vec<i64>]) -> Vec<Vec<i64>> {
        special.iter().zip(labels)
            .map(|(special, labels)| special.iter().zip(labels)
                .map(|(&is_special, &label)| {
                    let global = if self.globalize_special_tokens {
                        is_special
                    } else {
                        is_special || (self.mlm && label != IGNORE_INDEX)
                    };
                    global as i64
                })
                .collect())
            .collect()
    }

    /// Creates a 2d tensor of the given shape out of the given rows.
    /// Whenever a row is shorter than shape[1], `fill` is used as padding.
    fn to_tensor_of_shape(&self, shape: [usize; 2], rows: &[Vec<i64>], fill: i64) -> Tensor<B, 2, Int> {
        let [batch, seq] = shape;
        let mut flat = vec![fill; batch * seq];
        for (i, row) in rows.iter().enumerate() {
            let n = row.len().min(seq);
            flat[i * seq..i * seq + n].copy_from_slice(&row[..n]);
        }
        Tensor::from_data(TensorData::new(flat, shape).convert::<B::IntElem>(), &self.device)
    }
}

impl <B: Backend> Batcher<MlmInputItem, MlmBatch<B>> for DataCollatorForLanguageModeling<B> {
    fn batch(&self, items: Vec<MlmInputItem>) -> MlmBatch<B> {
        let mut input_ids = items.into_iter()
            .map(|mut item| {
                item.input_ids.truncate(self.max_seq_length);
                item.input_ids
            })
            .collect::<Vec<_>>();

        let special = input_ids.iter()
            .map(|seq| seq.iter().map(|id| self.special_token_ids.contains(id)).collect())
            .collect::<Vec<Vec<bool>>>();

        let labels = if self.mlm {
            self.mask_tokens(&mut input_ids)
        } else {
            self.causal_labels(&input_ids)
        };
        let global = self.global_attention(&special, &labels);

        let tokens_list = input_ids.iter()
            .map(|seq| seq.iter().map(|id| *id as usize).collect())
            .collect();

        // let us first ensure that all sequences are padded to a common length
        let GeneratePaddingMask{tensor, mask} = generate_padding_mask::<B>(
            self.pad_token_id as usize,
            tokens_list,
            Some(self.max_seq_length),
            &self.device);

        let [batch_size, seq_length] = tensor.dims();
        let labels = self.to_tensor_of_shape([batch_size, seq_length], &labels, IGNORE_INDEX);
        let global_attention_mask = self.to_tensor_of_shape([batch_size, seq_length], &global, 0);
        let attention_mask = (!self.mlm)
            .then(|| generate_autoregressive_mask::<B>(batch_size, seq_length, &self.device));

        MlmBatch {
            input: BertInputBatch {
                input_ids: tensor,
                token_type_ids: None,
                padding_mask: Some(mask),
                attention_mask,
                global_attention_mask: Some(global_attention_mask),
            },
            labels,
            causal: !self.mlm,
        }
    }
}

/// Hyper parameters of the whole model. This is what a checkpoint stores in
/// its `config.json`.
#[derive(Debug, Config)]
pub struct BertForMaskedLMConfig {
    /// number of rows of the token embedding (and of lm decoder outputs)
    #[config(default="30522")]
    pub vocab_size: usize,
    #[config(default="0")]
    pub pad_token_id: usize,
    /// number of distinct token_type_ids
    #[config(default="2")]
    pub type_vocab_size: usize,
    /// longest sequence the position embedding can handle
    #[config(default="512")]
    pub max_position_embeddings: usize,
    #[config(default="768")]
    pub hidden_size: usize,
    /// dropout of the embedding layer
    #[config(default="0.1")]
    pub hidden_dropout_prob: f64,
    #[config(default="1e-12")]
    pub layer_norm_eps: f64,
    /// dropout inside the encoder layers
    #[config(default="0.1")]
    pub attention_probs_dropout_prob: f64,
    /// std deviation of the weights of fresh layers (also used for the rows
    /// added when the vocabulary grows)
    #[config(default="0.02")]
    pub initializer_range: f64,
    /// width of the feed forward sublayers
    #[config(default="3072")]
    pub intermediate_size: usize,
    #[config(default="12")]
    pub num_attention_heads: usize,
    #[config(default="12")]
    pub num_hidden_layers: usize,
}

/// A bert encoder topped with a language modeling head
#[derive(Debug, Module)]
pub struct BertForMaskedLM<B: Backend> {
    model: BertModel<B>,
    head: BertLMPredictionHead<B>,
}

impl BertForMaskedLMConfig {
    /// The base-size hyper parameters of the given architecture
    pub fn from_model_type(model_type: ModelType) -> Self {
        match model_type {
            ModelType::Bert => Self::new(),
            ModelType::Roberta => Self::new()
                .with_vocab_size(50265)
                .with_pad_token_id(1)
                .with_type_vocab_size(1)
                .with_max_position_embeddings(514)
                .with_layer_norm_eps(1e-5),
            ModelType::Longformer => Self::from_model_type(ModelType::Roberta)
                .with_max_position_embeddings(4098),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> BertForMaskedLM<B> {
        BertForMaskedLM {
            model: self.init_encoder(device),
            head: self.init_lm_head(device),
        }
    }
}

/// Average negative log likelihood of the targets that are not IGNORE_INDEX
pub fn masked_cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let ignored = targets.clone().equal_elem(IGNORE_INDEX);
    let kept = ignored.clone().bool_not().float();
    let targets = targets.mask_fill(ignored, 0);

    let log_probs = log_softmax(logits, 1);
    let picked: Tensor<B, 1> = log_probs.gather(1, targets.unsqueeze_dim::<2>(1)).squeeze(1);

    let nll = (picked * kept.clone()).sum().neg();
    nll / kept.sum().clamp_min(1.0)
}

impl <B: Backend> BertForMaskedLM<B> {
    /// Returns the logits of every position. Shape: [batch, sequence, vocab]
    pub fn forward(&self, input: BertInputBatch<B>) -> Tensor<B, 3> {
        let hidden = self.model.forward(input);
        self.head.forward(hidden)
    }

    /// Number of rows in the word embedding table
    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    /// Number of logits produced per position
    pub fn output_vocab_size(&self) -> usize {
        self.head.vocab_size()
    }

    /// Makes the model able to process a vocabulary of `new_size` tokens
    /// (both the input embedding and the lm decoder are resized).
    pub fn resize_token_embeddings(mut self, new_size: usize, initializer_range: f64) -> Self {
        self.model = self.model.resize_token_embeddings(new_size);
        self.head = self.head.resize_token_embeddings(new_size, initializer_range);
        self
    }

    pub fn forward_loss(&self, batch: MlmBatch<B>) -> ClassificationOutput<B> {
        let logits = self.forward(batch.input);
        let [b, s, v] = logits.dims();

        // in causal mode, position i predicts token i+1
        let (logits, labels) = if batch.causal && s > 1 {
            (logits.slice([0..b, 0..s - 1, 0..v]), batch.labels.slice([0..b, 1..s]))
        } else {
            (logits, batch.labels)
        };
        let [b, s, v] = logits.dims();

        let output = logits.reshape([b * s, v]);
        let targets = labels.reshape([b * s]);
        let loss = masked_cross_entropy(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

impl <B: AutodiffBackend> TrainStep<MlmBatch<B>, ClassificationOutput<B>> for BertForMaskedLM<B> {
    fn step(&self, batch: MlmBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let output = self.forward_loss(batch);
        TrainOutput::new(self, output.loss.backward(), output)
    }
}
impl <B: Backend> ValidStep<MlmBatch<B>, ClassificationOutput<B>> for BertForMaskedLM<B> {
    fn step(&self, batch: MlmBatch<B>) -> ClassificationOutput<B> {
        self.forward_loss(batch)
    }
}

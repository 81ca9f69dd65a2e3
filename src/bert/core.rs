use burn::{module::Module, nn::{transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput}, Initializer}, prelude::Backend, tensor::{Bool, Int, Tensor}};
use derive_builder::Builder;

use super::{BertEmbedding, BertForMaskedLMConfig};

/// What the encoder is fed with. Only `input_ids` is mandatory.
#[derive(Debug, Clone, Builder)]
pub struct BertInputBatch<B: Backend> {
    /// Shape: [batch, sequence]
    pub input_ids: Tensor<B, 2, Int>,
    /// Shape: [batch, sequence]
    #[builder(default)]
    pub token_type_ids: Option<Tensor<B, 2, Int>>,
    /// true on the padding positions
    /// Shape: [batch, sequence]
    #[builder(default)]
    pub padding_mask: Option<Tensor<B, 2, Bool>>,
    /// true where a position must not be attended to (e.g. the future in causal lm)
    /// Shape: [batch, sequence, sequence]
    #[builder(default)]
    pub attention_mask: Option<Tensor<B, 3, Bool>>,
    /// 1 on the positions that attend to (and are attended by) the whole sequence.
    /// The dense encoder already lets every position attend everywhere.
    /// Shape: [batch, sequence]
    #[builder(default)]
    pub global_attention_mask: Option<Tensor<B, 2, Int>>,
}

/// Token embeddings followed by a stack of self attention layers
#[derive(Debug, Module)]
pub struct BertModel<B: Backend> {
    pub hidden_size: usize,
    pub embedding: BertEmbedding<B>,
    pub encoder: TransformerEncoder<B>
}

impl BertForMaskedLMConfig {
    /// The encoder half of the model: post-norm layers, weights drawn from
    /// N(0, initializer_range)
    pub fn init_encoder<B: Backend>(&self, device: &B::Device) -> BertModel<B> {
        let encoder = TransformerEncoderConfig::new(
                self.hidden_size,
                self.intermediate_size,
                self.num_attention_heads,
                self.num_hidden_layers)
            .with_dropout(self.attention_probs_dropout_prob)
            .with_initializer(Initializer::Normal { mean: 0.0, std: self.initializer_range })
            .with_norm_first(false)
            .with_quiet_softmax(false)
            .init(device);

        BertModel { hidden_size: self.hidden_size, embedding: self.init_embedding(device), encoder }
    }
}

impl <B: Backend> BertModel<B> {
    /// Contextual embedding of every position. Shape: [batch, sequence, hidden]
    pub fn forward(&self, x: BertInputBatch<B>) -> Tensor<B, 3>{
        let embedded = self.embedding.forward(x.input_ids, x.token_type_ids);

        let mut input = TransformerEncoderInput::new(embedded);
        if let Some(pad_mask) = x.padding_mask {
            input = input.mask_pad(pad_mask);
        }
        if let Some(attn_mask) = x.attention_mask {
            input = input.mask_attn(attn_mask);
        }
        self.encoder.forward(input)
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.vocab_size()
    }

    pub fn resize_token_embeddings(mut self, new_size: usize) -> Self {
        self.embedding = self.embedding.resize_token_embeddings(new_size);
        self
    }
}

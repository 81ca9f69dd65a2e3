use burn::{module::{Module, Param}, nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig}, prelude::Backend, tensor::{Float, Int, Tensor}};

use super::BertForMaskedLMConfig;

/// Sum of the token, segment and position embeddings, normalized
#[derive(Debug, Module)]
pub struct BertEmbedding<B: Backend> {
    /// identifier of the pad token
    pub pad_token_id: usize,
    /// max length of any processable sequence
    pub max_position_embeddings: usize,
    word_embedding: Embedding<B>,
    /// indexed by token_type_id
    segment_embedding: Embedding<B>,
    /// absolute positions
    position_embedding: Embedding<B>,
    layer_norm: LayerNorm<B>,
    dropout: Dropout,
}

impl BertForMaskedLMConfig {
    /// Word, segment and absolute position embeddings sized after this config
    pub fn init_embedding<B: Backend>(&self, device: &B::Device) -> BertEmbedding<B> {
        let embedding = |rows| EmbeddingConfig::new(rows, self.hidden_size).init(device);
        BertEmbedding {
            pad_token_id:            self.pad_token_id,
            max_position_embeddings: self.max_position_embeddings,
            word_embedding:          embedding(self.vocab_size),
            segment_embedding:       embedding(self.type_vocab_size.max(1)),
            position_embedding:      embedding(self.max_position_embeddings),
            layer_norm:              LayerNormConfig::new(self.hidden_size).with_epsilon(self.layer_norm_eps).init(device),
            dropout:                 DropoutConfig::new(self.hidden_dropout_prob).init(),
        }
    }
}

impl <B: Backend> BertEmbedding<B> {
    pub fn forward(&self, input_ids: Tensor<B, 2, Int>, token_type_ids: Option<Tensor<B, 2, Int>>) -> Tensor<B, 3, Float> {
        let shape = input_ids.shape();
        let device = input_ids.device();
        let seq_len = shape.dims[1];

        let segments = token_type_ids.unwrap_or_else(|| Tensor::<B, 2, Int>::zeros(shape, &device));
        let positions = Tensor::arange(0..seq_len as i64, &device).unsqueeze();

        let embedding = self.word_embedding.forward(input_ids)
            + self.segment_embedding.forward(segments)
            + self.position_embedding.forward(positions);
        self.dropout.forward(self.layer_norm.forward(embedding))
    }

    /// Number of rows in the word embedding table
    pub fn vocab_size(&self) -> usize {
        self.word_embedding.weight.val().dims()[0]
    }

    /// Resizes the word embedding table to `new_size` rows. The rows that 
    /// already existed are kept untouched, the new ones are initialized the 
    /// same way a fresh embedding would be.
    pub fn resize_token_embeddings(mut self, new_size: usize) -> Self {
        let old = self.word_embedding.weight.val();
        let [old_size, hidden] = old.dims();
        if old_size == new_size {
            return self;
        }

        let keep = old_size.min(new_size);
        let mut resized = EmbeddingConfig::new(new_size, hidden).init(&old.device());
        let weight = resized.weight.val()
            .slice_assign([0..keep, 0..hidden], old.slice([0..keep, 0..hidden]));
        // parameters must wrap leaf tensors
        resized.weight = Param::from_tensor(weight.detach());

        self.word_embedding = resized;
        self
    }
}


#[cfg(test)]
mod tests {
    use burn::{backend::{ndarray::NdArrayDevice, Autodiff, NdArray}, module::AutodiffModule};

    use crate::bert::test::tiny_config;

    #[test]
    fn resize_keeps_existing_rows() {
        let device = NdArrayDevice::Cpu;
        let embedding = tiny_config(10).init_embedding::<NdArray>(&device);
        let before = embedding.word_embedding.weight.val();

        let embedding = embedding.resize_token_embeddings(12);
        assert_eq!(embedding.vocab_size(), 12);

        let after = embedding.word_embedding.weight.val();
        after.slice([0..10, 0..8]).into_data().assert_eq(&before.into_data(), true);

        let shrunk = embedding.resize_token_embeddings(6);
        assert_eq!(shrunk.vocab_size(), 6);
    }

    #[test]
    fn resize_works_on_a_differentiable_backend() {
        let device = NdArrayDevice::Cpu;
        let embedding = tiny_config(10).init_embedding::<Autodiff<NdArray>>(&device);
        let before = embedding.word_embedding.weight.val().inner();

        let embedding = embedding.resize_token_embeddings(12);
        assert_eq!(embedding.vocab_size(), 12);
        assert!(embedding.word_embedding.weight.val().is_require_grad());

        let after = embedding.valid().word_embedding.weight.val();
        after.slice([0..10, 0..8]).into_data().assert_eq(&before.into_data(), true);
    }
}

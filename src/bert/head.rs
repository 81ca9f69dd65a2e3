use burn::{module::{Module, Param}, nn::{Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig}, prelude::Backend, tensor::{activation::gelu, Tensor}};

use super::BertForMaskedLMConfig;

/// dense + gelu + layer norm, applied before the vocabulary projection
#[derive(Debug, Module)]
pub struct BertPredictionTransform<B: Backend> {
    dense: Linear<B>,
    layer_norm: LayerNorm<B>
}

impl <B: Backend> BertPredictionTransform<B> {
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        self.layer_norm.forward(gelu(self.dense.forward(hidden)))
    }
}

/// Scores every token of the vocabulary at every position
#[derive(Debug, Module)]
pub struct BertLMPredictionHead<B: Backend> {
    transform: BertPredictionTransform<B>,
    decoder: Linear<B>
}

/// A `hidden -> vocab_size` projection with a bias
fn decoder<B: Backend>(hidden: usize, vocab_size: usize, initializer_range: f64, device: &B::Device) -> Linear<B> {
    LinearConfig::new(hidden, vocab_size)
        .with_bias(true)
        .with_initializer(Initializer::Normal { mean: 0.0, std: initializer_range })
        .init(device)
}

impl BertForMaskedLMConfig {
    pub fn init_lm_head<B: Backend>(&self, device: &B::Device) -> BertLMPredictionHead<B> {
        let transform = BertPredictionTransform {
            dense: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
            layer_norm: LayerNormConfig::new(self.hidden_size).with_epsilon(self.layer_norm_eps).init(device),
        };
        let decoder = decoder(self.hidden_size, self.vocab_size, self.initializer_range, device);

        BertLMPredictionHead { transform, decoder }
    }
}

impl <B: Backend> BertLMPredictionHead<B> {
    /// Shape: [batch, sequence, hidden] -> [batch, sequence, vocab]
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        self.decoder.forward(self.transform.forward(hidden))
    }

    /// Number of logits produced per position
    pub fn vocab_size(&self) -> usize {
        self.decoder.weight.val().dims()[1]
    }

    /// Resizes the decoder so that it scores `new_size` tokens. The scores of
    /// the tokens that already existed are left unchanged.
    pub fn resize_token_embeddings(mut self, new_size: usize, initializer_range: f64) -> Self {
        let old_weight = self.decoder.weight.val();
        let [hidden, old_size] = old_weight.dims();
        if old_size == new_size {
            return self;
        }

        let keep = old_size.min(new_size);
        let mut resized = decoder::<B>(hidden, new_size, initializer_range, &old_weight.device());

        let weight = resized.weight.val()
            .slice_assign([0..hidden, 0..keep], old_weight.slice([0..hidden, 0..keep]));
        resized.weight = Param::from_tensor(weight.detach());

        resized.bias = match (resized.bias, &self.decoder.bias) {
            (Some(new_bias), Some(old_bias)) => Some(Param::from_tensor(
                new_bias.val().slice_assign([0..keep], old_bias.val().slice([0..keep])).detach())),
            (new_bias, _) => new_bias,
        };

        self.decoder = resized;
        self
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};

    use crate::bert::test::tiny_config;

    #[test]
    fn resize_keeps_existing_scores() {
        let device = NdArrayDevice::Cpu;
        let head = tiny_config(10).init_lm_head::<NdArray>(&device);
        let before = head.decoder.weight.val();

        let head = head.resize_token_embeddings(13, 0.02);
        assert_eq!(head.vocab_size(), 13);
        assert_eq!(head.decoder.bias.as_ref().map(|b| b.val().dims()), Some([13]));

        let after = head.decoder.weight.val();
        after.slice([0..8, 0..10]).into_data().assert_eq(&before.into_data(), true);
    }

    #[test]
    fn resize_works_on_a_differentiable_backend() {
        let device = NdArrayDevice::Cpu;
        let head = tiny_config(10).init_lm_head::<Autodiff<NdArray>>(&device);

        let head = head.resize_token_embeddings(32, 0.02);
        assert_eq!(head.vocab_size(), 32);
        assert!(head.decoder.weight.val().is_require_grad());
        assert!(head.decoder.bias.as_ref().map(|b| b.val().is_require_grad()).unwrap_or(false));
    }
}

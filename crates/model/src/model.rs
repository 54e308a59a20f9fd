use candle_core::{Result as CandleResult, Tensor};
use candle_nn::VarBuilder;
use gating::build_gate;
use layers::{checks, linear::expect_chain, Layer};
use pooling::build_pooling;

use crate::{
    block::ClusterBlock,
    config::{EncoderConfig, ModelConfig},
    encoder::{SequenceBlock, StackedEncoder, TransformerEncoder, TransformerEncoderBn},
    error::Result,
    heads::{build_head, Classifier},
};

/// Frame-level features to per-class probabilities.
///
/// Parameters live under `encoder`, `pooling`, `gate`, `head` and
/// `prediction_gate` below the supplied `VarBuilder`.
pub struct VideoClassifier {
    id: String,
    config: ModelConfig,
    encoder: Option<StackedEncoder>,
    pooling: Box<dyn Layer>,
    gate: Option<Box<dyn Layer>>,
    head: Box<dyn Classifier>,
    prediction_gate: Option<Box<dyn Layer>>,
}

impl VideoClassifier {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let norm = &config.norm;

        let encoder = config
            .encoder
            .as_ref()
            .map(|encoder| build_encoder(encoder, config, vb.pp("encoder")))
            .transpose()?;
        let encoded_dim = encoder
            .as_ref()
            .map_or(config.feature_size, |encoder| encoder.output_dim());

        let pooling = build_pooling(&config.pooling, encoded_dim, vb.pp("pooling"))?;
        let pooled_dim = config.pooling.output_dim(encoded_dim);

        let gate = config
            .gate
            .as_ref()
            .map(|gate| build_gate(gate, pooled_dim, norm, vb.pp("gate")))
            .transpose()?;

        let head = build_head(&config.head, pooled_dim, config.num_classes, norm, vb.pp("head"))?;
        expect_chain(head.id(), pooled_dim, head.input_dim())?;

        let prediction_gate = config
            .prediction_gate
            .as_ref()
            .map(|gate| build_gate(gate, head.num_classes(), norm, vb.pp("prediction_gate")))
            .transpose()?;

        let id = layers::scope_id(&vb, "video_classifier");
        log::info!(
            "built {id}: {} features over {} frames -> {} classes (encoded {encoded_dim}, pooled {pooled_dim})",
            config.feature_size,
            config.max_frames,
            config.num_classes
        );

        Ok(Self {
            id,
            config: config.clone(),
            encoder,
            pooling,
            gate,
            head,
            prediction_gate,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn head(&self) -> &dyn Classifier {
        self.head.as_ref()
    }

    /// Frame-level encoding before pooling, or the input itself without an encoder.
    pub fn encode(&self, frames: &Tensor, train: bool) -> CandleResult<Tensor> {
        checks::expect_batch_seq_hidden("video_classifier.frames", frames, self.config.feature_size)?;
        match &self.encoder {
            Some(encoder) => encoder.forward_t(frames, train),
            None => Ok(frames.clone()),
        }
    }

    /// Pooled (and gated) video-level vector fed to the head.
    pub fn video_features(&self, frames: &Tensor, train: bool) -> CandleResult<Tensor> {
        let pooled = self.pooling.forward_t(&self.encode(frames, train)?, train)?;
        match &self.gate {
            Some(gate) => gate.forward_t(&pooled, train),
            None => Ok(pooled),
        }
    }

    /// L2 penalty of the classifier head.
    pub fn regularization_loss(&self) -> CandleResult<Tensor> {
        self.head.regularization_loss()
    }
}

// Stages are trait objects, so they are shown by id.
impl std::fmt::Debug for VideoClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoClassifier")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("encoder", &self.encoder)
            .field("pooling", &self.pooling.id())
            .field("gate", &self.gate.as_ref().map(|gate| gate.id()))
            .field("head", &self.head.id())
            .field(
                "prediction_gate",
                &self.prediction_gate.as_ref().map(|gate| gate.id()),
            )
            .finish()
    }
}

impl Layer for VideoClassifier {
    fn id(&self) -> &str {
        &self.id
    }

    /// `(batch, frames, feature_size) -> (batch, num_classes)`.
    fn forward_t(&self, frames: &Tensor, train: bool) -> CandleResult<Tensor> {
        let features = self.video_features(frames, train)?;
        let predictions = self.head.forward_t(&features, train)?;
        match &self.prediction_gate {
            Some(gate) => gate.forward_t(&predictions, train),
            None => Ok(predictions),
        }
    }
}

fn build_encoder(
    encoder: &EncoderConfig,
    config: &ModelConfig,
    vb: VarBuilder,
) -> layers::Result<StackedEncoder> {
    let norm = &config.norm;
    let feature_size = config.feature_size;
    let max_frames = config.max_frames;
    match encoder {
        EncoderConfig::Transformer {
            transformer,
            num_blocks,
        } => StackedEncoder::new(*num_blocks, vb, |_, vb| {
            Ok(Box::new(TransformerEncoder::new(feature_size, transformer, norm, vb)?) as Box<dyn SequenceBlock>)
        }),
        EncoderConfig::TransformerBn {
            transformer,
            final_size,
            num_blocks,
        } => StackedEncoder::new(*num_blocks, vb, |index, vb| {
            let input = if index == 0 { feature_size } else { *final_size };
            Ok(Box::new(TransformerEncoderBn::new(
                input,
                max_frames,
                *final_size,
                transformer,
                norm,
                vb,
            )?) as Box<dyn SequenceBlock>)
        }),
        EncoderConfig::ClusterBlock { block, num_blocks } => {
            StackedEncoder::new(*num_blocks, vb, |index, vb| {
                let frames = if index == 0 { max_frames } else { block.num_clusters };
                Ok(Box::new(ClusterBlock::new(feature_size, frames, block, norm, vb)?) as Box<dyn SequenceBlock>)
            })
        }
    }
}

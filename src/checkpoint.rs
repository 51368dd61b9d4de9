//! Checkpoints
//!
//! A checkpoint holds everything needed to resume training or to generate
//! text later: model configuration and parameters, the vocabulary, the
//! optimizer state and the training progress.
//!
//! ## File Format
//!
//! ```text
//! "PUCK_CKPT"                       magic
//! u8                                format version (1)
//! u32 + JSON                        CheckpointMetadata
//! u32                               number of parameter tensors
//! tensor × n                        parameters, in model order
//! tensor × n, tensor × n            optimizer m then v (if metadata.optimizer is set)
//!
//! tensor = u32 rank, u32 × rank dims, u32 len, f32 × len
//! ```
//!
//! All integers and floats are little-endian. Files are written to a
//! temporary sibling and renamed into place, so an interrupted save never
//! leaves a truncated checkpoint behind.

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::model::Gpt;
use crate::optimizer::{AdamW, AdamWConfig};
use crate::tensor::Tensor;
use crate::vocab::Vocabulary;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 9] = b"PUCK_CKPT";
const VERSION: u8 = 1;
/// Upper bound on the JSON header; a config plus vocabulary is a few KB.
const MAX_METADATA_BYTES: usize = 1 << 20;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model: ModelConfig,
    pub vocab: Vocabulary,
    pub step: usize,
    pub best_val_loss: Option<f32>,
    #[serde(default)]
    pub last_eval_step: Option<usize>,
    pub optimizer: Option<OptimizerMetadata>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct OptimizerMetadata {
    pub config: AdamWConfig,
    pub step: usize,
}

/// Model, vocabulary and training state.
pub struct Checkpoint {
    pub model: Gpt,
    pub vocab: Vocabulary,
    /// Absent for inference-only checkpoints
    pub optimizer: Option<AdamW>,
    /// Training iterations completed
    pub step: usize,
    pub best_val_loss: Option<f32>,
    /// Step of the most recent loss estimate
    pub last_eval_step: Option<usize>,
}

impl Checkpoint {
    pub fn inference_only(model: Gpt, vocab: Vocabulary) -> Self {
        Self {
            model,
            vocab,
            optimizer: None,
            step: 0,
            best_val_loss: None,
            last_eval_step: None,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            self.write_to(&mut w)?;
            w.flush()?;
        }
        fs::rename(&tmp, path)?;

        info!(
            "saved checkpoint at step {} to {} ({} parameters{})",
            self.step,
            path.display(),
            self.model.num_parameters(),
            if self.optimizer.is_some() { " + optimizer state" } else { "" }
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut r = BufReader::new(File::open(path)?);
        let checkpoint = Self::read_from(&mut r)?;
        info!(
            "loaded checkpoint from {} (step {}, {} parameters)",
            path.display(),
            checkpoint.step,
            checkpoint.model.num_parameters()
        );
        Ok(checkpoint)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&[VERSION])?;

        let metadata = CheckpointMetadata {
            model: self.model.config().clone(),
            vocab: self.vocab.clone(),
            step: self.step,
            best_val_loss: self.best_val_loss,
            last_eval_step: self.last_eval_step,
            optimizer: self.optimizer.as_ref().map(|opt| OptimizerMetadata {
                config: opt.config,
                step: opt.step,
            }),
        };
        let json = serde_json::to_vec(&metadata)?;
        write_u32(w, json.len())?;
        w.write_all(&json)?;

        let params = self.model.params();
        write_u32(w, params.len())?;
        for p in params {
            write_tensor(w, p)?;
        }
        if let Some(opt) = &self.optimizer {
            for t in opt.m.iter().chain(&opt.v) {
                write_tensor(w, t)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; MAGIC.len()];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ModelError::Format("not a puck checkpoint".to_string()));
        }
        let mut version = [0u8; 1];
        r.read_exact(&mut version)?;
        if version[0] != VERSION {
            return Err(ModelError::Format(format!(
                "unsupported checkpoint version {}",
                version[0]
            )));
        }

        let len = read_u32(r)?;
        if len > MAX_METADATA_BYTES {
            return Err(ModelError::Format(format!(
                "metadata of {len} bytes exceeds the {MAX_METADATA_BYTES} byte limit"
            )));
        }
        let mut json = vec![0u8; len];
        r.read_exact(&mut json)?;
        let metadata: CheckpointMetadata = serde_json::from_slice(&json)?;
        if metadata.vocab.len() != metadata.model.vocab_size {
            return Err(ModelError::Format(format!(
                "vocabulary has {} characters but the model expects {}",
                metadata.vocab.len(),
                metadata.model.vocab_size
            )));
        }

        // Parameters are overwritten below; the seed only shapes the allocation.
        let mut model = Gpt::new(&metadata.model, &mut StdRng::seed_from_u64(0))?;

        let count = read_u32(r)?;
        let expected = model.params().len();
        if count != expected {
            return Err(ModelError::Format(format!(
                "checkpoint stores {count} parameter tensors, model has {expected}"
            )));
        }
        for param in model.params_mut() {
            *param.tensor = read_tensor(r, &param.tensor.shape)?;
        }

        let optimizer = match metadata.optimizer {
            Some(meta) => {
                let mut opt = AdamW::new(&model, meta.config);
                opt.step = meta.step;
                let shapes: Vec<Vec<usize>> =
                    model.params().iter().map(|p| p.shape.clone()).collect();
                for moments in [&mut opt.m, &mut opt.v] {
                    for (slot, shape) in moments.iter_mut().zip(&shapes) {
                        *slot = read_tensor(r, shape)?;
                    }
                }
                Some(opt)
            }
            None => None,
        };

        Ok(Self {
            model,
            vocab: metadata.vocab,
            optimizer,
            step: metadata.step,
            best_val_loss: metadata.best_val_loss,
            last_eval_step: metadata.last_eval_step,
        })
    }
}

fn write_u32<W: Write>(w: &mut W, value: usize) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| ModelError::Format(format!("{value} does not fit in 32 bits")))?;
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<usize> {
    let mut bytes = [0u8; 4];
    r.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes) as usize)
}

fn write_tensor<W: Write>(w: &mut W, tensor: &Tensor) -> Result<()> {
    write_u32(w, tensor.shape.len())?;
    for &dim in &tensor.shape {
        write_u32(w, dim)?;
    }
    write_u32(w, tensor.data.len())?;
    for &val in &tensor.data {
        w.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

/// Read one tensor, rejecting any header that disagrees with `expected`
/// before the data is allocated.
fn read_tensor<R: Read>(r: &mut R, expected: &[usize]) -> Result<Tensor> {
    let rank = read_u32(r)?;
    if rank != expected.len() {
        return Err(ModelError::shape(
            "checkpoint tensor",
            format!("{expected:?}"),
            format!("rank {rank}"),
        ));
    }
    let shape = (0..rank).map(|_| read_u32(r)).collect::<Result<Vec<_>>>()?;
    if shape != expected {
        return Err(ModelError::shape(
            "checkpoint tensor",
            format!("{expected:?}"),
            format!("{shape:?}"),
        ));
    }
    let len = read_u32(r)?;
    if shape.iter().product::<usize>() != len {
        return Err(ModelError::Format(format!(
            "tensor of shape {shape:?} cannot hold {len} values"
        )));
    }

    let mut bytes = vec![0u8; len * 4];
    r.read_exact(&mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Tensor::new(data, shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Mode;

    fn fixture() -> Checkpoint {
        let vocab = Vocabulary::from_text("abcdef\n");
        let config = ModelConfig {
            vocab_size: vocab.len(),
            context_length: 4,
            n_embd: 8,
            n_head: 2,
            n_layer: 1,
            dropout: 0.1,
            activation: Default::default(),
        };
        let mut rng = StdRng::seed_from_u64(42);
        let mut model = Gpt::new(&config, &mut rng).unwrap();
        let mut opt = AdamW::new(&model, AdamWConfig::default());
        let (_, grads) = model
            .loss_and_gradients(&[vec![0, 1, 2]], &[vec![1, 2, 3]], Mode::Train, &mut rng)
            .unwrap();
        opt.update(&mut model, &grads, 1e-2).unwrap();

        Checkpoint {
            model,
            vocab,
            optimizer: Some(opt),
            step: 17,
            best_val_loss: Some(1.5),
            last_eval_step: Some(17),
        }
    }

    #[test]
    fn test_roundtrip_restores_everything() {
        let original = fixture();
        let mut bytes = Vec::new();
        original.write_to(&mut bytes).unwrap();
        let restored = Checkpoint::read_from(&mut bytes.as_slice()).unwrap();

        assert_eq!(restored.step, 17);
        assert_eq!(restored.best_val_loss, Some(1.5));
        assert_eq!(restored.last_eval_step, Some(17));
        assert_eq!(restored.vocab, original.vocab);
        assert_eq!(restored.model.config(), original.model.config());
        assert_eq!(restored.model.params(), original.model.params());

        let (a, b) = (original.optimizer.unwrap(), restored.optimizer.unwrap());
        assert_eq!(a.step, b.step);
        assert_eq!(a.m, b.m);
        assert_eq!(a.v, b.v);
    }

    #[test]
    fn test_inference_only_has_no_optimizer() {
        let Checkpoint { model, vocab, .. } = fixture();
        let mut bytes = Vec::new();
        Checkpoint::inference_only(model, vocab)
            .write_to(&mut bytes)
            .unwrap();
        let restored = Checkpoint::read_from(&mut bytes.as_slice()).unwrap();
        assert!(restored.optimizer.is_none());
        assert_eq!(restored.best_val_loss, None);
    }

    #[test]
    fn test_corrupt_input_is_rejected() {
        let mut bytes = Vec::new();
        fixture().write_to(&mut bytes).unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            Checkpoint::read_from(&mut bad_magic.as_slice()),
            Err(ModelError::Format(_))
        ));

        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            Checkpoint::read_from(&mut &truncated[..]),
            Err(ModelError::Io(_))
        ));
    }

    /// Byte offset of the first tensor header, just past the tensor count.
    fn first_tensor_offset(bytes: &[u8]) -> usize {
        let json_start = MAGIC.len() + 1 + 4;
        let json_len = u32::from_le_bytes([
            bytes[json_start - 4],
            bytes[json_start - 3],
            bytes[json_start - 2],
            bytes[json_start - 1],
        ]) as usize;
        json_start + json_len + 4
    }

    #[test]
    fn test_oversized_headers_are_rejected_before_allocation() {
        let mut bytes = Vec::new();
        fixture().write_to(&mut bytes).unwrap();

        let mut huge_metadata = bytes.clone();
        let len_at = MAGIC.len() + 1;
        huge_metadata[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Checkpoint::read_from(&mut huge_metadata.as_slice()),
            Err(ModelError::Format(_))
        ));

        // First tensor is the [vocab, n_embd] token table: rank, 2 dims, len
        let tensor_at = first_tensor_offset(&bytes);
        let mut huge_dim = bytes.clone();
        huge_dim[tensor_at + 4..tensor_at + 8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Checkpoint::read_from(&mut huge_dim.as_slice()),
            Err(ModelError::Shape { .. })
        ));

        let mut huge_len = bytes.clone();
        huge_len[tensor_at + 12..tensor_at + 16].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Checkpoint::read_from(&mut huge_len.as_slice()),
            Err(ModelError::Format(_))
        ));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = std::env::temp_dir().join(format!("puck-ckpt-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.ckpt");

        let original = fixture();
        original.save(&path).unwrap();
        let restored = Checkpoint::load(&path).unwrap();
        assert_eq!(restored.model.params(), original.model.params());
        assert!(!path.with_extension("tmp").exists());

        fs::remove_dir_all(&dir).unwrap();
    }
}

//! Model parameter sources and the per-layer parameter schema.
//!
//! A [`ParameterSource`] maps PyTorch `state_dict` names (`conv_1.weight`,
//! `res.3.norm_2.running_var`, ...) to f32 tensors. The schema structs pull
//! the keys a layer needs and validate their shapes before any layer is built,
//! so a malformed checkpoint fails at construction time.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::Context;
use ndarray::{Array1, Array4};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Result, ToonError};

/// Wrapper key the training script nests the generator weights under.
pub const TRAINING_KEY_PREFIX: &str = "g_state_dict.";

#[derive(Debug, Clone, PartialEq)]
pub struct ParamTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl ParamTensor {
    pub fn new(key: &str, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ToonError::InvalidParameter {
                key: key.to_string(),
                reason: format!(
                    "shape {shape:?} needs {expected} values, storage holds {}",
                    data.len()
                ),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![value; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn into_array1(self, key: &str) -> Result<Array1<f32>> {
        if self.shape.len() != 1 {
            return Err(ToonError::shape_mismatch(
                format!("{key} rank"),
                vec![1],
                vec![self.shape.len()],
            ));
        }
        Ok(Array1::from(self.data))
    }

    fn into_array4(self, key: &str) -> Result<Array4<f32>> {
        let dims = match self.shape.as_slice() {
            &[a, b, c, d] => (a, b, c, d),
            other => {
                return Err(ToonError::shape_mismatch(
                    format!("{key} rank"),
                    vec![4],
                    vec![other.len()],
                ))
            }
        };
        Array4::from_shape_vec(dims, self.data).map_err(|error| ToonError::InvalidParameter {
            key: key.to_string(),
            reason: error.to_string(),
        })
    }
}

/// Anything that can look up parameter tensors by their `state_dict` name.
pub trait ParameterSource {
    /// `Ok(None)` when the key is absent; `Err` when present but unusable.
    fn tensor(&self, key: &str) -> Result<Option<ParamTensor>>;

    fn keys(&self) -> Vec<String>;
}

/// In-memory parameter source, also the decoded form of a safetensors file.
#[derive(Debug, Clone, Default)]
pub struct ParameterMap {
    tensors: BTreeMap<String, ParamTensor>,
    /// Keys present in the file with a non-f32 dtype, and why they were rejected.
    rejected: BTreeMap<String, String>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: ParamTensor) {
        let key = key.into();
        self.rejected.remove(&key);
        self.tensors.insert(key, tensor);
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamTensor> {
        self.tensors.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&ParamTensor> {
        self.tensors.get(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamTensor)> {
        self.tensors.iter()
    }

    /// Strips `prefix` from every key that carries it; other keys are kept as-is.
    pub fn strip_prefix(self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self;
        }
        let rename = |key: String| match key.strip_prefix(prefix) {
            Some(stripped) => stripped.to_string(),
            None => key,
        };
        Self {
            tensors: self
                .tensors
                .into_iter()
                .map(|(key, tensor)| (rename(key), tensor))
                .collect(),
            rejected: self
                .rejected
                .into_iter()
                .map(|(key, reason)| (rename(key), reason))
                .collect(),
        }
    }

    /// Applies the configured prefix, or the training wrapper prefix when no
    /// prefix is configured and every key carries it.
    pub fn normalize_keys(self, configured_prefix: &str) -> Self {
        if !configured_prefix.is_empty() {
            return self.strip_prefix(configured_prefix);
        }
        let all_wrapped = !self.tensors.is_empty()
            && self
                .tensors
                .keys()
                .chain(self.rejected.keys())
                .all(|key| key.starts_with(TRAINING_KEY_PREFIX));
        if all_wrapped {
            debug!(prefix = TRAINING_KEY_PREFIX, "Stripping training key prefix");
            self.strip_prefix(TRAINING_KEY_PREFIX)
        } else {
            self
        }
    }
}

impl ParameterSource for ParameterMap {
    fn tensor(&self, key: &str) -> Result<Option<ParamTensor>> {
        if let Some(reason) = self.rejected.get(key) {
            return Err(ToonError::InvalidParameter {
                key: key.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(self.tensors.get(key).cloned())
    }

    fn keys(&self) -> Vec<String> {
        self.tensors
            .keys()
            .chain(self.rejected.keys())
            .cloned()
            .collect()
    }
}

/// Reads every tensor of a safetensors file. Only f32 tensors are decoded;
/// others (`num_batches_tracked` is i64) are recorded as rejected and fail
/// only if a layer asks for them.
pub fn load_safetensors(path: &Path) -> Result<ParameterMap> {
    let source_error = |reason: String| ToonError::MissingParameterSource {
        path: path.to_path_buf(),
        reason,
    };

    let buffer = fs::read(path).map_err(|error| source_error(error.to_string()))?;
    let file = SafeTensors::deserialize(&buffer)
        .map_err(|error| source_error(format!("not a safetensors file: {error}")))?;

    let mut map = ParameterMap::new();
    for (name, view) in file.tensors() {
        if view.dtype() != Dtype::F32 {
            map.rejected
                .insert(name, format!("expected dtype F32, found {:?}", view.dtype()));
            continue;
        }
        let bytes = view.data();
        if bytes.len() % 4 != 0 {
            return Err(ToonError::InvalidParameter {
                key: name,
                reason: format!("{} bytes is not a whole number of f32 values", bytes.len()),
            });
        }
        let data = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let tensor = ParamTensor::new(&name, view.shape().to_vec(), data)?;
        map.tensors.insert(name, tensor);
    }

    info!(
        path = %path.display(),
        tensors = map.tensors.len(),
        rejected = map.rejected.len(),
        "Loaded parameter file"
    );
    Ok(map)
}

/// Writes the f32 tensors of `map` as a safetensors file.
pub fn save_safetensors(map: &ParameterMap, path: &Path) -> anyhow::Result<()> {
    let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = map
        .iter()
        .map(|(key, tensor)| {
            let bytes = tensor.data().iter().flat_map(|v| v.to_le_bytes()).collect();
            (key.clone(), tensor.shape().to_vec(), bytes)
        })
        .collect();

    let mut views = Vec::with_capacity(encoded.len());
    for (key, shape, bytes) in &encoded {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .with_context(|| format!("Invalid tensor '{key}'"))?;
        views.push((key.as_str(), view));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    safetensors::serialize_to_file(views, &None, path)
        .with_context(|| format!("Failed to write parameter file: {}", path.display()))?;
    info!(path = %path.display(), tensors = map.len(), "Wrote parameter file");
    Ok(())
}

pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}

/// Compares the file's SHA-256 against `expected` (hex, case-insensitive).
pub fn verify_checksum(path: &Path, expected: &str) -> anyhow::Result<()> {
    let expected = expected.trim().to_ascii_lowercase();
    info!(path = %path.display(), "Verifying SHA256 hash");
    let actual = sha256_file(path)?;
    if actual != expected {
        return Err(ToonError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected,
            actual,
        }
        .into());
    }
    info!(path = %path.display(), "Hash verified OK");
    Ok(())
}

fn require(source: &dyn ParameterSource, key: &str, expected: &[usize]) -> Result<ParamTensor> {
    let tensor = source
        .tensor(key)?
        .ok_or_else(|| ToonError::MissingParameter {
            key: key.to_string(),
        })?;
    if tensor.shape() != expected {
        return Err(ToonError::shape_mismatch(
            key,
            expected.to_vec(),
            tensor.shape().to_vec(),
        ));
    }
    Ok(tensor)
}

/// Kernel and bias of one convolution. The kernel shape is whatever the
/// layer kind prescribes: (out, in, kH, kW) for a convolution, (in, out, kH,
/// kW) for a transposed convolution.
#[derive(Debug, Clone)]
pub struct ConvParams {
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
}

impl ConvParams {
    pub fn load(
        source: &dyn ParameterSource,
        name: &str,
        weight_shape: [usize; 4],
        out_channels: usize,
    ) -> Result<Self> {
        let weight_key = format!("{name}.weight");
        let bias_key = format!("{name}.bias");
        let weight = require(source, &weight_key, &weight_shape)?.into_array4(&weight_key)?;
        let bias = require(source, &bias_key, &[out_channels])?.into_array1(&bias_key)?;
        Ok(Self { weight, bias })
    }
}

#[derive(Debug, Clone)]
pub struct NormParams {
    pub scale: Array1<f32>,
    pub shift: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
}

impl NormParams {
    pub fn load(source: &dyn ParameterSource, name: &str, channels: usize) -> Result<Self> {
        let vector = |suffix: &str| {
            let key = format!("{name}.{suffix}");
            require(source, &key, &[channels])?.into_array1(&key)
        };
        Ok(Self {
            scale: vector("weight")?,
            shift: vector("bias")?,
            running_mean: vector("running_mean")?,
            running_var: vector("running_var")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResidualParams {
    pub conv_1: ConvParams,
    pub norm_1: NormParams,
    pub conv_2: ConvParams,
    pub norm_2: NormParams,
}

impl ResidualParams {
    pub const KERNEL: usize = 3;

    pub fn load(source: &dyn ParameterSource, name: &str, channels: usize) -> Result<Self> {
        let kernel = [channels, channels, Self::KERNEL, Self::KERNEL];
        Ok(Self {
            conv_1: ConvParams::load(source, &format!("{name}.conv_1"), kernel, channels)?,
            norm_1: NormParams::load(source, &format!("{name}.norm_1"), channels)?,
            conv_2: ConvParams::load(source, &format!("{name}.conv_2"), kernel, channels)?,
            norm_2: NormParams::load(source, &format!("{name}.norm_2"), channels)?,
        })
    }
}

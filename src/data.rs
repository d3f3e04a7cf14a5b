//! On-disk experiment tensors: validation token data and the
//! repeat-candidate mask.
//!
//! Files come from a local cache directory or are fetched from a hub
//! repository. Both accessors take their location from a [`DataConfig`]
//! rather than a hardcoded path.

use anyhow::{Context, Result};
use candle_core::pickle::{Object, Stack};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::Api;
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Cache directory the validation files were historically read from
pub const DEFAULT_CACHE_DIR: &str = "/data/yunzhi/hugging_cache/redwood_attn_2l";
/// Hub repository publishing the same files
pub const DEFAULT_REPO_ID: &str = "ArthurConmy/redwood_attn_2l";
pub const VALIDATION_FILE: &str = "validation_data.pt";
pub const MASK_FILE: &str = "mask_repeat_candidates.pkl";

/// Where data files are read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    Local(PathBuf),
    Hub { repo_id: String },
}

/// Location of the validation tokens and repeat-candidate mask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConfig {
    pub source: DataSource,
    pub validation_file: String,
    pub mask_file: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self::local(DEFAULT_CACHE_DIR)
    }
}

impl DataConfig {
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: DataSource::Local(dir.into()),
            validation_file: VALIDATION_FILE.to_string(),
            mask_file: MASK_FILE.to_string(),
        }
    }

    pub fn hub(repo_id: impl Into<String>) -> Self {
        Self {
            source: DataSource::Hub {
                repo_id: repo_id.into(),
            },
            validation_file: VALIDATION_FILE.to_string(),
            mask_file: MASK_FILE.to_string(),
        }
    }

    /// Local path of `filename`, downloading it first for hub sources
    pub fn resolve(&self, filename: &str) -> Result<PathBuf> {
        match &self.source {
            DataSource::Local(dir) => {
                let path = dir.join(filename);
                anyhow::ensure!(path.exists(), "{} not found", path.display());
                Ok(path)
            }
            DataSource::Hub { repo_id } => {
                info!("Downloading {filename} from {repo_id}");
                let api = Api::new()?;
                api.model(repo_id.clone())
                    .get(filename)
                    .with_context(|| format!("Failed to download {filename} from {repo_id}"))
            }
        }
    }
}

/// Token tensor `[examples, positions]` as `U32`.
///
/// `num_examples` limits rows and `seq_len` limits columns, each on its
/// own; limits beyond the tensor size are clamped.
pub fn get_data(
    config: &DataConfig,
    num_examples: Option<usize>,
    seq_len: Option<usize>,
    device: &Device,
) -> Result<Tensor> {
    let path = config.resolve(&config.validation_file)?;
    let data = load_tensor(&path, "data")?
        .to_dtype(DType::U32)
        .context("Validation data is not an integer tensor")?;
    let data = slice_limits(&data, num_examples, seq_len)?;
    debug!("Validation data: {:?}", data.dims());
    Ok(data.to_device(device)?)
}

/// Indicator tensor `[examples, positions]` as `U8` (0/1) marking the
/// positions eligible as repeat evaluation targets. Slicing follows
/// [`get_data`].
pub fn get_mask_repeat_candidates(
    config: &DataConfig,
    num_examples: Option<usize>,
    seq_len: Option<usize>,
    device: &Device,
) -> Result<Tensor> {
    let path = config.resolve(&config.mask_file)?;
    let mask = load_tensor(&path, "mask")?;
    let mask = if mask.dtype() == DType::U8 {
        mask.ne(0u8)?
    } else {
        mask.to_dtype(DType::F32)?.ne(0f32)?
    };
    let mask = slice_limits(&mask, num_examples, seq_len)?;
    debug!("Repeat-candidate mask: {:?}", mask.dims());
    Ok(mask.to_device(device)?)
}

/// Leading `num_examples` rows and `seq_len` columns, as an owned copy
pub fn slice_limits(
    tensor: &Tensor,
    num_examples: Option<usize>,
    seq_len: Option<usize>,
) -> Result<Tensor> {
    let (rows, cols) = tensor.dims2()?;
    let rows = num_examples.map_or(rows, |n| n.min(rows));
    let cols = seq_len.map_or(cols, |s| s.min(cols));
    Ok(tensor.narrow(0, 0, rows)?.narrow(1, 0, cols)?.contiguous()?)
}

/// Read the tensor stored in `path`.
///
/// Safetensors files and PyTorch state dicts may hold several entries;
/// the one named `key` wins, otherwise the file must hold exactly one.
fn load_tensor(path: &Path, key: &str) -> Result<Tensor> {
    let is_safetensors = path.extension().is_some_and(|ext| ext == "safetensors");
    let mut entries: Vec<(String, Tensor)> = if is_safetensors {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let st = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("Failed to deserialize {}", path.display()))?;
        st.tensors()
            .iter()
            .map(|(name, view)| Ok((name.clone(), tensor_from_view(view, &Device::Cpu)?)))
            .collect::<Result<_>>()?
    } else {
        let entries = candle_core::pickle::read_all(path)
            .with_context(|| format!("Failed to read PyTorch file {}", path.display()))?;
        if entries.is_empty() {
            // `torch.save(tensor)` pickles the tensor itself rather than a dict
            let tensor = read_torch_tensor(path)
                .with_context(|| format!("Failed to read PyTorch tensor {}", path.display()))?;
            vec![(key.to_string(), tensor)]
        } else {
            entries
        }
    };

    if let Some(idx) = entries.iter().position(|(name, _)| name == key) {
        return Ok(entries.swap_remove(idx).1);
    }
    match entries.len() {
        1 => Ok(entries.swap_remove(0).1),
        0 => anyhow::bail!("{} holds no tensors", path.display()),
        n => anyhow::bail!(
            "{} holds {n} tensors and none is named '{key}'",
            path.display()
        ),
    }
}

fn unexpected(obj: Object) -> anyhow::Error {
    anyhow::anyhow!("Unexpected pickle object {obj:?}")
}

fn usize_tuple(obj: Object) -> Result<Vec<usize>> {
    obj.tuple()
        .map_err(unexpected)?
        .into_iter()
        .map(|v| Ok(v.int_or_long().map_err(unexpected)? as usize))
        .collect()
}

/// Element type of a torch storage class. Bools are stored one byte each.
fn storage_dtype(class_name: &str) -> Result<DType> {
    Ok(match class_name {
        "BoolStorage" | "ByteStorage" => DType::U8,
        "LongStorage" => DType::I64,
        "HalfStorage" => DType::F16,
        "BFloat16Storage" => DType::BF16,
        "FloatStorage" => DType::F32,
        "DoubleStorage" => DType::F64,
        other => anyhow::bail!("Unsupported torch storage {other}"),
    })
}

/// Location and layout of a pickled tensor inside its archive
#[derive(Debug)]
struct TorchTensorRef {
    storage: String,
    dtype: DType,
    offset: usize,
    shape: Vec<usize>,
    stride: Vec<usize>,
}

impl TorchTensorRef {
    /// Decode a `_rebuild_tensor_v2(storage, offset, size, stride, ...)`
    /// call, looking through parameter and subclass wrappers
    fn from_pickle(obj: Object) -> Result<Self> {
        let (callable, args) = obj.reduce().map_err(unexpected)?;
        let (module, class) = callable.class().map_err(unexpected)?;
        let mut args = args.tuple().map_err(unexpected)?;
        match (module.as_str(), class.as_str()) {
            ("torch._utils", "_rebuild_tensor_v2") => {}
            ("torch._utils", "_rebuild_parameter") => {
                anyhow::ensure!(!args.is_empty(), "Empty parameter rebuild");
                return Self::from_pickle(args.swap_remove(0));
            }
            ("torch._tensor", "_rebuild_from_type_v2") => {
                // (func, type, args, state)
                anyhow::ensure!(args.len() >= 3, "Truncated subclass rebuild");
                let inner_args = args.swap_remove(2);
                let func = args.swap_remove(0);
                return Self::from_pickle(Object::Reduce {
                    callable: Box::new(func),
                    args: Box::new(inner_args),
                });
            }
            _ => anyhow::bail!("{module}.{class} does not rebuild a tensor"),
        }

        anyhow::ensure!(args.len() >= 4, "Truncated tensor rebuild arguments");
        args.truncate(4);
        let stride = usize_tuple(args.swap_remove(3))?;
        let shape = usize_tuple(args.swap_remove(2))?;
        let offset = args.swap_remove(1).int_or_long().map_err(unexpected)? as usize;

        // ("storage", <class>, key, location, numel)
        let mut storage = args
            .swap_remove(0)
            .persistent_load()
            .map_err(unexpected)?
            .tuple()
            .map_err(unexpected)?;
        anyhow::ensure!(storage.len() >= 3, "Truncated storage reference");
        storage.truncate(3);
        let key = storage.swap_remove(2).unicode().map_err(unexpected)?;
        let (_, class) = storage.swap_remove(1).class().map_err(unexpected)?;

        Ok(Self {
            storage: key,
            dtype: storage_dtype(&class)?,
            offset,
            shape,
            stride,
        })
    }

    /// Cut the tensor out of its raw storage bytes
    fn materialize(&self, bytes: &[u8]) -> Result<Tensor> {
        let mut expected = vec![1; self.shape.len()];
        for i in (0..self.shape.len().saturating_sub(1)).rev() {
            expected[i] = expected[i + 1] * self.shape[i + 1];
        }
        let contiguous = self
            .shape
            .iter()
            .zip(self.stride.iter().zip(&expected))
            .all(|(&dim, (&stride, &want))| dim <= 1 || stride == want);
        anyhow::ensure!(
            contiguous,
            "Strided tensors are not supported (shape {:?}, stride {:?})",
            self.shape,
            self.stride
        );

        let elem_size = self.dtype.size_in_bytes();
        let n_storage = bytes.len() / elem_size;
        let n_elems: usize = self.shape.iter().product();
        anyhow::ensure!(
            self.offset + n_elems <= n_storage,
            "Storage {} holds {n_storage} elements, tensor needs {}",
            self.storage,
            self.offset + n_elems
        );
        let flat = Tensor::from_raw_buffer(
            &bytes[..n_storage * elem_size],
            self.dtype,
            &[n_storage],
            &Device::Cpu,
        )?;
        Ok(flat.narrow(0, self.offset, n_elems)?.reshape(self.shape.clone())?)
    }
}

/// Read a zip archive written by `torch.save(tensor)`
fn read_torch_tensor(path: &Path) -> Result<Tensor> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;
    let pickle_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .context("Archive has no data.pkl")?;
    let record_dir = &pickle_name[..pickle_name.len() - ".pkl".len()];

    let obj = {
        let mut reader = BufReader::new(archive.by_name(&pickle_name)?);
        let mut stack = Stack::empty();
        stack.read_loop(&mut reader)?;
        stack.finalize()?
    };
    let tensor_ref = TorchTensorRef::from_pickle(obj)?;
    debug!("Pickled tensor {:?}", tensor_ref);

    let mut bytes = Vec::new();
    archive
        .by_name(&format!("{record_dir}/{}", tensor_ref.storage))?
        .read_to_end(&mut bytes)?;
    tensor_ref.materialize(&bytes)
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BOOL | safetensors::Dtype::U8 => DType::U8,
        safetensors::Dtype::U32 => DType::U32,
        safetensors::Dtype::I64 => DType::I64,
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::F64 => DType::F64,
        other => anyhow::bail!("Unsupported tensor dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}

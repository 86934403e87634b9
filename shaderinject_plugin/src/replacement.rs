//! Where replacement shaders come from, and where dumped ones go.
//!
//! Files are named `<short>_<ID>_<stage>.bin` and grouped in a directory per technique,
//! where `<short>` is the technique name up to its first `-` and `<ID>` the technique id
//! in upper case hex.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Once,
};

use parking_lot::Mutex;
use shaderinject_stream::SubobjectType;
use strum::{Display, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Vs,
    Ps,
    Hs,
    Ds,
    Gs,
    Cs,
    As,
    Ms,
    #[strum(serialize = "rsg")]
    RootSignature,
}

impl Stage {
    pub fn from_subobject(ty: SubobjectType) -> Option<Self> {
        use SubobjectType as T;
        Some(match ty {
            T::Vs => Self::Vs,
            T::Ps => Self::Ps,
            T::Hs => Self::Hs,
            T::Ds => Self::Ds,
            T::Gs => Self::Gs,
            T::Cs => Self::Cs,
            T::As => Self::As,
            T::Ms => Self::Ms,
            T::RootSignature => Self::RootSignature,
            _ => return None,
        })
    }
    pub fn prefix(self) -> &'static str {
        self.into()
    }
}

/// Decides whether a shader or root signature blob gets swapped.
pub trait ReplacementPolicy: Send + Sync {
    /// Bytes to use instead of `current`, or `None` to keep it.
    fn replacement(
        &self,
        stage: Stage,
        technique_id: u64,
        technique_name: &str,
        current: &[u8],
    ) -> Option<Vec<u8>>;

    /// Directory whose changes should trigger a live update.
    fn watch_root(&self) -> Option<&Path> {
        None
    }
}

pub fn short_name(technique_name: &str) -> &str {
    technique_name
        .split_once('-')
        .map_or(technique_name, |(short, _)| short)
}

pub fn file_name(short_name: &str, technique_id: u64, stage: Stage) -> String {
    format!("{short_name}_{technique_id:X}_{stage}.bin")
}

pub fn fnv1a32(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5, |hash, b| {
        (hash ^ *b as u32).wrapping_mul(0x0100_0193)
    })
}

pub const TECHNIQUE_MAP: &str = "ShaderTechniqueMap.csv";

#[derive(Debug)]
enum Mode {
    Replace { root: PathBuf },
    Dump { root: PathBuf, lock: Mutex<()> },
}

/// Replacement from files on disk, or dumping to disk without replacing anything.
#[derive(Debug)]
pub struct FilePolicy {
    mode: Mode,
}

impl FilePolicy {
    /// Replace with files found under `root`.
    pub fn replace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        tracing::info!("Using custom shader root directory: {}", root.display());
        Self {
            mode: Mode::Replace { root },
        }
    }

    /// Write every shader seen under `root` and index it in `root/ShaderTechniqueMap.csv`.
    pub fn dump(root: impl Into<PathBuf>) -> Self {
        Self {
            mode: Mode::Dump {
                root: root.into(),
                lock: Mutex::new(()),
            },
        }
    }

    /// Replacement root of a host started from `working_dir`.
    pub fn default_root(working_dir: &Path) -> PathBuf {
        working_dir.join("Data").join("shadersfx")
    }

    fn read_replacement(root: &Path, path: &Path, current: &[u8]) -> Option<Vec<u8>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::debug!("could not read {}: {e}", path.display());
                return None;
            }
        };
        static FIRST: Once = Once::new();
        FIRST.call_once(|| {
            tracing::info!(
                "Trying to replace at least one shader under {}",
                root.display()
            )
        });
        if data == current {
            return None;
        }
        tracing::trace!("Used file replacement: {}", path.display());
        Some(data)
    }

    fn dump_shader(
        root: &Path,
        lock: &Mutex<()>,
        stage: Stage,
        technique_id: u64,
        technique_name: &str,
        current: &[u8],
    ) -> io::Result<()> {
        let short = short_name(technique_name);
        let dir = root.join(short);
        let path = dir.join(file_name(short, technique_id, stage));
        fs::create_dir_all(&dir)?;

        let hash = fnv1a32(current);
        tracing::info!("Dumping shader with hash {hash} to {}", path.display());

        let _guard = lock.lock();
        fs::write(&path, current)?;
        let mut csv = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(TECHNIQUE_MAP))?;
        writeln!(
            csv,
            "{short},{stage},{hash},{technique_id:X},\"{technique_name}\""
        )
    }
}

impl ReplacementPolicy for FilePolicy {
    fn replacement(
        &self,
        stage: Stage,
        technique_id: u64,
        technique_name: &str,
        current: &[u8],
    ) -> Option<Vec<u8>> {
        match &self.mode {
            Mode::Replace { root } => {
                let short = short_name(technique_name);
                let path = root.join(short).join(file_name(short, technique_id, stage));
                Self::read_replacement(root, &path, current)
            }
            Mode::Dump { root, lock } => {
                if current.is_empty() {
                    return None;
                }
                if let Err(e) =
                    Self::dump_shader(root, lock, stage, technique_id, technique_name, current)
                {
                    tracing::warn!("failed to dump {technique_name} ({stage}): {e}");
                }
                None
            }
        }
    }

    fn watch_root(&self) -> Option<&Path> {
        match &self.mode {
            Mode::Replace { root } => Some(root),
            Mode::Dump { .. } => None,
        }
    }
}

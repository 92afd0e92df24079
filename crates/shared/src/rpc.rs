use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("malformed create payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("repeat must be at least 1")]
    ZeroRepeat,
}

/// Wire form of a CREATE payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateRequest {
    pub file: String,
    pub args: CreateArgs,
    pub index: u32,
    pub name: String,
    pub uuid: String,
    pub parent: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateArgs {
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub argv: Vec<String>,
    pub repeat: u32,
    #[serde(default)]
    pub instrument: Option<Instrumentation>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Instrumentation {
    pub scheme: String,
    #[serde(default, rename = "instargs")]
    pub args: Vec<String>,
}

/// One decoded guest run.
#[derive(Debug, Clone)]
pub struct ModuleSpec {
    /// Binary path; also argv[0].
    pub path: String,
    /// Pre-opened directories.
    pub dirs: Vec<String>,
    /// Environment entries, `KEY=VALUE`.
    pub env: Vec<String>,
    pub argv: Vec<String>,
    pub repeat: u32,
    pub instrumentation: Option<Instrumentation>,
}

impl ModuleSpec {
    pub fn scheme(&self) -> Option<&str> {
        self.instrumentation.as_ref().map(|i| i.scheme.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ModuleMetadata {
    pub index: u32,
    pub name: String,
    pub uuid: String,
    pub parent: String,
}

/// Engine instantiation settings.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Guest stack size in bytes.
    pub stack_size: u32,
    /// Guest heap size in bytes.
    pub heap_size: u32,
    /// Engine log verbosity.
    pub verbosity: u32,
    pub max_threads: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            stack_size: 1024 * 1024,
            heap_size: 1024 * 1024,
            verbosity: 0,
            max_threads: 20,
        }
    }
}

/// Decode a CREATE payload into the spec and metadata, prepending the
/// binary path as argv[0].
pub fn decode_create(payload: &[u8]) -> Result<(ModuleSpec, ModuleMetadata), SpecError> {
    let request: CreateRequest = serde_json::from_slice(payload)?;
    if request.args.repeat == 0 {
        return Err(SpecError::ZeroRepeat);
    }

    let mut argv = Vec::with_capacity(request.args.argv.len() + 1);
    argv.push(request.file.clone());
    argv.extend(request.args.argv);

    let spec = ModuleSpec {
        path: request.file,
        dirs: request.args.dirs,
        env: request.args.env,
        argv,
        repeat: request.args.repeat,
        instrumentation: request.args.instrument,
    };
    let metadata = ModuleMetadata {
        index: request.index,
        name: request.name,
        uuid: request.uuid,
        parent: request.parent,
    };
    Ok((spec, metadata))
}

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::PathBuf,
    process::Stdio,
    str::FromStr,
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{io::AsyncWriteExt, process::Command, sync::Mutex};
use tracing::debug;

use crate::{error::ScriptError, providers::ScriptHost};

const SCRIPT_PREFIX: &str = "scripts:";

/// `scripts:tests.env.Before` → module `tests.env`, function `Before`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptRef {
    pub module: String,
    pub function: String,
}

impl ScriptRef {
    pub fn parse(reference: &str) -> Result<Self, ScriptError> {
        let trimmed = reference.trim();
        let body = trimmed.strip_prefix(SCRIPT_PREFIX).unwrap_or(trimmed);
        match body.rsplit_once('.') {
            Some((module, function)) if !module.is_empty() && !function.is_empty() => Ok(Self {
                module: module.to_string(),
                function: function.to_string(),
            }),
            _ => Err(ScriptError::InvalidReference(reference.to_string())),
        }
    }
}

impl FromStr for ScriptRef {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.function)
    }
}

/// Per-run view over a [`ScriptHost`]: every module is loaded at most once.
pub struct ScriptRegistry {
    host: Arc<dyn ScriptHost>,
    loaded: Mutex<HashSet<String>>,
}

impl ScriptRegistry {
    pub fn new(host: Arc<dyn ScriptHost>) -> Self {
        Self {
            host,
            loaded: Mutex::new(HashSet::new()),
        }
    }

    pub async fn call(&self, target: &ScriptRef, args: Vec<Value>) -> Result<Value, ScriptError> {
        {
            let mut loaded = self.loaded.lock().await;
            if !loaded.contains(&target.module) {
                debug!(module = %target.module, "loading script module");
                self.host.load(&target.module).await?;
                loaded.insert(target.module.clone());
            }
        }
        self.host.call(target, args).await
    }

    /// Runs a `before`/`after`/`before_all`/`after_all` hook reference.
    pub async fn run_hook(&self, reference: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
        let target = ScriptRef::parse(reference)?;
        self.call(&target, args).await
    }

    pub async fn loaded_modules(&self) -> usize {
        self.loaded.lock().await.len()
    }
}

/// Runs scripts as child processes: `program [args..] <file> <function>`, arguments as a
/// JSON array on stdin, the return value as JSON on stdout.
///
/// Module `tests.env` resolves to `<root>/tests/env.<ext>` for the first extension found.
pub struct ProcessScriptHost {
    program: String,
    args: Vec<String>,
    root: PathBuf,
    extensions: Vec<String>,
    resolved: Mutex<HashMap<String, PathBuf>>,
}

impl ProcessScriptHost {
    pub fn new(program: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            root: root.into(),
            extensions: ["ts", "js", "py", "sh"].iter().map(|s| s.to_string()).collect(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    fn candidates(&self, module: &str) -> Vec<PathBuf> {
        let base = self.root.join(module.replace('.', "/"));
        self.extensions
            .iter()
            .map(|ext| base.with_extension(ext))
            .collect()
    }
}

#[async_trait]
impl ScriptHost for ProcessScriptHost {
    async fn load(&self, module: &str) -> Result<(), ScriptError> {
        for candidate in self.candidates(module) {
            if tokio::fs::metadata(&candidate).await.is_ok() {
                self.resolved.lock().await.insert(module.to_string(), candidate);
                return Ok(());
            }
        }
        Err(ScriptError::Load {
            module: module.to_string(),
            message: format!("no script file under {}", self.root.display()),
        })
    }

    async fn call(&self, target: &ScriptRef, args: Vec<Value>) -> Result<Value, ScriptError> {
        let path = self
            .resolved
            .lock()
            .await
            .get(&target.module)
            .cloned()
            .ok_or_else(|| ScriptError::Load {
                module: target.module.clone(),
                message: "module not loaded".to_string(),
            })?;
        let execution = |message: String| ScriptError::Execution {
            target: target.to_string(),
            message,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&path)
            .arg(&target.function)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| execution(e.to_string()))?;

        let payload = serde_json::to_vec(&args).map_err(|e| execution(e.to_string()))?;
        let stdin = child.stdin.take();
        // stdin is fed while stdout drains, so a script echoing as it reads cannot stall
        let feed = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&payload).await,
                None => Ok(()),
            }
        };
        let (written, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| execution(e.to_string()))?;
        if let Err(err) = written {
            // a script may exit without reading its arguments
            if err.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(execution(err.to_string()));
            }
            debug!(script = %target, "script closed stdin before reading its arguments");
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(execution(format!("exited with {}: {}", output.status, stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout).map_err(|e| ScriptError::InvalidOutput {
            target: target.to_string(),
            message: e.to_string(),
        })
    }
}

//! Rhai module execution and caching.
//!
//! A module is a Rhai script. With an export name the named function is
//! called with the invocation arguments; without one the script is evaluated
//! with the arguments bound to `args`.

use bytes::Bytes;
use peerhost::{InvocationMetadata, ModuleSourceKind};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Position, Scope, AST};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Result of a module invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleOutput {
    Text(String),
    Binary(Vec<u8>),
    Json(Value),
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("no module is cached under `{0}`")]
    NotCached(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{message}")]
    Script { message: String, stack: String },
}

/// Compiles, caches and runs modules.
pub struct ModuleHost {
    engine: Engine,
    cache: RwLock<HashMap<String, Arc<AST>>>,
    root: PathBuf,
}

impl ModuleHost {
    /// Create a host resolving file modules against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut engine = Engine::new();
        engine.on_print(|text| info!(target: "script", "{}", text));
        engine.on_debug(|text, source, pos| {
            debug!(target: "script", "{} ({:?} @ {})", text, source, pos)
        });

        Self {
            engine,
            cache: RwLock::new(HashMap::new()),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cached_modules(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run one invocation. Blocks for as long as the script runs.
    pub fn invoke(
        &self,
        metadata: InvocationMetadata,
        stream: Option<Bytes>,
    ) -> Result<ModuleOutput, InvokeError> {
        let ast = self.resolve(&metadata, stream)?;

        let args = metadata
            .args
            .iter()
            .map(rhai::serde::to_dynamic)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| script_error(&e))?;

        let result = match metadata.export_name.as_deref() {
            Some(name) => self
                .engine
                .call_fn::<Dynamic>(&mut Scope::new(), &ast, name, args),
            None => {
                let mut scope = Scope::new();
                scope.push("args", args.into_iter().collect::<Array>());
                self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            }
        }
        .map_err(|e| script_error(&e))?;

        into_output(result)
    }

    fn resolve(
        &self,
        metadata: &InvocationMetadata,
        stream: Option<Bytes>,
    ) -> Result<Arc<AST>, InvokeError> {
        let cache_identifier = metadata.cache_identifier.as_deref();
        match metadata.module_source_type {
            ModuleSourceKind::Cache => {
                let key = module_source(metadata)?;
                self.cache
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(key)
                    .cloned()
                    .ok_or_else(|| InvokeError::NotCached(key.to_string()))
            }
            ModuleSourceKind::File => {
                let relative = module_source(metadata)?;
                let path = self.root.join(relative);
                let source = std::fs::read_to_string(&path).map_err(|e| InvokeError::Script {
                    message: format!("Failed to read module {}: {}", path.display(), e),
                    stack: String::new(),
                })?;
                self.compile(&source, cache_identifier)
            }
            ModuleSourceKind::String => self.compile(module_source(metadata)?, cache_identifier),
            ModuleSourceKind::Stream => {
                let bytes = stream.ok_or_else(|| {
                    InvokeError::BadRequest("stream invocation without stream data".to_string())
                })?;
                let source = std::str::from_utf8(&bytes).map_err(|e| {
                    InvokeError::BadRequest(format!("stream module is not UTF-8: {}", e))
                })?;
                self.compile(source, cache_identifier)
            }
        }
    }

    fn compile(&self, source: &str, cache_identifier: Option<&str>) -> Result<Arc<AST>, InvokeError> {
        let ast = self
            .engine
            .compile(source)
            .map_err(|e| InvokeError::Script {
                message: format!("Compilation error: {}", e),
                stack: stack_line(e.position()),
            })?;
        let ast = Arc::new(ast);

        if let Some(identifier) = cache_identifier {
            debug!("Caching module as `{}`", identifier);
            self.cache
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(identifier.to_string(), Arc::clone(&ast));
        }
        Ok(ast)
    }
}

fn module_source(metadata: &InvocationMetadata) -> Result<&str, InvokeError> {
    metadata
        .module_source
        .as_deref()
        .ok_or_else(|| InvokeError::BadRequest("moduleSource is required".to_string()))
}

fn script_error(err: &EvalAltResult) -> InvokeError {
    InvokeError::Script {
        message: err.to_string(),
        stack: stack_line(err.position()),
    }
}

fn stack_line(position: Position) -> String {
    if position.is_none() {
        String::new()
    } else {
        format!("at {}", position)
    }
}

fn into_output(result: Dynamic) -> Result<ModuleOutput, InvokeError> {
    let type_error = |found: &str| InvokeError::Script {
        message: format!("Unexpected result type {}", found),
        stack: String::new(),
    };

    if result.is_string() {
        return result.into_string().map(ModuleOutput::Text).map_err(type_error);
    }
    if result.is_blob() {
        return result.into_blob().map(ModuleOutput::Binary).map_err(type_error);
    }
    if result.is_unit() {
        return Ok(ModuleOutput::Json(Value::Null));
    }

    rhai::serde::from_dynamic::<Value>(&result)
        .map(ModuleOutput::Json)
        .map_err(|e| script_error(&e))
}

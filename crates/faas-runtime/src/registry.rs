use crate::config::FunctionEntry;
use crate::error::{Result, RuntimeError};
use crate::handler::{Handler, HandlerCatalog};
use faas_common::FaasError;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// A function bound to its handler implementation.
#[derive(Clone)]
pub struct RegisteredFunction {
    pub name: String,
    pub handler_id: String,
    /// `code_root/codedir/module`, kept for diagnostics.
    pub module_path: PathBuf,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("handler_id", &self.handler_id)
            .field("module_path", &self.module_path)
            .finish()
    }
}

/// Function name -> handler mapping. Built once at startup and never mutated,
/// so concurrent lookups need no locking.
#[derive(Debug, Default)]
pub struct Registry {
    functions: BTreeMap<String, RegisteredFunction>,
}

impl Registry {
    /// Builds the registry from function entries. Any invalid entry fails the
    /// whole load.
    ///
    /// Entries are applied in order, so when a name is declared twice the
    /// later entry wins.
    pub fn load(
        entries: &[FunctionEntry],
        code_root: &Path,
        catalog: &HandlerCatalog,
    ) -> Result<Self> {
        let mut functions = BTreeMap::new();

        for (index, entry) in entries.iter().enumerate() {
            let function = resolve_entry(index, entry, code_root, catalog)?;
            info!(
                function = %function.name,
                handler = %function.handler_id,
                module = %function.module_path.display(),
                "Registered function"
            );
            if let Some(previous) = functions.insert(function.name.clone(), function) {
                warn!(
                    function = %previous.name,
                    replaced_handler = %previous.handler_id,
                    "Duplicate function name, later entry wins"
                );
            }
        }

        Ok(Self { functions })
    }

    /// Looks up a function by name. An empty name selects the default
    /// function: the lexicographically smallest registered name.
    pub fn resolve(&self, name: &str) -> std::result::Result<&RegisteredFunction, FaasError> {
        if name.is_empty() {
            return self
                .default_function()
                .ok_or_else(|| FaasError::NotFound("no functions exist".to_string()));
        }
        self.functions
            .get(name)
            .ok_or_else(|| FaasError::NotFound(name.to_string()))
    }

    pub fn default_function(&self) -> Option<&RegisteredFunction> {
        self.functions.values().next()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn resolve_entry(
    index: usize,
    entry: &FunctionEntry,
    code_root: &Path,
    catalog: &HandlerCatalog,
) -> Result<RegisteredFunction> {
    let label = if entry.name.is_empty() {
        format!("functions[{index}]")
    } else {
        format!("functions[{index}] ({})", entry.name)
    };
    let invalid = |reason: String| RuntimeError::config(format!("{label}: {reason}"));

    if entry.name.trim().is_empty() {
        return Err(invalid("missing function name".to_string()));
    }
    if entry.handler.trim().is_empty() {
        return Err(invalid("missing handler".to_string()));
    }

    let (module, export) = split_handler(&entry.handler).ok_or_else(|| {
        invalid(format!(
            "handler {:?} must be <module>.<export>",
            entry.handler
        ))
    })?;

    let codedir = Path::new(&entry.codedir);
    let escapes = codedir
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(invalid(format!(
            "codedir {:?} must be a relative path inside the code directory",
            entry.codedir
        )));
    }
    let code_dir = code_root.join(codedir);
    if !entry.codedir.is_empty() && !code_dir.is_dir() {
        return Err(invalid(format!(
            "codedir {} does not exist",
            code_dir.display()
        )));
    }

    let handler_id = format!("{module}.{export}");
    let handler = catalog.get(&handler_id).ok_or_else(|| {
        invalid(format!("handler {handler_id:?} is not registered"))
    })?;

    Ok(RegisteredFunction {
        name: entry.name.clone(),
        handler_id,
        module_path: code_dir.join(module),
        handler,
    })
}

/// `"index.handler"` -> `("index", "handler")`. Exactly one dot, both halves non-empty.
fn split_handler(handler: &str) -> Option<(&str, &str)> {
    let (module, export) = handler.split_once('.')?;
    if module.is_empty() || export.is_empty() || export.contains('.') {
        return None;
    }
    Some((module, export))
}

//! Kernel discovery, compilation and caching.
//!
//! Kernel sources are plain `.cl` files under a root directory. Each holds
//! one `__kernel void <name>(...)` declaration whose name should match the
//! file stem (a mismatch is only a warning).
//!
//! # Architecture
//!
//! ```text
//! KernelCompiler<D>
//!     ├── list_kernel_files() ──> glob + verify + extract name
//!     ├── compile()           ──> D::build_kernel + parameter schema
//!     │       └── schema: driver introspection, text fallback per parameter
//!     └── load()              ──> exact stem resolution + path-keyed cache
//!                                 └── Arc<CompiledKernel<D>>
//! ```
//!
//! Compiled kernels are values handed to the executor; there is no shared
//! "active kernel" state. Each kernel serializes bind+dispatch behind its
//! own mutex.
//!
//! All operations log and return `None` / empty on failure.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::driver::DeviceDriver;
use crate::schema::{KernelDeclaration, ParamType, Parameter, ParameterSchema, KERNEL_MARKER};
use crate::ComputeError;

/// Recognized kernel source extension.
pub const KERNEL_EXTENSION: &str = "cl";

// =============================================================================
// Compiled kernel
// =============================================================================

/// A built kernel with its calling convention.
pub struct CompiledKernel<D: DeviceDriver> {
    name: String,
    path: PathBuf,
    schema: ParameterSchema,
    inner: Mutex<D::Kernel>,
}

impl<D: DeviceDriver> CompiledKernel<D> {
    /// Declared kernel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ordered parameter schema.
    pub fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    /// Number of pointer parameters (decides output allocation).
    pub fn pointer_count(&self) -> usize {
        self.schema.pointer_count()
    }

    /// Exclusive access to the native kernel's argument slots.
    pub(crate) fn lock(&self) -> MutexGuard<'_, D::Kernel> {
        self.inner.lock().unwrap()
    }
}

impl<D: DeviceDriver> std::fmt::Debug for CompiledKernel<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("schema", &self.schema)
            .finish()
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// Source-driven kernel compiler for one device.
pub struct KernelCompiler<D: DeviceDriver> {
    driver: Arc<D>,
    root: PathBuf,
    build_options: String,
    cache: Mutex<HashMap<PathBuf, Arc<CompiledKernel<D>>>>,
}

impl<D: DeviceDriver> KernelCompiler<D> {
    pub fn new(driver: Arc<D>, config: &RuntimeConfig) -> Self {
        Self {
            driver,
            root: config.kernel_root.clone(),
            build_options: config.build_options.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Kernel root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // -------------------------------------------------------------------------
    // Discovery
    // -------------------------------------------------------------------------

    fn glob_sources(&self, subdir: &str) -> Vec<PathBuf> {
        let base = if subdir.is_empty() { self.root.clone() } else { self.root.join(subdir) };
        let pattern = format!(
            "{}/**/*.{}",
            glob::Pattern::escape(&base.to_string_lossy()),
            KERNEL_EXTENSION
        );

        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "invalid kernel search pattern");
                return Vec::new();
            }
        };

        let mut files: Vec<PathBuf> = paths
            .filter_map(|entry| match entry {
                Ok(path) if path.is_file() => Some(path),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "unreadable kernel path");
                    None
                }
            })
            .collect();
        files.sort();
        files
    }

    /// Valid kernel files under `root/subdir`, mapped to their kernel names.
    ///
    /// Invalid files are logged and skipped.
    pub fn list_kernel_files(&self, subdir: &str) -> BTreeMap<PathBuf, String> {
        self.glob_sources(subdir)
            .into_iter()
            .filter_map(|path| {
                let name = self.extract_kernel_name(&path)?;
                Some((path, name))
            })
            .collect()
    }

    /// Source text of a kernel file, or None when missing, empty or
    /// lacking a kernel declaration.
    pub fn verify_kernel_file(&self, path: &Path) -> Option<String> {
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "kernel file unreadable");
                return None;
            }
        };
        if source.trim().is_empty() {
            warn!(path = %path.display(), "kernel file is empty");
            return None;
        }
        if !source.contains(KERNEL_MARKER) {
            warn!(path = %path.display(), "kernel file has no kernel declaration");
            return None;
        }
        Some(source)
    }

    /// Declared name of the first kernel in `path`.
    pub fn extract_kernel_name(&self, path: &Path) -> Option<String> {
        let source = self.verify_kernel_file(path)?;
        kernel_name_in(&source, path)
    }

    // -------------------------------------------------------------------------
    // Compilation
    // -------------------------------------------------------------------------

    /// Build the kernel in `path`. Build diagnostics are logged.
    pub fn compile(&self, path: &Path) -> Option<CompiledKernel<D>> {
        let source = self.verify_kernel_file(path)?;
        let name = kernel_name_in(&source, path)?;

        let kernel = match self.driver.build_kernel(&source, &name, &self.build_options) {
            Ok(kernel) => kernel,
            Err(ComputeError::KernelBuild { kernel, log }) => {
                error!(kernel = %kernel, path = %path.display(), "kernel build failed:\n{}", log);
                return None;
            }
            Err(e) => {
                error!(kernel = %name, path = %path.display(), error = %e, "kernel build failed");
                return None;
            }
        };

        let schema = self.introspect(&kernel, &source);
        info!(kernel = %name, params = %schema.describe(), "kernel compiled");

        Some(CompiledKernel {
            name,
            path: path.to_path_buf(),
            schema,
            inner: Mutex::new(kernel),
        })
    }

    /// Schema of a built kernel, asking the driver first.
    ///
    /// Parameters the driver refuses to describe come from the source text
    /// of `path`.
    pub fn parameter_schema(&self, kernel: &D::Kernel, path: &Path) -> ParameterSchema {
        match self.verify_kernel_file(path) {
            Some(source) => self.introspect(kernel, &source),
            None => self.introspect(kernel, ""),
        }
    }

    /// Schema parsed from the source text of `path` alone.
    pub fn parameter_schema_fallback(&self, path: &Path) -> ParameterSchema {
        self.verify_kernel_file(path)
            .map(|source| ParameterSchema::from_source(&source))
            .unwrap_or_default()
    }

    fn introspect(&self, kernel: &D::Kernel, source: &str) -> ParameterSchema {
        let count = match self.driver.kernel_arg_count(kernel) {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "argument count unavailable, parsing source");
                return ParameterSchema::from_source(source);
            }
        };

        let mut fallback: Option<ParameterSchema> = None;
        let mut schema = ParameterSchema::new();
        for index in 0..count {
            match self.driver.kernel_arg_info(kernel, index) {
                Ok(info) => {
                    schema.push(Parameter::new(info.name, ParamType::from_spelling(&info.type_name)));
                }
                Err(e) => {
                    debug!(index, error = %e, "argument info refused, using source text");
                    let parsed = fallback.get_or_insert_with(|| ParameterSchema::from_source(source));
                    match parsed.get(index as usize) {
                        Some(param) => schema.push(param.clone()),
                        None => {
                            warn!(index, "parameter missing from source text");
                            schema.push(Parameter::new(
                                format!("arg{}", index),
                                ParamType::Opaque { spelling: String::new(), pointer: false },
                            ));
                        }
                    }
                }
            }
        }
        schema
    }

    // -------------------------------------------------------------------------
    // Loading and cache
    // -------------------------------------------------------------------------

    /// Kernel file whose stem is exactly `name`.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let matches: Vec<PathBuf> = self
            .glob_sources("")
            .into_iter()
            .filter(|p| p.file_stem().is_some_and(|s| s == name))
            .collect();

        match matches.as_slice() {
            [] => {
                warn!(kernel = name, root = %self.root.display(), "kernel file not found");
                None
            }
            [path] => Some(path.clone()),
            [first, ..] => {
                warn!(kernel = name, count = matches.len(), "several kernel files match, using the first");
                Some(first.clone())
            }
        }
    }

    /// Load a kernel by name (exact file stem).
    pub fn load(&self, name: &str) -> Option<Arc<CompiledKernel<D>>> {
        let path = self.resolve(name)?;
        self.load_path(&path)
    }

    /// Load a kernel by source path, compiling on a cache miss.
    pub fn load_path(&self, path: &Path) -> Option<Arc<CompiledKernel<D>>> {
        if let Some(kernel) = self.cache.lock().unwrap().get(path) {
            debug!(kernel = kernel.name(), "kernel cache hit");
            return Some(Arc::clone(kernel));
        }

        let compiled = Arc::new(self.compile(path)?);
        let mut cache = self.cache.lock().unwrap();
        let entry = cache.entry(path.to_path_buf()).or_insert(compiled);
        Some(Arc::clone(entry))
    }

    /// Evict one cache entry. Native resources go when the last user drops it.
    pub fn unload(&self, path: &Path) -> bool {
        let removed = self.cache.lock().unwrap().remove(path);
        if let Some(kernel) = &removed {
            debug!(kernel = kernel.name(), "kernel unloaded");
        }
        removed.is_some()
    }

    /// Evict every cache entry.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Paths currently cached.
    pub fn cached_kernels(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.cache.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Compile every kernel under `subdir` into the cache.
    pub fn precompile_all(&self, subdir: &str) -> usize {
        let files = self.list_kernel_files(subdir);
        let compiled = files
            .keys()
            .filter(|path| self.load_path(path).is_some())
            .count();
        info!(compiled, found = files.len(), "kernels precompiled");
        compiled
    }

    /// Most recently modified kernel file whose path contains `search`
    /// (case-insensitive).
    pub fn latest_kernel_file(&self, search: &str) -> Option<PathBuf> {
        let needle = search.to_lowercase();
        self.glob_sources("")
            .into_iter()
            .filter(|p| p.to_string_lossy().to_lowercase().contains(&needle))
            .map(|p| {
                let modified = fs::metadata(&p).and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, p)
            })
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
            .map(|(_, p)| p)
    }
}

/// Declared name of the first kernel in `source`, with convention warnings.
fn kernel_name_in(source: &str, path: &Path) -> Option<String> {
    let Some(decl) = KernelDeclaration::find(source) else {
        warn!(path = %path.display(), "no kernel declaration found");
        return None;
    };

    if decl.name_has_whitespace() {
        warn!(kernel = decl.name, path = %path.display(), "kernel name contains whitespace");
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    if stem != decl.name {
        warn!(kernel = decl.name, file = %stem, "kernel name does not match file name");
    }
    Some(decl.name.to_string())
}

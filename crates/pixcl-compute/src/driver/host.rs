//! Host reference device.
//!
//! Device memory is plain host memory, kernels are native Rust functions
//! registered by kernel name and run with rayon. "Compiling" a source
//! validates its declaration and binds the native implementation, so the
//! whole runtime above this layer behaves exactly as on a real device.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace};

use super::host_kernels;
use super::{ArgInfo, Backend, DeviceDescriptor, DeviceDriver, DispatchGeometry, KernelArg};
use crate::config::{system_memory, RuntimeConfig};
use crate::schema::{KernelDeclaration, Scalar, ScalarKind, KERNEL_MARKER, QUALIFIERS};
use crate::{ComputeError, ComputeResult};

/// Native kernel body.
pub type HostKernelFn = Arc<dyn Fn(&HostLaunch<'_>) -> ComputeResult<()> + Send + Sync>;

// =============================================================================
// Buffers
// =============================================================================

/// Host-memory device buffer.
pub struct HostBuffer {
    data: RwLock<Vec<u8>>,
    live: Arc<AtomicU64>,
}

impl HostBuffer {
    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared view of the contents.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap()
    }

    /// Exclusive view of the contents.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write().unwrap()
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let len = self.data.get_mut().map(|d| d.len()).unwrap_or(0) as u64;
        self.live.fetch_sub(len, Ordering::SeqCst);
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

// =============================================================================
// Kernels
// =============================================================================

/// Compiled host kernel with its argument slots.
pub struct HostKernel {
    name: String,
    params: Vec<ArgInfo>,
    slots: Vec<Option<KernelArg<HostBuffer>>>,
    func: HostKernelFn,
}

impl HostKernel {
    /// Kernel name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Bound arguments and geometry of one host launch.
pub struct HostLaunch<'a> {
    kernel: &'a str,
    args: &'a [KernelArg<HostBuffer>],
    geometry: DispatchGeometry,
}

impl<'a> HostLaunch<'a> {
    /// Buffer bound at `index`.
    pub fn buffer(&self, index: usize) -> ComputeResult<&'a Arc<HostBuffer>> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(b)) => Ok(b),
            _ => Err(self.bad_arg(index, "buffer")),
        }
    }

    /// Scalar bound at `index`, converted to `int`.
    pub fn int(&self, index: usize) -> ComputeResult<i32> {
        match self.scalar(index, ScalarKind::Int) {
            Some(Scalar::Int(v)) => Ok(v),
            _ => Err(self.bad_arg(index, "int")),
        }
    }

    /// Scalar bound at `index`, converted to `float`.
    pub fn float(&self, index: usize) -> ComputeResult<f32> {
        match self.scalar(index, ScalarKind::Float) {
            Some(Scalar::Float(v)) => Ok(v),
            _ => Err(self.bad_arg(index, "float")),
        }
    }

    /// Launch geometry.
    pub fn geometry(&self) -> DispatchGeometry {
        self.geometry
    }

    fn scalar(&self, index: usize, kind: ScalarKind) -> Option<Scalar> {
        match self.args.get(index) {
            Some(KernelArg::Scalar(s)) => s.convert(kind),
            _ => None,
        }
    }

    fn bad_arg(&self, index: usize, expected: &str) -> ComputeError {
        ComputeError::Dispatch(format!(
            "{}: argument {} is not a {}",
            self.kernel, index, expected
        ))
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Builder for [`HostDriver`].
pub struct HostDriverBuilder {
    capacity: Option<u64>,
    arg_info: bool,
    builtins: bool,
    kernels: HashMap<String, HostKernelFn>,
}

impl Default for HostDriverBuilder {
    fn default() -> Self {
        Self {
            capacity: None,
            arg_info: true,
            builtins: true,
            kernels: HashMap::new(),
        }
    }
}

impl HostDriverBuilder {
    /// Device capacity in bytes (allocations beyond it fail).
    pub fn capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Whether the device answers per-parameter argument queries.
    pub fn arg_info(mut self, enabled: bool) -> Self {
        self.arg_info = enabled;
        self
    }

    /// Skip the built-in kernels.
    pub fn without_builtins(mut self) -> Self {
        self.builtins = false;
        self
    }

    /// Register a native implementation for kernel `name`.
    pub fn kernel<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&HostLaunch<'_>) -> ComputeResult<()> + Send + Sync + 'static,
    {
        self.kernels.insert(name.into(), Arc::new(func));
        self
    }

    pub fn build(self) -> HostDriver {
        let mut kernels = HashMap::new();
        if self.builtins {
            host_kernels::register_builtins(&mut kernels);
        }
        kernels.extend(self.kernels);

        let capacity = self.capacity.unwrap_or_else(system_memory);
        HostDriver {
            descriptor: host_descriptor(capacity),
            capacity,
            live: Arc::new(AtomicU64::new(0)),
            arg_info: self.arg_info,
            kernels,
        }
    }
}

/// Host reference device.
pub struct HostDriver {
    descriptor: DeviceDescriptor,
    capacity: u64,
    live: Arc<AtomicU64>,
    arg_info: bool,
    kernels: HashMap<String, HostKernelFn>,
}

impl HostDriver {
    /// Device with default settings (capacity = system RAM).
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HostDriverBuilder {
        HostDriverBuilder::default()
    }

    /// Bytes held by live buffers.
    pub fn live_bytes(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    /// Names of registered native kernels.
    pub fn kernel_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.kernels.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn host_descriptor(capacity: u64) -> DeviceDescriptor {
    DeviceDescriptor {
        index: 0,
        name: "Host (rayon)".to_string(),
        vendor: "pixcl".to_string(),
        platform: format!("Host ({} threads)", rayon::current_num_threads()),
        global_memory: capacity,
        max_work_group_size: 256,
        backend: Backend::Host,
    }
}

impl DeviceDriver for HostDriver {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    const BACKEND: Backend = Backend::Host;

    fn enumerate() -> Vec<DeviceDescriptor> {
        vec![host_descriptor(system_memory())]
    }

    fn open(index: usize, config: &RuntimeConfig) -> ComputeResult<Self> {
        if index != 0 {
            return Err(ComputeError::DeviceIndex { index, count: 1 });
        }
        Ok(Self::builder().capacity(config.effective_host_memory()).build())
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn create_buffer(&self, bytes: &[u8]) -> ComputeResult<HostBuffer> {
        if bytes.is_empty() {
            return Err(ComputeError::BufferCreation("zero-sized buffer".into()));
        }

        let len = bytes.len() as u64;
        let capacity = self.capacity;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(len).filter(|&n| n <= capacity)
            })
            .map_err(|used| {
                ComputeError::BufferCreation(format!(
                    "{} bytes requested, {} of {} in use",
                    len, used, capacity
                ))
            })?;

        trace!(bytes = len, "host buffer created");
        Ok(HostBuffer {
            data: RwLock::new(bytes.to_vec()),
            live: Arc::clone(&self.live),
        })
    }

    fn read_buffer(&self, buffer: &HostBuffer, out: &mut [u8]) -> ComputeResult<()> {
        let data = buffer.read();
        if out.len() > data.len() {
            return Err(ComputeError::BufferRead(format!(
                "read of {} bytes from a {}-byte buffer",
                out.len(),
                data.len()
            )));
        }
        out.copy_from_slice(&data[..out.len()]);
        Ok(())
    }

    fn build_kernel(&self, source: &str, name: &str, options: &str) -> ComputeResult<HostKernel> {
        let fail = |log: String| ComputeError::KernelBuild { kernel: name.to_string(), log };

        if !source.contains(KERNEL_MARKER) {
            return Err(fail(format!("error: no '{}' declaration in source", KERNEL_MARKER)));
        }
        check_balanced(source).map_err(fail)?;

        let decl = KernelDeclaration::find_all(source)
            .find(|d| d.name == name)
            .ok_or_else(|| fail(format!("error: kernel '{}' is not declared", name)))?;
        let params = decl
            .params
            .ok_or_else(|| fail("error: unterminated parameter list".into()))?;
        let params = parse_arg_infos(params).map_err(fail)?;

        let func = self
            .kernels
            .get(name)
            .cloned()
            .ok_or_else(|| fail(format!("error: no native implementation for '{}'", name)))?;

        debug!(kernel = name, options, params = params.len(), "host kernel built");
        Ok(HostKernel {
            name: name.to_string(),
            slots: vec![None; params.len()],
            params,
            func,
        })
    }

    fn kernel_arg_count(&self, kernel: &HostKernel) -> ComputeResult<u32> {
        Ok(kernel.params.len() as u32)
    }

    fn kernel_arg_info(&self, kernel: &HostKernel, index: u32) -> ComputeResult<ArgInfo> {
        if !self.arg_info {
            return Err(ComputeError::ArgumentInfo(format!(
                "{}: argument info not available on this device",
                kernel.name
            )));
        }
        kernel
            .params
            .get(index as usize)
            .cloned()
            .ok_or_else(|| ComputeError::ArgumentInfo(format!("{}: no argument {}", kernel.name, index)))
    }

    fn set_kernel_arg(&self, kernel: &mut HostKernel, index: u32, arg: &KernelArg<HostBuffer>) -> ComputeResult<()> {
        let bad = |message: String| ComputeError::KernelArgument { index, message };

        let param = kernel
            .params
            .get(index as usize)
            .ok_or_else(|| bad(format!("kernel takes {} arguments", kernel.params.len())))?;
        let is_pointer = param.type_name.ends_with('*');

        match arg {
            KernelArg::Buffer(_) if !is_pointer => {
                return Err(bad(format!("buffer bound to '{}' ({})", param.name, param.type_name)));
            }
            KernelArg::Scalar(s) if is_pointer => {
                return Err(bad(format!("scalar {} bound to '{}' ({})", s, param.name, param.type_name)));
            }
            _ => {}
        }

        kernel.slots[index as usize] = Some(arg.clone());
        Ok(())
    }

    fn dispatch(&self, kernel: &mut HostKernel, geometry: &DispatchGeometry) -> ComputeResult<()> {
        let args = kernel
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.clone().ok_or_else(|| {
                    ComputeError::Dispatch(format!("{}: argument {} is not set", kernel.name, i))
                })
            })
            .collect::<ComputeResult<Vec<_>>>()?;

        let launch = HostLaunch {
            kernel: &kernel.name,
            args: &args,
            geometry: *geometry,
        };
        (kernel.func)(&launch)
    }
}

// =============================================================================
// Declaration parsing
// =============================================================================

fn check_balanced(source: &str) -> Result<(), String> {
    let mut parens = 0i64;
    let mut braces = 0i64;
    for c in source.chars() {
        match c {
            '(' => parens += 1,
            ')' => parens -= 1,
            '{' => braces += 1,
            '}' => braces -= 1,
            _ => {}
        }
        if parens < 0 || braces < 0 {
            return Err(format!("error: unexpected '{}'", c));
        }
    }
    match (parens, braces) {
        (0, 0) => Ok(()),
        (0, _) => Err("error: expected '}'".into()),
        _ => Err("error: expected ')'".into()),
    }
}

/// Parameter spellings as a driver reports them (`uchar*`, `uint`).
fn parse_arg_infos(params: &str) -> Result<Vec<ArgInfo>, String> {
    let trimmed = params.trim();
    if trimmed.is_empty() || trimmed == "void" {
        return Ok(Vec::new());
    }

    trimmed
        .split(',')
        .map(|raw| {
            let spaced = raw.replace('*', " * ");
            let tokens: Vec<&str> = spaced
                .split_whitespace()
                .filter(|t| !QUALIFIERS.contains(t))
                .collect();
            let (name, ty) = tokens
                .split_last()
                .ok_or_else(|| format!("error: empty parameter in '{}'", params))?;
            let pointer = ty.contains(&"*");
            let base: Vec<&str> = ty.iter().copied().filter(|t| *t != "*").collect();
            if base.is_empty() || *name == "*" {
                return Err(format!("error: malformed parameter '{}'", raw.trim()));
            }

            let base = match base.join(" ").as_str() {
                "unsigned char" => "uchar".to_string(),
                "unsigned short" => "ushort".to_string(),
                "unsigned int" | "unsigned" => "uint".to_string(),
                "unsigned long" => "ulong".to_string(),
                other => other.to_string(),
            };
            Ok(ArgInfo {
                type_name: if pointer { format!("{}*", base) } else { base },
                name: name.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVERT: &str = "__kernel void invert00(__global uchar* pixels, int width, int height)\n\
                          {\n    int x = get_global_id(0);\n}\n";

    #[test]
    fn test_parse_arg_infos() {
        let infos = parse_arg_infos("__global const uchar *src, unsigned int n, float2 v").unwrap();
        assert_eq!(infos[0], ArgInfo { type_name: "uchar*".into(), name: "src".into() });
        assert_eq!(infos[1], ArgInfo { type_name: "uint".into(), name: "n".into() });
        assert_eq!(infos[2], ArgInfo { type_name: "float2".into(), name: "v".into() });
        assert!(parse_arg_infos("void").unwrap().is_empty());
        assert!(parse_arg_infos("int, float x").is_err());
    }

    #[test]
    fn test_parse_arg_infos_access_qualifiers() {
        let params = "__read_only __global uchar* src, write_only __global uchar* dst, int width";
        let infos = parse_arg_infos(params).unwrap();
        assert_eq!(infos[0], ArgInfo { type_name: "uchar*".into(), name: "src".into() });
        assert_eq!(infos[1], ArgInfo { type_name: "uchar*".into(), name: "dst".into() });

        let src = format!("__kernel void k({}) {{}}", params);
        let fallback = crate::schema::ParameterSchema::from_source(&src);
        for (info, param) in infos.iter().zip(fallback.iter()) {
            assert_eq!(crate::schema::ParamType::from_spelling(&info.type_name), param.ty);
            assert_eq!(info.name, param.name);
        }
    }

    #[test]
    fn test_check_balanced() {
        assert!(check_balanced(INVERT).is_ok());
        assert!(check_balanced("__kernel void k(int a) {").is_err());
        assert!(check_balanced("__kernel void k(int a)) {}").is_err());
    }

    #[test]
    fn test_build_and_introspect() {
        let driver = HostDriver::new();
        let kernel = driver.build_kernel(INVERT, "invert00", "").unwrap();
        assert_eq!(driver.kernel_arg_count(&kernel).unwrap(), 3);
        let info = driver.kernel_arg_info(&kernel, 0).unwrap();
        assert_eq!(info.type_name, "uchar*");
        assert_eq!(info.name, "pixels");
        assert!(driver.kernel_arg_info(&kernel, 3).is_err());
    }

    #[test]
    fn test_build_failure_carries_log() {
        let driver = HostDriver::new();
        let err = driver.build_kernel("__kernel void nope(int a) {}", "nope", "").unwrap_err();
        match err {
            ComputeError::KernelBuild { kernel, log } => {
                assert_eq!(kernel, "nope");
                assert!(log.contains("no native implementation"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_capacity_enforced() {
        let driver = HostDriver::builder().capacity(16).build();
        let a = driver.create_buffer(&[0u8; 12]).unwrap();
        assert!(driver.create_buffer(&[0u8; 8]).is_err());
        assert_eq!(driver.live_bytes(), 12);
        drop(a);
        assert_eq!(driver.live_bytes(), 0);
        assert!(driver.create_buffer(&[0u8; 16]).is_ok());
    }

    #[test]
    fn test_arg_info_refused() {
        let driver = HostDriver::builder().arg_info(false).build();
        let kernel = driver.build_kernel(INVERT, "invert00", "").unwrap();
        assert_eq!(driver.kernel_arg_count(&kernel).unwrap(), 3);
        assert!(matches!(
            driver.kernel_arg_info(&kernel, 0),
            Err(ComputeError::ArgumentInfo(_))
        ));
    }

    #[test]
    fn test_set_arg_checks_kind() {
        let driver = HostDriver::new();
        let mut kernel = driver.build_kernel(INVERT, "invert00", "").unwrap();
        let buf = Arc::new(driver.create_buffer(&[1, 2, 3, 4]).unwrap());

        assert!(driver.set_kernel_arg(&mut kernel, 0, &KernelArg::Scalar(Scalar::Int(1))).is_err());
        assert!(driver.set_kernel_arg(&mut kernel, 1, &KernelArg::Buffer(buf.clone())).is_err());
        assert!(driver.set_kernel_arg(&mut kernel, 5, &KernelArg::Scalar(Scalar::Int(1))).is_err());
        driver.set_kernel_arg(&mut kernel, 0, &KernelArg::Buffer(buf)).unwrap();

        // width/height unbound
        let err = driver.dispatch(&mut kernel, &DispatchGeometry::Linear(1)).unwrap_err();
        assert!(matches!(err, ComputeError::Dispatch(_)));
    }

    #[test]
    fn test_dispatch_invert_in_place() {
        let driver = HostDriver::new();
        let mut kernel = driver.build_kernel(INVERT, "invert00", "").unwrap();
        let buf = Arc::new(driver.create_buffer(&[10, 20, 30, 255, 0, 0, 0, 7]).unwrap());

        driver.set_kernel_arg(&mut kernel, 0, &KernelArg::Buffer(buf.clone())).unwrap();
        driver.set_kernel_arg(&mut kernel, 1, &KernelArg::Scalar(Scalar::Int(2))).unwrap();
        driver.set_kernel_arg(&mut kernel, 2, &KernelArg::Scalar(Scalar::Int(1))).unwrap();
        driver.dispatch(&mut kernel, &DispatchGeometry::Planar { width: 2, height: 1 }).unwrap();

        let mut out = [0u8; 8];
        driver.read_buffer(&buf, &mut out).unwrap();
        assert_eq!(out, [245, 235, 225, 255, 255, 255, 255, 7]);
    }

    #[test]
    fn test_open_rejects_bad_index() {
        let config = RuntimeConfig::default();
        assert!(HostDriver::open(0, &config).is_ok());
        assert!(matches!(
            HostDriver::open(3, &config),
            Err(ComputeError::DeviceIndex { index: 3, count: 1 })
        ));
    }
}

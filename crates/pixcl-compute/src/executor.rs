//! Generic kernel dispatch over image buffers.
//!
//! Turns "run kernel K on image buffer B" into a bound, dispatched and
//! synchronized device call without knowing K's signature in advance.
//!
//! # Pipeline
//!
//! ```text
//! execute_image_kernel(base, version, input, meta, args)
//!     │
//!     ├── load     ──> KernelCompiler::load(base + version)
//!     ├── geometry ──> 2D (width, height) or 1D (elements / 4)
//!     ├── allocate ──> output buffer when the kernel has 2+ pointers
//!     ├── plan     ──> merge positional args with image metadata
//!     ├── bind     ──> D::set_kernel_arg for every parameter
//!     └── dispatch ──> D::dispatch (blocking), free stale input
//! ```
//!
//! Every failure returns the input handle unchanged and releases anything
//! allocated on the way.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::compiler::{CompiledKernel, KernelCompiler};
use crate::driver::{DeviceDriver, DispatchGeometry, KernelArg};
use crate::image::ImageObject;
use crate::registry::{BufferHandle, BufferRegistry};
use crate::schema::{ParamType, ParameterSchema, Scalar, ScalarKind};

// =============================================================================
// Argument values
// =============================================================================

/// One caller-supplied or derived kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue {
    Scalar(Scalar),
    Buffer(BufferHandle),
}

impl From<Scalar> for ArgValue {
    fn from(v: Scalar) -> Self {
        Self::Scalar(v)
    }
}

impl From<BufferHandle> for ArgValue {
    fn from(h: BufferHandle) -> Self {
        Self::Buffer(h)
    }
}

macro_rules! arg_from_scalar {
    ($($t:ty),*) => {
        $(impl From<$t> for ArgValue {
            fn from(v: $t) -> Self {
                Self::Scalar(Scalar::from(v))
            }
        })*
    };
}

arg_from_scalar!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64, [f32; 2]);

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "{}", s),
            Self::Buffer(h) => write!(f, "{}", h),
        }
    }
}

impl std::str::FromStr for ArgValue {
    type Err = String;

    /// `42` (int), `1.5` (double) or `0.5,2` (2-component vector).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((x, y)) = s.split_once(',') {
            let x: f32 = x.trim().parse().map_err(|_| format!("invalid vector '{}'", s))?;
            let y: f32 = y.trim().parse().map_err(|_| format!("invalid vector '{}'", s))?;
            return Ok(Self::Scalar(Scalar::Float2([x, y])));
        }
        if let Ok(v) = s.parse::<i64>() {
            return Ok(match i32::try_from(v) {
                Ok(v) => Self::Scalar(Scalar::Int(v)),
                Err(_) => Self::Scalar(Scalar::Long(v)),
            });
        }
        s.parse::<f64>()
            .map(|v| Self::Scalar(Scalar::Double(v)))
            .map_err(|_| format!("invalid argument '{}'", s))
    }
}

/// Image geometry bound to kernel parameters by name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageMeta {
    pub width: i64,
    pub height: i64,
    pub channels: i64,
    /// Bits per channel.
    pub bit_depth: i64,
}

impl ImageMeta {
    /// RGBA8 image of the given size.
    pub fn rgba8(width: i64, height: i64) -> Self {
        Self { width, height, channels: 4, bit_depth: 8 }
    }

    /// Bits per pixel.
    pub fn bpp(&self) -> i64 {
        self.bit_depth * self.channels
    }

    /// Value for a metadata parameter name (case-insensitive).
    pub fn derived(&self, name: &str) -> Option<i64> {
        match name.to_ascii_lowercase().as_str() {
            "width" => Some(self.width),
            "height" => Some(self.height),
            "channels" => Some(self.channels),
            "bitdepth" => Some(self.bit_depth),
            "bpp" => Some(self.bpp()),
            _ => None,
        }
    }
}

/// Merge positional arguments with derived metadata, in schema order.
///
/// - pointers: first gets `input`, later ones `output`, unless the caller
///   supplied a buffer at that position;
/// - `int`/`uint` named width, height, channels, bitdepth or bpp: the derived
///   value when positive;
/// - everything else: the caller's value converted to the declared width.
///
/// When `args` has exactly one value per parameter it is aligned with the
/// schema; otherwise its values fill the non-derived parameters in order,
/// repeating the last value when it runs short.
pub fn plan_arguments(
    schema: &ParameterSchema,
    input: BufferHandle,
    output: Option<BufferHandle>,
    meta: &ImageMeta,
    args: &[ArgValue],
) -> Result<Vec<ArgValue>, String> {
    let aligned = !args.is_empty() && args.len() == schema.len();
    let mut cursor = 0usize;
    let mut pointers = 0usize;
    let mut next_positional = |index: usize| -> Option<ArgValue> {
        if aligned {
            return args.get(index).copied();
        }
        let value = args.get(cursor).or(args.last()).copied();
        cursor += 1;
        value
    };

    let mut planned = Vec::with_capacity(schema.len());
    for (index, param) in schema.iter().enumerate() {
        let value = if param.ty.is_pointer() {
            let default = if pointers == 0 { Some(input) } else { output };
            pointers += 1;
            let supplied = if aligned { args.get(index).copied() } else { None };
            let handle = match supplied {
                Some(ArgValue::Buffer(h)) => Some(h),
                _ => default,
            };
            ArgValue::Buffer(handle.ok_or_else(|| format!("no buffer for '{}'", param.name))?)
        } else {
            let ParamType::Scalar(kind) = &param.ty else {
                return Err(format!("unsupported type {} for '{}'", param.ty, param.name));
            };
            let derived = matches!(kind, ScalarKind::Int | ScalarKind::UInt)
                .then(|| meta.derived(&param.name))
                .flatten()
                .filter(|v| *v > 0);

            let scalar = match derived {
                Some(v) => Scalar::Long(v),
                None => match next_positional(index) {
                    Some(ArgValue::Scalar(s)) => s,
                    Some(ArgValue::Buffer(h)) => {
                        return Err(format!("buffer {} given for scalar '{}'", h, param.name));
                    }
                    None => return Err(format!("no value for '{}'", param.name)),
                },
            };
            let converted = scalar.convert(*kind).ok_or_else(|| {
                format!("{} cannot be passed as {} '{}'", scalar, kind.spelling(), param.name)
            })?;
            ArgValue::Scalar(converted)
        };
        planned.push(value);
    }
    Ok(planned)
}

// =============================================================================
// Executor
// =============================================================================

/// Frees a freshly allocated output buffer unless disarmed.
struct OutputGuard<'a, D: DeviceDriver> {
    registry: &'a BufferRegistry<D>,
    handle: Option<BufferHandle>,
}

impl<D: DeviceDriver> OutputGuard<'_, D> {
    fn disarm(mut self) -> Option<BufferHandle> {
        self.handle.take()
    }
}

impl<D: DeviceDriver> Drop for OutputGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(handle = %handle, "releasing unused output buffer");
            self.registry.free(handle, false);
        }
    }
}

#[derive(Debug, Default)]
struct StageTimings {
    load: Duration,
    allocate: Duration,
    bind: Duration,
    dispatch: Duration,
}

impl StageTimings {
    fn total(&self) -> Duration {
        self.load + self.allocate + self.bind + self.dispatch
    }
}

/// Runs image kernels against registry buffers.
pub struct KernelExecutor<D: DeviceDriver> {
    registry: Arc<BufferRegistry<D>>,
    compiler: Arc<KernelCompiler<D>>,
    log_success: bool,
}

impl<D: DeviceDriver> KernelExecutor<D> {
    pub fn new(registry: Arc<BufferRegistry<D>>, compiler: Arc<KernelCompiler<D>>) -> Self {
        Self {
            registry,
            compiler,
            log_success: true,
        }
    }

    /// Toggle stage timing logs after successful runs.
    pub fn with_log_success(mut self, enabled: bool) -> Self {
        self.log_success = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<BufferRegistry<D>> {
        &self.registry
    }

    pub fn compiler(&self) -> &Arc<KernelCompiler<D>> {
        &self.compiler
    }

    /// Run kernel `base + version` on `input`.
    ///
    /// Returns the output handle, or `input` unchanged when nothing ran.
    pub fn execute_image_kernel(
        &self,
        base: &str,
        version: &str,
        input: BufferHandle,
        meta: &ImageMeta,
        args: &[ArgValue],
    ) -> BufferHandle {
        self.try_execute_image_kernel(base, version, input, meta, args)
            .unwrap_or(input)
    }

    fn try_execute_image_kernel(
        &self,
        base: &str,
        version: &str,
        input: BufferHandle,
        meta: &ImageMeta,
        args: &[ArgValue],
    ) -> Option<BufferHandle> {
        let start = Instant::now();
        let name = format!("{}{}", base, version);
        let Some(kernel) = self.compiler.load(&name) else {
            warn!(kernel = %name, "kernel unavailable, input unchanged");
            return None;
        };
        self.run(&kernel, input, meta, args, start.elapsed())
    }

    /// Run an already loaded kernel on `input`.
    pub fn execute(
        &self,
        kernel: &CompiledKernel<D>,
        input: BufferHandle,
        meta: &ImageMeta,
        args: &[ArgValue],
    ) -> BufferHandle {
        self.run(kernel, input, meta, args, Duration::ZERO)
            .unwrap_or(input)
    }

    fn run(
        &self,
        kernel: &CompiledKernel<D>,
        input: BufferHandle,
        meta: &ImageMeta,
        args: &[ArgValue],
        load: Duration,
    ) -> Option<BufferHandle> {
        let mut timings = StageTimings { load, ..Default::default() };
        let name = kernel.name();

        let Some(record) = self.registry.get(input) else {
            warn!(kernel = name, handle = %input, "input buffer not found");
            return None;
        };
        let geometry = DispatchGeometry::for_image(meta.width, meta.height, record.first_len());

        let pointers = kernel.pointer_count();
        if pointers == 0 {
            warn!(kernel = name, "kernel takes no buffers, nothing to do");
            return None;
        }

        // Allocate
        let stage = Instant::now();
        let output = if pointers >= 2 {
            match self.registry.allocate(record.element_type(), record.first_len()) {
                Some(handle) => Some(handle),
                None => {
                    warn!(kernel = name, bytes = record.size_bytes(), "output allocation failed");
                    return None;
                }
            }
        } else {
            None
        };
        let guard = OutputGuard { registry: &self.registry, handle: output };
        drop(record);
        timings.allocate = stage.elapsed();

        let planned = match plan_arguments(kernel.schema(), input, output, meta, args) {
            Ok(planned) => planned,
            Err(e) => {
                warn!(kernel = name, error = %e, "argument merge failed");
                return None;
            }
        };

        // Bind
        let stage = Instant::now();
        let driver = self.registry.driver();
        let mut native = kernel.lock();
        for (index, value) in planned.iter().enumerate() {
            let arg = match value {
                ArgValue::Scalar(s) => KernelArg::Scalar(*s),
                ArgValue::Buffer(h) => match self.registry.get(*h) {
                    Some(record) => KernelArg::Buffer(Arc::clone(record.first())),
                    None => {
                        warn!(kernel = name, index, handle = %h, "bound buffer not found");
                        return None;
                    }
                },
            };
            if let Err(e) = driver.set_kernel_arg(&mut native, index as u32, &arg) {
                warn!(kernel = name, error = %e, "argument binding failed");
                return None;
            }
        }
        timings.bind = stage.elapsed();

        // Dispatch + wait
        let stage = Instant::now();
        if let Err(e) = driver.dispatch(&mut native, &geometry) {
            warn!(kernel = name, error = %e, "dispatch failed");
            return None;
        }
        drop(native);
        timings.dispatch = stage.elapsed();

        let result = match guard.disarm() {
            Some(output) => {
                self.registry.free(input, false);
                output
            }
            None => input,
        };

        if self.log_success {
            info!(
                kernel = name,
                geometry = ?geometry.global_work_size(),
                load_ms = timings.load.as_secs_f64() * 1000.0,
                allocate_ms = timings.allocate.as_secs_f64() * 1000.0,
                bind_ms = timings.bind.as_secs_f64() * 1000.0,
                dispatch_ms = timings.dispatch.as_secs_f64() * 1000.0,
                total_ms = timings.total().as_secs_f64() * 1000.0,
                "kernel executed"
            );
        }
        Some(result)
    }

    /// Run kernel `base + version` on an image.
    ///
    /// See [`execute_kernel_on_image`](Self::execute_kernel_on_image).
    pub fn execute_on_image(
        &self,
        image: &mut ImageObject,
        base: &str,
        version: &str,
        args: &[ArgValue],
    ) -> bool {
        let name = format!("{}{}", base, version);
        let Some(kernel) = self.compiler.load(&name) else {
            warn!(kernel = %name, image = %image.id(), "kernel unavailable, image unchanged");
            return false;
        };
        self.execute_kernel_on_image(image, &kernel, args)
    }

    /// Run a loaded kernel on an image, pushing it to the device first if needed.
    ///
    /// An image pushed by this call is pulled back afterwards. Returns
    /// whether the kernel ran.
    pub fn execute_kernel_on_image(
        &self,
        image: &mut ImageObject,
        kernel: &CompiledKernel<D>,
        args: &[ArgValue],
    ) -> bool {
        let moved = image.is_on_host();
        if moved && self.registry.push_image(image).is_none() {
            return false;
        }
        let Some(input) = image.device_handle() else {
            warn!(image = %image.id(), "image has no pixels");
            return false;
        };

        let output = self.run(kernel, input, &image.meta(), args, Duration::ZERO);
        if let Some(output) = output {
            image.set_device_handle(output);
        }

        if moved && !self.registry.pull_image(image) {
            warn!(image = %image.id(), "image stays on device after failed pull");
        }
        output.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Parameter;

    fn handle(raw: u64) -> BufferHandle {
        BufferHandle::from_raw(raw)
    }

    fn schema(params: &[(&str, &str)]) -> ParameterSchema {
        params
            .iter()
            .map(|(name, ty)| Parameter::new(*name, ParamType::from_spelling(ty)))
            .collect()
    }

    #[test]
    fn test_plan_mandelbrot() {
        let s = schema(&[("in", "uchar*"), ("out", "uchar*"), ("width", "int"), ("height", "int"), ("zoom", "float")]);
        let planned = plan_arguments(&s, handle(1), Some(handle(2)), &ImageMeta::rgba8(800, 600), &[1.1f64.into()]).unwrap();
        assert_eq!(
            planned,
            vec![
                ArgValue::Buffer(handle(1)),
                ArgValue::Buffer(handle(2)),
                ArgValue::Scalar(Scalar::Int(800)),
                ArgValue::Scalar(Scalar::Int(600)),
                ArgValue::Scalar(Scalar::Float(1.1)),
            ]
        );
    }

    #[test]
    fn test_plan_in_place() {
        let s = schema(&[("pixels", "uchar*"), ("width", "int"), ("height", "int")]);
        let planned = plan_arguments(&s, handle(1), None, &ImageMeta::rgba8(4, 2), &[]).unwrap();
        assert_eq!(planned[0], ArgValue::Buffer(handle(1)));
        assert_eq!(planned[2], ArgValue::Scalar(Scalar::Int(2)));
    }

    #[test]
    fn test_plan_metadata_fallback_and_bpp() {
        let s = schema(&[("p", "uchar*"), ("WIDTH", "int"), ("bpp", "uint"), ("radius", "int")]);
        let meta = ImageMeta { width: 0, height: 0, channels: 4, bit_depth: 8 };
        let planned = plan_arguments(&s, handle(1), None, &meta, &[640i32.into(), 3i32.into()]).unwrap();
        assert_eq!(planned[1], ArgValue::Scalar(Scalar::Int(640)));
        assert_eq!(planned[2], ArgValue::Scalar(Scalar::UInt(32)));
        assert_eq!(planned[3], ArgValue::Scalar(Scalar::Int(3)));
    }

    #[test]
    fn test_plan_clamps_to_last() {
        let s = schema(&[("p", "uchar*"), ("a", "int"), ("b", "int"), ("c", "double")]);
        let planned = plan_arguments(&s, handle(1), None, &ImageMeta::default(), &[5i32.into()]).unwrap();
        assert_eq!(planned[1], ArgValue::Scalar(Scalar::Int(5)));
        assert_eq!(planned[2], ArgValue::Scalar(Scalar::Int(5)));
        assert_eq!(planned[3], ArgValue::Scalar(Scalar::Double(5.0)));
    }

    #[test]
    fn test_plan_aligned_buffer_override() {
        let s = schema(&[("in", "uchar*"), ("out", "uchar*"), ("gain", "float")]);
        let args = [ArgValue::Scalar(Scalar::Int(0)), handle(9).into(), 2.0f32.into()];
        let planned = plan_arguments(&s, handle(1), Some(handle(2)), &ImageMeta::default(), &args).unwrap();
        assert_eq!(planned[0], ArgValue::Buffer(handle(1)));
        assert_eq!(planned[1], ArgValue::Buffer(handle(9)));
        assert_eq!(planned[2], ArgValue::Scalar(Scalar::Float(2.0)));
    }

    #[test]
    fn test_plan_failures() {
        let meta = ImageMeta::rgba8(8, 8);
        let needs_value = schema(&[("p", "uchar*"), ("zoom", "float")]);
        assert!(plan_arguments(&needs_value, handle(1), None, &meta, &[]).is_err());

        let missing_output = schema(&[("a", "uchar*"), ("b", "uchar*")]);
        assert!(plan_arguments(&missing_output, handle(1), None, &meta, &[]).is_err());

        let opaque = schema(&[("p", "uchar*"), ("img", "image2d_t")]);
        assert!(plan_arguments(&opaque, handle(1), None, &meta, &[1i32.into()]).is_err());

        let vector = schema(&[("p", "uchar*"), ("v", "float2")]);
        assert!(plan_arguments(&vector, handle(1), None, &meta, &[1i32.into()]).is_err());
    }

    #[test]
    fn test_plan_opaque_pointer_gets_buffer() {
        let s = schema(&[("p", "float4*"), ("width", "int")]);
        let planned = plan_arguments(&s, handle(1), None, &ImageMeta::rgba8(2, 2), &[]).unwrap();
        assert_eq!(planned[0], ArgValue::Buffer(handle(1)));
    }

    #[test]
    fn test_parse_arg_value() {
        assert_eq!("42".parse::<ArgValue>(), Ok(ArgValue::Scalar(Scalar::Int(42))));
        assert_eq!("5000000000".parse::<ArgValue>(), Ok(ArgValue::Scalar(Scalar::Long(5_000_000_000))));
        assert_eq!("1.5".parse::<ArgValue>(), Ok(ArgValue::Scalar(Scalar::Double(1.5))));
        assert_eq!("0.5, 2".parse::<ArgValue>(), Ok(ArgValue::Scalar(Scalar::Float2([0.5, 2.0]))));
        assert!("zoom".parse::<ArgValue>().is_err());
    }

    #[test]
    fn test_meta_derived() {
        let meta = ImageMeta::rgba8(1920, 1080);
        assert_eq!(meta.derived("BitDepth"), Some(8));
        assert_eq!(meta.derived("bpp"), Some(32));
        assert_eq!(meta.derived("zoom"), None);
    }
}

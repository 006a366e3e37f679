//! OpenCL device via `opencl3`.
//!
//! One context and one in-order command queue per opened device. Buffers
//! are created with `CL_MEM_COPY_HOST_PTR`; reads are blocking. Kernel
//! argument introspection needs `-cl-kernel-arg-info` in the build options,
//! otherwise the compiler falls back to parsing the source.

use std::ffi::c_void;
use std::ptr;

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{get_all_devices, Device, CL_DEVICE_TYPE_ALL};
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_COPY_HOST_PTR, CL_MEM_READ_WRITE};
use opencl3::platform::Platform;
use opencl3::program::Program;
use opencl3::types::{cl_device_id, CL_BLOCKING};
use tracing::{debug, warn};

use super::{ArgInfo, Backend, DeviceDescriptor, DeviceDriver, DispatchGeometry, KernelArg, Scalar};
use crate::config::RuntimeConfig;
use crate::{ComputeError, ComputeResult};

/// Work-group size used when the device does not report one.
const FALLBACK_WORK_GROUP_SIZE: usize = 64;

/// Device buffer.
pub struct OpenClBuffer {
    buffer: Buffer<u8>,
    len: usize,
}

impl OpenClBuffer {
    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Built kernel with its program.
pub struct OpenClKernel {
    kernel: Kernel,
    _program: Program,
}

/// Opened OpenCL device.
pub struct OpenClDriver {
    descriptor: DeviceDescriptor,
    _device: Device,
    context: Context,
    queue: CommandQueue,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for context, command queue,
// kernel and memory objects. The raw pointers in opencl3 types are opaque
// handles owned by the runtime. Kernel argument state is only mutated
// through `&mut OpenClKernel`, which callers serialize.
unsafe impl Send for OpenClBuffer {}
unsafe impl Sync for OpenClBuffer {}
unsafe impl Send for OpenClKernel {}
unsafe impl Send for OpenClDriver {}
unsafe impl Sync for OpenClDriver {}

fn describe(index: usize, id: cl_device_id) -> DeviceDescriptor {
    let device = Device::new(id);
    let platform = device
        .platform()
        .ok()
        .and_then(|p| Platform::new(p).name().ok())
        .unwrap_or_default();

    DeviceDescriptor {
        index,
        name: device.name().unwrap_or_default().trim().to_string(),
        vendor: device.vendor().unwrap_or_default().trim().to_string(),
        platform: platform.trim().to_string(),
        global_memory: device.global_mem_size().unwrap_or(0),
        max_work_group_size: device
            .max_work_group_size()
            .ok()
            .filter(|&n| n > 0)
            .unwrap_or(FALLBACK_WORK_GROUP_SIZE),
        backend: Backend::OpenCl,
    }
}

fn device_ids() -> Vec<cl_device_id> {
    match get_all_devices(CL_DEVICE_TYPE_ALL) {
        Ok(ids) => ids,
        Err(e) => {
            debug!(error = %e, "no OpenCL devices");
            Vec::new()
        }
    }
}

impl DeviceDriver for OpenClDriver {
    type Buffer = OpenClBuffer;
    type Kernel = OpenClKernel;

    const BACKEND: Backend = Backend::OpenCl;

    fn enumerate() -> Vec<DeviceDescriptor> {
        device_ids()
            .into_iter()
            .enumerate()
            .map(|(i, id)| describe(i, id))
            .collect()
    }

    fn open(index: usize, _config: &RuntimeConfig) -> ComputeResult<Self> {
        let ids = device_ids();
        if ids.is_empty() {
            return Err(ComputeError::NoDevice);
        }
        let id = *ids.get(index).ok_or(ComputeError::DeviceIndex { index, count: ids.len() })?;

        let device = Device::new(id);
        let context = Context::from_device(&device)
            .map_err(|e| ComputeError::DeviceCreation(e.to_string()))?;
        // OpenCL 1.2 API, the 2.0 variant is missing on some platforms
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context, 0)
            .map_err(|e| ComputeError::DeviceCreation(e.to_string()))?;

        Ok(Self {
            descriptor: describe(index, id),
            _device: device,
            context,
            queue,
        })
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn create_buffer(&self, bytes: &[u8]) -> ComputeResult<OpenClBuffer> {
        if bytes.is_empty() {
            return Err(ComputeError::BufferCreation("zero-sized buffer".into()));
        }
        // COPY_HOST_PTR only reads from the pointer during creation.
        let buffer = unsafe {
            Buffer::<u8>::create(
                &self.context,
                CL_MEM_READ_WRITE | CL_MEM_COPY_HOST_PTR,
                bytes.len(),
                bytes.as_ptr() as *mut c_void,
            )
        }
        .map_err(|e| ComputeError::BufferCreation(e.to_string()))?;

        Ok(OpenClBuffer { buffer, len: bytes.len() })
    }

    fn read_buffer(&self, buffer: &OpenClBuffer, out: &mut [u8]) -> ComputeResult<()> {
        if out.len() > buffer.len {
            return Err(ComputeError::BufferRead(format!(
                "read of {} bytes from a {}-byte buffer",
                out.len(),
                buffer.len
            )));
        }
        let event = unsafe {
            self.queue
                .enqueue_read_buffer(&buffer.buffer, CL_BLOCKING, 0, out, &[])
        }
        .map_err(|e| ComputeError::BufferRead(e.to_string()))?;
        event.wait().map_err(|e| ComputeError::BufferRead(e.to_string()))?;
        Ok(())
    }

    fn build_kernel(&self, source: &str, name: &str, options: &str) -> ComputeResult<OpenClKernel> {
        let program = Program::create_and_build_from_source(&self.context, source, options)
            .map_err(|log| ComputeError::KernelBuild { kernel: name.to_string(), log })?;
        let kernel = Kernel::create(&program, name).map_err(|e| ComputeError::KernelBuild {
            kernel: name.to_string(),
            log: e.to_string(),
        })?;
        Ok(OpenClKernel { kernel, _program: program })
    }

    fn kernel_arg_count(&self, kernel: &OpenClKernel) -> ComputeResult<u32> {
        kernel
            .kernel
            .num_args()
            .map_err(|e| ComputeError::ArgumentInfo(e.to_string()))
    }

    fn kernel_arg_info(&self, kernel: &OpenClKernel, index: u32) -> ComputeResult<ArgInfo> {
        let type_name = kernel
            .kernel
            .get_arg_type_name(index)
            .map_err(|e| ComputeError::ArgumentInfo(e.to_string()))?;
        let name = kernel
            .kernel
            .get_arg_name(index)
            .map_err(|e| ComputeError::ArgumentInfo(e.to_string()))?;
        Ok(ArgInfo {
            type_name: type_name.trim_end_matches('\0').to_string(),
            name: name.trim_end_matches('\0').to_string(),
        })
    }

    fn set_kernel_arg(&self, kernel: &mut OpenClKernel, index: u32, arg: &KernelArg<OpenClBuffer>) -> ComputeResult<()> {
        let k = &kernel.kernel;
        // SAFETY: every value has exactly the size of the declared device
        // type; buffers pass their cl_mem handle.
        let result = unsafe {
            match arg {
                KernelArg::Buffer(b) => k.set_arg(index, &b.buffer.get()),
                KernelArg::Scalar(Scalar::Char(v)) => k.set_arg(index, v),
                KernelArg::Scalar(Scalar::UChar(v)) => k.set_arg(index, v),
                KernelArg::Scalar(Scalar::Short(v)) => k.set_arg(index, v),
                KernelArg::Scalar(Scalar::UShort(v)) => k.set_arg(index, v),
                KernelArg::Scalar(Scalar::Int(v)) => k.set_arg(index, v),
                KernelArg::Scalar(Scalar::UInt(v)) => k.set_arg(index, v),
                KernelArg::Scalar(Scalar::Long(v)) => k.set_arg(index, v),
                KernelArg::Scalar(Scalar::ULong(v)) => k.set_arg(index, v),
                KernelArg::Scalar(Scalar::Float(v)) => k.set_arg(index, v),
                KernelArg::Scalar(Scalar::Double(v)) => k.set_arg(index, v),
                KernelArg::Scalar(Scalar::Float2(v)) => k.set_arg(index, v),
            }
        };
        result.map_err(|e| ComputeError::KernelArgument { index, message: e.to_string() })
    }

    fn dispatch(&self, kernel: &mut OpenClKernel, geometry: &DispatchGeometry) -> ComputeResult<()> {
        let global = geometry.global_work_size();
        let event = unsafe {
            self.queue.enqueue_nd_range_kernel(
                kernel.kernel.get(),
                geometry.dimensions(),
                ptr::null(),
                global.as_ptr(),
                ptr::null(),
                &[],
            )
        }
        .map_err(|e| ComputeError::Dispatch(e.to_string()))?;

        // Event is released when dropped.
        if let Err(e) = event.wait() {
            warn!(error = %e, "kernel completion wait failed");
            return Err(ComputeError::Dispatch(e.to_string()));
        }
        Ok(())
    }
}

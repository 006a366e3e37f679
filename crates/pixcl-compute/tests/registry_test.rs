//! Buffer registry tests against the host device.

use std::fmt::Debug;
use std::sync::Arc;
use std::thread;

use pixcl_compute::driver::{HostBuffer, HostKernel};
use pixcl_compute::{
    ArgInfo, Backend, BufferRegistry, ComputeError, ComputeResult, DeviceDescriptor, DeviceDriver,
    DeviceElement, DispatchGeometry, ElementType, HostDriver, ImageObject, KernelArg, RuntimeConfig,
};

/// Host device whose reads always fail.
struct UnreadableDriver(HostDriver);

impl DeviceDriver for UnreadableDriver {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    const BACKEND: Backend = Backend::Host;

    fn enumerate() -> Vec<DeviceDescriptor> {
        HostDriver::enumerate()
    }

    fn open(index: usize, config: &RuntimeConfig) -> ComputeResult<Self> {
        HostDriver::open(index, config).map(Self)
    }

    fn descriptor(&self) -> &DeviceDescriptor {
        self.0.descriptor()
    }

    fn create_buffer(&self, bytes: &[u8]) -> ComputeResult<HostBuffer> {
        self.0.create_buffer(bytes)
    }

    fn read_buffer(&self, _buffer: &HostBuffer, _out: &mut [u8]) -> ComputeResult<()> {
        Err(ComputeError::BufferRead("device lost".into()))
    }

    fn build_kernel(&self, source: &str, name: &str, options: &str) -> ComputeResult<HostKernel> {
        self.0.build_kernel(source, name, options)
    }

    fn kernel_arg_count(&self, kernel: &HostKernel) -> ComputeResult<u32> {
        self.0.kernel_arg_count(kernel)
    }

    fn kernel_arg_info(&self, kernel: &HostKernel, index: u32) -> ComputeResult<ArgInfo> {
        self.0.kernel_arg_info(kernel, index)
    }

    fn set_kernel_arg(&self, kernel: &mut HostKernel, index: u32, arg: &KernelArg<HostBuffer>) -> ComputeResult<()> {
        self.0.set_kernel_arg(kernel, index, arg)
    }

    fn dispatch(&self, kernel: &mut HostKernel, geometry: &DispatchGeometry) -> ComputeResult<()> {
        self.0.dispatch(kernel, geometry)
    }
}

fn registry_with_capacity(bytes: u64) -> (Arc<HostDriver>, BufferRegistry<HostDriver>) {
    let driver = Arc::new(HostDriver::builder().capacity(bytes).build());
    let registry = BufferRegistry::new(Arc::clone(&driver));
    (driver, registry)
}

#[test]
fn test_free_releases_device_memory() {
    let (driver, registry) = registry_with_capacity(1 << 20);

    let a = registry.push(&[1u8; 256]).unwrap();
    let b = registry.push(&[0.5f32; 64]).unwrap();
    assert_eq!(driver.live_bytes(), 512);
    assert_eq!(registry.memory_used(false), 512);

    assert_eq!(registry.free(a, false), 256);
    assert_eq!(driver.live_bytes(), 256);
    assert_eq!(registry.free(a, false), 0);

    let floats = registry.pull::<f32>(b, false);
    assert_eq!(floats, vec![0.5; 64]);
    assert_eq!(driver.live_bytes(), 0);
    assert!(registry.is_empty());
}

#[test]
fn test_capacity_exhaustion() {
    let (_driver, registry) = registry_with_capacity(100);

    let a = registry.allocate(ElementType::U8, 80).unwrap();
    assert!(registry.allocate(ElementType::U8, 40).is_none());
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.memory_free(false), 20);

    registry.free(a, false);
    assert!(registry.allocate(ElementType::U8, 40).is_some());
}

#[test]
fn test_failed_group_leaves_nothing_behind() {
    let (driver, registry) = registry_with_capacity(64);

    let chunks = vec![vec![1u8; 32], vec![2u8; 32], vec![3u8; 32]];
    assert!(registry.push_chunks(&chunks).is_none());
    assert!(registry.is_empty());
    assert_eq!(driver.live_bytes(), 0);

    let ok = registry.push_chunks(&chunks[..2]).unwrap();
    assert_eq!(registry.pull_chunks::<u8>(ok), vec![vec![1u8; 32], vec![2u8; 32]]);
}

#[test]
fn test_stale_handle_after_reuse() {
    let (_driver, registry) = registry_with_capacity(1 << 20);

    let old = registry.push(&[7u32; 4]).unwrap();
    registry.free(old, false);
    let new = registry.push(&[9u32; 4]).unwrap();

    assert_ne!(old, new);
    assert!(!registry.contains(old));
    assert!(registry.pull::<u32>(old, true).is_empty());
    assert_eq!(registry.pull::<u32>(new, true), vec![9; 4]);
}

#[test]
fn test_image_push_failure_keeps_pixels() {
    let (_driver, registry) = registry_with_capacity(16);
    let mut image = ImageObject::from_pixels("big", vec![42; 8 * 8 * 4], 8, 8);

    assert!(registry.push_image(&mut image).is_none());
    assert!(image.is_on_host());
    assert_eq!(image.pixels().unwrap().len(), 256);
}

#[test]
fn test_image_round_trip_through_device() {
    let (driver, registry) = registry_with_capacity(1 << 20);
    let pixels: Vec<u8> = (0..64).collect();
    let mut image = ImageObject::from_pixels("ramp", pixels.clone(), 4, 4);

    let handle = registry.push_image(&mut image).unwrap();
    assert_eq!(image.device_handle(), Some(handle));
    assert_eq!(driver.live_bytes(), 64);

    assert!(registry.pull_image(&mut image));
    assert_eq!(image.pixels().unwrap(), pixels.as_slice());
    assert!(!registry.contains(handle));
    assert_eq!(driver.live_bytes(), 0);
}

#[test]
fn test_failed_read_keeps_record() {
    let driver = Arc::new(UnreadableDriver(HostDriver::builder().capacity(1 << 20).build()));
    let registry = BufferRegistry::new(driver);

    let handle = registry.push(&[3u16; 8]).unwrap();
    assert!(registry.pull::<u16>(handle, false).is_empty());
    assert!(registry.contains(handle));
    assert_eq!(registry.memory_used(false), 16);
}

#[test]
fn test_failed_image_pull_keeps_device_copy() {
    let driver = Arc::new(UnreadableDriver(HostDriver::builder().capacity(1 << 20).build()));
    let registry = BufferRegistry::new(driver);
    let mut image = ImageObject::blank(2, 2);

    let handle = registry.push_image(&mut image).unwrap();
    assert!(!registry.pull_image(&mut image));
    assert!(image.is_on_device());
    assert_eq!(image.device_handle(), Some(handle));
    assert!(registry.contains(handle));
    assert_eq!(registry.memory_used(false), 16);
}

fn assert_round_trip<T: DeviceElement + PartialEq + Debug>(registry: &BufferRegistry<HostDriver>, data: &[T]) {
    let handle = registry.push(data).unwrap();
    assert_eq!(registry.get_element_type(handle), Some(T::TYPE));
    assert_eq!(registry.memory_used(false), std::mem::size_of_val(data) as u64);
    assert_eq!(registry.pull::<T>(handle, false), data);
    assert!(registry.is_empty());
}

#[test]
fn test_round_trip_every_element_type() {
    let (driver, registry) = registry_with_capacity(1 << 20);

    assert_round_trip(&registry, &[0u8, 1, 127, 255]);
    assert_round_trip(&registry, &[i8::MIN, -1, 0, i8::MAX]);
    assert_round_trip(&registry, &[0u16, 1, u16::MAX]);
    assert_round_trip(&registry, &[i16::MIN, -300, 0, i16::MAX]);
    assert_round_trip(&registry, &[0u32, 70_000, u32::MAX]);
    assert_round_trip(&registry, &[i32::MIN, -5, 0, i32::MAX]);
    assert_round_trip(&registry, &[0u64, 1 << 40, u64::MAX]);
    assert_round_trip(&registry, &[i64::MIN, -1, 0, i64::MAX]);
    assert_round_trip(&registry, &[0.0f32, -1.5, f32::MAX, f32::MIN_POSITIVE]);
    assert_round_trip(&registry, &[0.0f64, -1.5, f64::MAX, 1e-300]);

    assert_eq!(driver.live_bytes(), 0);
}

#[test]
fn test_concurrent_push_pull_free() {
    let (driver, registry) = registry_with_capacity(1 << 24);
    let registry = Arc::new(registry);

    let workers: Vec<_> = (0..8u32)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for round in 0..50u32 {
                    let data = vec![worker * 1000 + round; 64];
                    let handle = registry.push(&data).unwrap();
                    assert_eq!(registry.pull::<u32>(handle, true), data);
                    if round % 2 == 0 {
                        assert_eq!(registry.pull::<u32>(handle, false), data);
                    } else {
                        assert_eq!(registry.free(handle, false), 256);
                    }
                    assert!(!registry.contains(handle));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(registry.memory_used(false), 0);
    assert!(registry.is_empty());
    assert_eq!(driver.live_bytes(), 0);
}

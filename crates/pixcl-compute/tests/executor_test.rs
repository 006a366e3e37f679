//! End-to-end kernel execution on the host device.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use pixcl_compute::{
    ArgValue, BufferRegistry, HostDriver, ImageMeta, ImageObject, KernelCompiler, KernelExecutor,
    RuntimeConfig,
};

fn kernel_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../kernels")
}

struct Fixture {
    driver: Arc<HostDriver>,
    registry: Arc<BufferRegistry<HostDriver>>,
    compiler: Arc<KernelCompiler<HostDriver>>,
    executor: KernelExecutor<HostDriver>,
}

fn fixture(driver: HostDriver, root: PathBuf) -> Fixture {
    let driver = Arc::new(driver);
    let config = RuntimeConfig::with_kernel_root(root);
    let registry = Arc::new(BufferRegistry::new(Arc::clone(&driver)));
    let compiler = Arc::new(KernelCompiler::new(Arc::clone(&driver), &config));
    let executor = KernelExecutor::new(Arc::clone(&registry), Arc::clone(&compiler)).with_log_success(false);
    Fixture { driver, registry, compiler, executor }
}

fn default_fixture() -> Fixture {
    fixture(HostDriver::new(), kernel_root())
}

#[test]
fn test_single_pointer_kernel_runs_in_place() {
    let f = default_fixture();
    let input = f.registry.push(&[10u8, 20, 30, 40, 0, 0, 0, 255]).unwrap();

    let out = f
        .executor
        .execute_image_kernel("invert", "00", input, &ImageMeta::rgba8(2, 1), &[]);

    assert_eq!(out, input);
    assert_eq!(f.registry.len(), 1);
    assert_eq!(f.registry.pull::<u8>(out, false), vec![245, 235, 225, 40, 255, 255, 255, 255]);
}

#[test]
fn test_two_pointer_kernel_replaces_input() {
    let f = default_fixture();
    let input = f.registry.push(&[255u8, 0, 0, 128]).unwrap();

    let out = f
        .executor
        .execute_image_kernel("grayscale", "00", input, &ImageMeta::rgba8(1, 1), &[]);

    assert_ne!(out, input);
    assert!(!f.registry.contains(input));
    assert_eq!(f.registry.len(), 1);
    assert_eq!(f.registry.get(out).unwrap().first_len(), 4);
    assert_eq!(f.registry.pull::<u8>(out, false), vec![76, 76, 76, 128]);
    assert_eq!(f.driver.live_bytes(), 0);
}

#[test]
fn test_linear_geometry_without_extents() {
    let f = default_fixture();
    let input = f.registry.push(&[100u8; 16]).unwrap();

    // No extents: 1D over 16 / 4 pixels, width and height filled positionally
    let args = [ArgValue::from(0i32), ArgValue::from(0i32), ArgValue::from(1.5f32)];
    let out = f
        .executor
        .execute_image_kernel("brightness", "00", input, &ImageMeta::default(), &args);

    assert_ne!(out, input);
    assert_eq!(f.registry.pull::<u8>(out, true), [150u8, 150, 150, 100].repeat(4));
}

#[test]
fn test_missing_kernel_returns_input() {
    let f = default_fixture();
    let input = f.registry.push(&[1u8; 8]).unwrap();

    let out = f
        .executor
        .execute_image_kernel("sharpen", "00", input, &ImageMeta::rgba8(2, 1), &[]);

    assert_eq!(out, input);
    assert_eq!(f.registry.len(), 1);
    assert_eq!(f.registry.pull::<u8>(out, true), vec![1u8; 8]);
}

#[test]
fn test_output_allocation_failure_returns_input() {
    let f = fixture(HostDriver::builder().capacity(40).build(), kernel_root());
    let input = f.registry.push(&[9u8; 32]).unwrap();

    let out = f
        .executor
        .execute_image_kernel("grayscale", "00", input, &ImageMeta::rgba8(4, 2), &[]);

    assert_eq!(out, input);
    assert_eq!(f.registry.len(), 1);
    assert_eq!(f.driver.live_bytes(), 32);
}

#[test]
fn test_dispatch_failure_releases_output() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("broken00.cl"),
        "__kernel void broken00(__global uchar* input, __global uchar* output, int width, int height) {}",
    )
    .unwrap();
    let driver = HostDriver::builder()
        .kernel("broken00", |_| Err(pixcl_compute::ComputeError::Dispatch("out of resources".into())))
        .build();
    let f = fixture(driver, dir.path().to_path_buf());
    let input = f.registry.push(&[5u8; 16]).unwrap();

    let out = f
        .executor
        .execute_image_kernel("broken", "00", input, &ImageMeta::rgba8(2, 2), &[]);

    assert_eq!(out, input);
    assert_eq!(f.registry.handles(), vec![input]);
    assert_eq!(f.driver.live_bytes(), 16);
}

#[test]
fn test_bad_argument_returns_input() {
    let f = default_fixture();
    let input = f.registry.push(&[5u8; 16]).unwrap();
    let other = f.registry.push(&[0u8; 16]).unwrap();

    // A buffer cannot fill the float `factor`
    let out = f.executor.execute_image_kernel(
        "brightness",
        "00",
        input,
        &ImageMeta::rgba8(2, 2),
        &[ArgValue::Buffer(other)],
    );

    assert_eq!(out, input);
    assert_eq!(f.registry.len(), 2);
}

#[test]
fn test_execute_on_host_image() {
    let f = default_fixture();
    let mut image = ImageObject::from_pixels("px", vec![0, 100, 200, 255], 1, 1);

    assert!(f.executor.execute_on_image(&mut image, "invert", "00", &[]));
    assert!(image.is_on_host());
    assert_eq!(image.pixels().unwrap(), &[255, 155, 55, 255]);
    assert!(f.registry.is_empty());

    assert!(!f.executor.execute_on_image(&mut image, "nothing", "00", &[]));
    assert_eq!(image.pixels().unwrap(), &[255, 155, 55, 255]);
}

#[test]
fn test_execute_on_device_image_stays_on_device() {
    let f = default_fixture();
    let mut image = ImageObject::from_pixels("px", vec![200, 0, 0, 7], 1, 1);
    let before = f.registry.push_image(&mut image).unwrap();

    assert!(f.executor.execute_on_image(&mut image, "grayscale", "00", &[]));
    let after = image.device_handle().unwrap();
    assert_ne!(before, after);
    assert!(!f.registry.contains(before));

    assert!(f.registry.pull_image(&mut image));
    assert_eq!(image.pixels().unwrap(), &[60, 60, 60, 7]);
}

#[test]
fn test_execute_loaded_kernel() {
    let f = default_fixture();

    let invert = f.compiler.load("invert00").unwrap();
    let input = f.registry.push(&[0u8, 50, 100, 9]).unwrap();
    let out = f.executor.execute(&invert, input, &ImageMeta::rgba8(1, 1), &[]);
    assert_eq!(out, input);
    assert_eq!(f.registry.pull::<u8>(out, false), vec![255, 205, 155, 9]);

    let grayscale = f.compiler.load("grayscale00").unwrap();
    assert_eq!(grayscale.pointer_count(), 2);
    let input = f.registry.push(&[255u8, 0, 0, 128]).unwrap();
    let out = f.executor.execute(&grayscale, input, &ImageMeta::rgba8(1, 1), &[]);
    assert_ne!(out, input);
    assert!(!f.registry.contains(input));
    assert_eq!(f.registry.handles(), vec![out]);
    assert_eq!(f.registry.pull::<u8>(out, false), vec![76, 76, 76, 128]);
    assert_eq!(f.driver.live_bytes(), 0);
}

#[test]
fn test_execute_loaded_kernel_on_image() {
    let f = default_fixture();
    let kernel = f.compiler.load("invert00").unwrap();
    let mut image = ImageObject::from_pixels("px", vec![1, 2, 3, 4], 1, 1);

    assert!(f.executor.execute_kernel_on_image(&mut image, &kernel, &[]));
    assert!(image.is_on_host());
    assert_eq!(image.pixels().unwrap(), &[254, 253, 252, 4]);
    assert!(f.registry.is_empty());
}

#[test]
fn test_concurrent_runs_share_one_kernel() {
    let f = default_fixture();

    thread::scope(|scope| {
        for worker in 0..8u8 {
            let f = &f;
            scope.spawn(move || {
                for round in 0..10u8 {
                    let v = worker * 20 + round;
                    let input = f.registry.push(&[v, v, v, 255].repeat(16)).unwrap();
                    let out = f
                        .executor
                        .execute_image_kernel("grayscale", "00", input, &ImageMeta::rgba8(4, 4), &[]);
                    assert_ne!(out, input);
                    assert_eq!(f.registry.pull::<u8>(out, false), [v, v, v, 255].repeat(16));
                }
            });
        }
    });

    assert_eq!(f.compiler.cached_kernels().len(), 1);
    assert!(f.registry.is_empty());
    assert_eq!(f.driver.live_bytes(), 0);
}

//! Native implementations of the kernels shipped in `kernels/imaging/`.
//!
//! Each function mirrors the `.cl` source of the same name; argument
//! indices follow the declared parameter order.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use super::host::{HostKernelFn, HostLaunch};
use crate::ComputeResult;

const MANDELBROT_MAX_ITER: u32 = 128;

pub(super) fn register_builtins(kernels: &mut HashMap<String, HostKernelFn>) {
    kernels.insert("invert00".into(), Arc::new(invert));
    kernels.insert("grayscale00".into(), Arc::new(grayscale));
    kernels.insert("brightness00".into(), Arc::new(brightness));
    kernels.insert("mandelbrot00".into(), Arc::new(mandelbrot));
}

/// Apply `f(pixel_index, rgba)` to every RGBA pixel covered by the launch.
///
/// `input == output` (or both slots bound to the same buffer) runs in place.
fn map_pixels<F>(launch: &HostLaunch<'_>, input: usize, output: usize, f: F) -> ComputeResult<()>
where
    F: Fn(usize, [u8; 4]) -> [u8; 4] + Sync,
{
    let src = launch.buffer(input)?;
    let dst = launch.buffer(output)?;
    let items = launch.geometry().work_items();

    if Arc::ptr_eq(src, dst) {
        let mut data = dst.write();
        data.par_chunks_exact_mut(4)
            .enumerate()
            .take(items)
            .for_each(|(i, px)| {
                let out = f(i, [px[0], px[1], px[2], px[3]]);
                px.copy_from_slice(&out);
            });
    } else {
        let src = src.read();
        let mut dst = dst.write();
        dst.par_chunks_exact_mut(4)
            .zip(src.par_chunks_exact(4))
            .enumerate()
            .take(items)
            .for_each(|(i, (out, inp))| {
                out.copy_from_slice(&f(i, [inp[0], inp[1], inp[2], inp[3]]));
            });
    }
    Ok(())
}

/// `invert00(uchar* pixels, int width, int height)`
fn invert(launch: &HostLaunch<'_>) -> ComputeResult<()> {
    launch.int(1)?;
    launch.int(2)?;
    map_pixels(launch, 0, 0, |_, [r, g, b, a]| [255 - r, 255 - g, 255 - b, a])
}

/// `grayscale00(uchar* input, uchar* output, int width, int height)`
fn grayscale(launch: &HostLaunch<'_>) -> ComputeResult<()> {
    launch.int(2)?;
    launch.int(3)?;
    map_pixels(launch, 0, 1, |_, [r, g, b, a]| {
        let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        let l = luma.round().clamp(0.0, 255.0) as u8;
        [l, l, l, a]
    })
}

/// `brightness00(uchar* input, uchar* output, int width, int height, float factor)`
fn brightness(launch: &HostLaunch<'_>) -> ComputeResult<()> {
    launch.int(2)?;
    launch.int(3)?;
    let factor = launch.float(4)?;
    let scale = |c: u8| (c as f32 * factor).round().clamp(0.0, 255.0) as u8;
    map_pixels(launch, 0, 1, |_, [r, g, b, a]| [scale(r), scale(g), scale(b), a])
}

/// `mandelbrot00(uchar* input, uchar* output, int width, int height, float zoom)`
fn mandelbrot(launch: &HostLaunch<'_>) -> ComputeResult<()> {
    let width = launch.int(2)?.max(1) as f32;
    let height = launch.int(3)?.max(1) as f32;
    let zoom = launch.float(4)?;
    let zoom = if zoom > 0.0 { zoom } else { 1.0 };
    let w = width as usize;

    map_pixels(launch, 0, 1, |i, _| {
        let x = (i % w) as f32;
        let y = (i / w) as f32;
        let cx = (x - width / 2.0) / (0.5 * zoom * width) - 0.5;
        let cy = (y - height / 2.0) / (0.5 * zoom * height);

        let (mut zx, mut zy) = (0.0f32, 0.0f32);
        let mut iter = 0;
        while iter < MANDELBROT_MAX_ITER && zx * zx + zy * zy <= 4.0 {
            let t = zx * zx - zy * zy + cx;
            zy = 2.0 * zx * zy + cy;
            zx = t;
            iter += 1;
        }

        if iter == MANDELBROT_MAX_ITER {
            return [0, 0, 0, 255];
        }
        let t = iter as f32 / MANDELBROT_MAX_ITER as f32;
        let u = 1.0 - t;
        [
            (9.0 * u * t * t * t * 255.0) as u8,
            (15.0 * u * u * t * t * 255.0) as u8,
            (8.5 * u * u * u * t * 255.0) as u8,
            255,
        ]
    })
}

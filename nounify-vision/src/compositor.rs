//! Raster compositing of the overlay asset onto a surface.
//!
//! `Canvas` mirrors a 2D drawing context: a current transform plus a
//! save/restore stack. Drawing inverse-maps destination pixels through the
//! current transform and samples the source bilinearly.

use std::io::Cursor;
use std::path::Path;

use image::{imageops, DynamicImage, GenericImageView, ImageFormat, Pixel, RgbaImage};

use crate::error::VisionError;
use crate::geometry::{OverlayTransform, OVERLAY_HEIGHT, OVERLAY_WIDTH};

/// 2D affine transform.
///
/// ```text
/// x' = a*x + c*y + e
/// y' = b*x + d*y + f
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Default for Affine {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Affine {
    pub const IDENTITY: Affine = Affine {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    /// `self * other`: applies `other` first, then `self`.
    pub fn then(&self, other: &Affine) -> Affine {
        Affine {
            a: self.a * other.a + self.c * other.b,
            b: self.b * other.a + self.d * other.b,
            c: self.a * other.c + self.c * other.d,
            d: self.b * other.c + self.d * other.d,
            e: self.a * other.e + self.c * other.f + self.e,
            f: self.b * other.e + self.d * other.f + self.f,
        }
    }

    pub fn translation(tx: f32, ty: f32) -> Affine {
        Affine {
            e: tx,
            f: ty,
            ..Self::IDENTITY
        }
    }

    /// Clockwise on screen for positive angles, since y grows downward.
    pub fn rotation(angle: f32) -> Affine {
        let (sin, cos) = angle.sin_cos();
        Affine {
            a: cos,
            b: sin,
            c: -sin,
            d: cos,
            e: 0.0,
            f: 0.0,
        }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    pub fn invert(&self) -> Option<Affine> {
        let det = self.a * self.d - self.b * self.c;
        if det.abs() < f32::EPSILON || !det.is_finite() {
            return None;
        }
        Some(Affine {
            a: self.d / det,
            b: -self.b / det,
            c: -self.c / det,
            d: self.a / det,
            e: (self.c * self.f - self.d * self.e) / det,
            f: (self.b * self.e - self.a * self.f) / det,
        })
    }
}

/// Drawing context over a mutable RGBA buffer.
pub struct Canvas<'a> {
    target: &'a mut RgbaImage,
    transform: Affine,
    stack: Vec<Affine>,
}

impl<'a> Canvas<'a> {
    pub fn new(target: &'a mut RgbaImage) -> Self {
        Self {
            target,
            transform: Affine::IDENTITY,
            stack: Vec::new(),
        }
    }

    pub fn transform(&self) -> Affine {
        self.transform
    }

    pub fn save(&mut self) {
        self.stack.push(self.transform);
    }

    /// Restoring with an empty stack resets to identity.
    pub fn restore(&mut self) {
        self.transform = self.stack.pop().unwrap_or(Affine::IDENTITY);
    }

    pub fn translate(&mut self, tx: f32, ty: f32) {
        self.transform = self.transform.then(&Affine::translation(tx, ty));
    }

    pub fn rotate(&mut self, angle: f32) {
        self.transform = self.transform.then(&Affine::rotation(angle));
    }

    /// Draw `src` scaled into the user-space rectangle `(dx, dy, dw, dh)`.
    pub fn draw_image(&mut self, src: &RgbaImage, dx: f32, dy: f32, dw: f32, dh: f32) {
        let (sw, sh) = src.dimensions();
        if sw == 0 || sh == 0 || !(dw > 0.0) || !(dh > 0.0) {
            return;
        }
        let Some(inverse) = self.transform.invert() else {
            return;
        };

        let corners = [
            self.transform.apply(dx, dy),
            self.transform.apply(dx + dw, dy),
            self.transform.apply(dx, dy + dh),
            self.transform.apply(dx + dw, dy + dh),
        ];
        let (tw, th) = self.target.dimensions();
        let min_x = corners.iter().map(|c| c.0).fold(f32::INFINITY, f32::min);
        let max_x = corners.iter().map(|c| c.0).fold(f32::NEG_INFINITY, f32::max);
        let min_y = corners.iter().map(|c| c.1).fold(f32::INFINITY, f32::min);
        let max_y = corners.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max);
        if !(min_x.is_finite() && max_x.is_finite() && min_y.is_finite() && max_y.is_finite()) {
            return;
        }

        let x0 = min_x.floor().max(0.0) as u32;
        let y0 = min_y.floor().max(0.0) as u32;
        let x1 = (max_x.ceil().max(0.0) as u32).min(tw);
        let y1 = (max_y.ceil().max(0.0) as u32).min(th);

        let scale_x = sw as f32 / dw;
        let scale_y = sh as f32 / dh;

        for py in y0..y1 {
            for px in x0..x1 {
                let (u, v) = inverse.apply(px as f32 + 0.5, py as f32 + 0.5);
                let sx = (u - dx) * scale_x;
                let sy = (v - dy) * scale_y;
                if sx < 0.0 || sy < 0.0 || sx >= sw as f32 || sy >= sh as f32 {
                    continue;
                }
                // Sample between texel centers, clamped at the edges.
                let sx = (sx - 0.5).clamp(0.0, (sw - 1) as f32);
                let sy = (sy - 0.5).clamp(0.0, (sh - 1) as f32);
                let Some(color) = imageops::interpolate_bilinear(src, sx, sy) else {
                    continue;
                };
                self.target.get_pixel_mut(px, py).blend(&color);
            }
        }
    }
}

/// Decoded overlay image. Holding one means the asset is ready to draw.
#[derive(Debug, Clone)]
pub struct OverlayAsset {
    image: RgbaImage,
}

impl OverlayAsset {
    pub fn from_image(image: DynamicImage) -> Result<Self, VisionError> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Err(VisionError::InvalidAsset {
                reason: format!("overlay has zero size ({w}x{h})"),
            });
        }
        if (w, h) != (OVERLAY_WIDTH, OVERLAY_HEIGHT) {
            log::warn!(
                "overlay is {}x{}, transforms are calibrated for {}x{}",
                w,
                h,
                OVERLAY_WIDTH,
                OVERLAY_HEIGHT
            );
        }
        Ok(Self {
            image: image.to_rgba8(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VisionError> {
        Self::from_image(image::load_from_memory(bytes)?)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, VisionError> {
        Self::from_image(image::open(path)?)
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}

/// Draw the overlay for one face. The transform never outlives the call.
pub fn draw_overlay(canvas: &mut Canvas<'_>, asset: &OverlayAsset, transform: &OverlayTransform) {
    canvas.save();
    canvas.translate(transform.anchor.x, transform.anchor.y);
    canvas.rotate(transform.angle_radians);
    canvas.draw_image(
        asset.image(),
        -(transform.width / 2.0),
        -(transform.height / 2.0),
        transform.width,
        transform.height,
    );
    canvas.restore();
}

/// Pixel buffer matching the source image's natural dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSurface {
    pixels: RgbaImage,
}

impl RasterSurface {
    /// Size the surface to `background` and paint it as the bottom layer.
    pub fn from_background(background: &DynamicImage) -> Self {
        Self {
            pixels: background.to_rgba8(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn canvas(&mut self) -> Canvas<'_> {
        Canvas::new(&mut self.pixels)
    }

    pub fn draw_overlay(&mut self, asset: &OverlayAsset, transform: &OverlayTransform) {
        draw_overlay(&mut self.canvas(), asset, transform);
    }

    pub fn image(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, VisionError> {
        let mut buf = Cursor::new(Vec::new());
        self.pixels.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use image::Rgba;
    use approx::assert_relative_eq;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    fn solid(w: u32, h: u32, color: Rgba<u8>) -> RgbaImage {
        RgbaImage::from_pixel(w, h, color)
    }

    #[test]
    fn affine_inverse_round_trips() {
        let m = Affine::translation(12.0, -4.0).then(&Affine::rotation(0.7));
        let inv = m.invert().unwrap();
        let (x, y) = m.apply(3.0, 5.0);
        let (bx, by) = inv.apply(x, y);
        assert_relative_eq!(bx, 3.0, epsilon = 1e-4);
        assert_relative_eq!(by, 5.0, epsilon = 1e-4);
    }

    #[test]
    fn rotation_is_about_translated_origin() {
        let m = Affine::translation(10.0, 10.0).then(&Affine::rotation(std::f32::consts::FRAC_PI_2));
        let (x, y) = m.apply(5.0, 0.0);
        assert_relative_eq!(x, 10.0, epsilon = 1e-4);
        assert_relative_eq!(y, 15.0, epsilon = 1e-4);
    }

    #[test]
    fn restore_undoes_transform() {
        let mut img = solid(4, 4, WHITE);
        let mut canvas = Canvas::new(&mut img);
        canvas.save();
        canvas.translate(3.0, 1.0);
        canvas.rotate(1.2);
        canvas.restore();
        assert_eq!(canvas.transform(), Affine::IDENTITY);
    }

    #[test]
    fn unrotated_draw_covers_target_rect() {
        let mut img = solid(10, 10, WHITE);
        Canvas::new(&mut img).draw_image(&solid(2, 2, RED), 2.0, 3.0, 4.0, 2.0);

        for y in 0..10 {
            for x in 0..10 {
                let inside = (2..6).contains(&x) && (3..5).contains(&y);
                let expected = if inside { RED } else { WHITE };
                assert_eq!(*img.get_pixel(x, y), expected, "pixel ({x}, {y})");
            }
        }
    }

    #[test]
    fn zero_angle_matches_plain_translate() {
        let asset = OverlayAsset::from_image(DynamicImage::ImageRgba8(solid(15, 8, RED))).unwrap();
        let t = OverlayTransform {
            anchor: Point::new(20.0, 12.0),
            width: 15.0,
            height: 8.0,
            angle_radians: 0.0,
        };

        let mut rotated = solid(40, 30, WHITE);
        draw_overlay(&mut Canvas::new(&mut rotated), &asset, &t);

        let mut plain = solid(40, 30, WHITE);
        let mut canvas = Canvas::new(&mut plain);
        canvas.translate(20.0, 12.0);
        canvas.draw_image(asset.image(), -7.5, -4.0, 15.0, 8.0);

        assert_eq!(rotated, plain);
    }

    #[test]
    fn quarter_turn_swaps_extent() {
        let asset = OverlayAsset::from_image(DynamicImage::ImageRgba8(solid(20, 4, RED))).unwrap();
        let t = OverlayTransform {
            anchor: Point::new(15.0, 15.0),
            width: 20.0,
            height: 4.0,
            angle_radians: std::f32::consts::FRAC_PI_2,
        };
        let mut img = solid(30, 30, WHITE);
        draw_overlay(&mut Canvas::new(&mut img), &asset, &t);

        // Rotated 90 degrees: tall and narrow around the anchor.
        assert_eq!(*img.get_pixel(15, 7), RED);
        assert_eq!(*img.get_pixel(15, 22), RED);
        assert_eq!(*img.get_pixel(7, 15), WHITE);
        assert_eq!(*img.get_pixel(22, 15), WHITE);
    }

    #[test]
    fn draws_do_not_leak_transforms() {
        let asset = OverlayAsset::from_image(DynamicImage::ImageRgba8(solid(4, 4, RED))).unwrap();
        let first = OverlayTransform {
            anchor: Point::new(5.0, 5.0),
            width: 4.0,
            height: 4.0,
            angle_radians: 0.9,
        };
        let second = OverlayTransform {
            anchor: Point::new(20.0, 20.0),
            width: 4.0,
            height: 4.0,
            angle_radians: 0.0,
        };

        let mut both = solid(30, 30, WHITE);
        let mut canvas = Canvas::new(&mut both);
        draw_overlay(&mut canvas, &asset, &first);
        draw_overlay(&mut canvas, &asset, &second);
        assert_eq!(canvas.transform(), Affine::IDENTITY);

        let mut only_second = solid(30, 30, WHITE);
        draw_overlay(&mut Canvas::new(&mut only_second), &asset, &second);

        for y in 14..30 {
            for x in 14..30 {
                assert_eq!(both.get_pixel(x, y), only_second.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn transparent_overlay_leaves_background() {
        let clear = solid(4, 4, Rgba([0, 0, 0, 0]));
        let mut img = solid(8, 8, WHITE);
        Canvas::new(&mut img).draw_image(&clear, 0.0, 0.0, 8.0, 8.0);
        assert!(img.pixels().all(|p| *p == WHITE));
    }

    #[test]
    fn half_alpha_blends() {
        let half = solid(2, 2, Rgba([0, 0, 0, 128]));
        let mut img = solid(2, 2, WHITE);
        Canvas::new(&mut img).draw_image(&half, 0.0, 0.0, 2.0, 2.0);
        let p = img.get_pixel(0, 0);
        assert!((120..=135).contains(&p[0]), "got {:?}", p);
        assert_eq!(p[3], 255);
    }

    #[test]
    fn degenerate_size_is_noop() {
        let mut img = solid(8, 8, WHITE);
        Canvas::new(&mut img).draw_image(&solid(2, 2, RED), 1.0, 1.0, 0.0, 4.0);
        assert!(img.pixels().all(|p| *p == WHITE));
    }

    #[test]
    fn surface_matches_natural_size() {
        let bg = DynamicImage::new_rgb8(37, 21);
        let surface = RasterSurface::from_background(&bg);
        assert_eq!(surface.dimensions(), (37, 21));
    }

    #[test]
    fn png_round_trip_keeps_pixels() {
        let bg = DynamicImage::ImageRgba8(solid(5, 3, RED));
        let surface = RasterSurface::from_background(&bg);
        let png = surface.encode_png().unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(&decoded, surface.image());
    }

    #[test]
    fn empty_asset_is_rejected() {
        let err = OverlayAsset::from_image(DynamicImage::new_rgba8(0, 0)).unwrap_err();
        assert!(matches!(err, VisionError::InvalidAsset { .. }));
    }
}

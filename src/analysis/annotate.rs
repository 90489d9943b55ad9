use anyhow::Context;
use font8x8::{UnicodeFonts, BASIC_FONTS, LATIN_FONTS};
use image::{codecs::jpeg::JpegEncoder, imageops, DynamicImage, Rgba, RgbaImage};
use imageproc::{drawing::draw_filled_rect_mut, rect::Rect};
use tracing::{debug, warn};

use super::model::{Category, FoodItem};

const FILL_ALPHA: u8 = 80;
const JPEG_QUALITY: u8 = 95;
const GLYPH_SIZE: u32 = 8;
const LABEL_OFFSET: u32 = 2;
const LABEL_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 255]);

pub fn category_color(category: Category) -> [u8; 3] {
    match category {
        Category::Vegetable => [76, 175, 80],
        Category::Protein => [244, 67, 54],
        Category::Carbohydrate => [255, 193, 7],
        Category::Unclassified => [158, 158, 158],
    }
}

#[derive(Debug)]
pub struct AnnotatedImage {
    /// JPEG bytes.
    pub bytes: Vec<u8>,
    pub drawn: usize,
    pub labelled: usize,
}

/// Tints every non-degenerate item box with its category colour and labels it
/// with `"<name> (<pct>%)"` when the label fits. Output is an opaque JPEG of the
/// same size as the source.
pub fn annotate(source: &DynamicImage, items: &[FoodItem]) -> anyhow::Result<AnnotatedImage> {
    let mut base = source.to_rgba8();
    let (width, height) = base.dimensions();
    let mut overlay = RgbaImage::new(width, height);
    let mut labels = Vec::new();
    let mut drawn = 0;

    for item in items {
        let b = item.bounding_box;
        if b.is_degenerate() || b.x2 >= width || b.y2 >= height {
            warn!(name = %item.name, bbox = ?b, "skipping unusable box");
            continue;
        }
        let [r, g, bl] = category_color(item.category);
        draw_filled_rect_mut(
            &mut overlay,
            Rect::at(b.x1 as i32, b.y1 as i32).of_size(b.x2 - b.x1 + 1, b.y2 - b.y1 + 1),
            Rgba([r, g, bl, FILL_ALPHA]),
        );
        drawn += 1;

        let text = format!("{} ({:.1}%)", item.name, item.area_percentage);
        let (x, y) = (b.x1 + LABEL_OFFSET, b.y1 + LABEL_OFFSET);
        let (tw, th) = label_size(&text);
        if tw <= b.width() && x + tw <= width && y + th <= height {
            labels.push((x, y, text, Rgba([r, g, bl, 255])));
        } else {
            debug!(name = %item.name, "label does not fit; omitted");
        }
    }

    imageops::overlay(&mut base, &overlay, 0, 0);

    let labelled = labels.len();
    for (x, y, text, color) in labels {
        let (tw, th) = label_size(&text);
        draw_filled_rect_mut(
            &mut base,
            Rect::at(x as i32, y as i32).of_size(tw, th),
            LABEL_BACKGROUND,
        );
        draw_label(&mut base, x, y, &text, color);
    }

    let rgb = DynamicImage::ImageRgba8(base).to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
        .encode_image(&rgb)
        .context("encode annotated image")?;

    Ok(AnnotatedImage {
        bytes,
        drawn,
        labelled,
    })
}

/// Footprint in pixels of a label rendered with the 8x8 font.
fn label_size(text: &str) -> (u32, u32) {
    (text.chars().count() as u32 * GLYPH_SIZE, GLYPH_SIZE)
}

fn glyph(c: char) -> [u8; 8] {
    BASIC_FONTS
        .get(c)
        .or_else(|| LATIN_FONTS.get(c))
        .or_else(|| BASIC_FONTS.get('?'))
        .unwrap_or([0; 8])
}

fn draw_label(img: &mut RgbaImage, x: u32, y: u32, text: &str, color: Rgba<u8>) {
    for (i, c) in text.chars().enumerate() {
        let gx = x + i as u32 * GLYPH_SIZE;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                if (*bits >> col) & 1 == 1 {
                    let (px, py) = (gx + col, y + row as u32);
                    if px < img.width() && py < img.height() {
                        img.put_pixel(px, py, color);
                    }
                }
            }
        }
    }
}

use crate::error::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma};
use qrcode::{Color, EcLevel, QrCode};
use std::io::Cursor;

const QUIET_ZONE: u32 = 4;
const DEFAULT_MODULE_PIXELS: u32 = 8;

#[derive(Debug, Clone, Copy, Default)]
pub enum ErrorCorrectionLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl From<ErrorCorrectionLevel> for EcLevel {
    fn from(level: ErrorCorrectionLevel) -> Self {
        match level {
            ErrorCorrectionLevel::Low => EcLevel::L,
            ErrorCorrectionLevel::Medium => EcLevel::M,
            ErrorCorrectionLevel::High => EcLevel::H,
        }
    }
}

/// Renders text payloads (peer configs) as PNG QR codes
#[derive(Debug, Clone)]
pub struct QrCodeGenerator {
    level: ErrorCorrectionLevel,
    module_pixels: u32,
}

impl Default for QrCodeGenerator {
    fn default() -> Self {
        Self {
            level: ErrorCorrectionLevel::Medium,
            module_pixels: DEFAULT_MODULE_PIXELS,
        }
    }
}

impl QrCodeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: ErrorCorrectionLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_module_pixels(mut self, pixels: u32) -> Self {
        self.module_pixels = pixels.max(1);
        self
    }

    fn render(&self, data: &str) -> Result<GrayImage> {
        let code = QrCode::with_error_correction_level(data, self.level.into())
            .map_err(|e| CryptoError::QrCodeError(e.to_string()))?;

        let width = code.width() as u32;
        let side = (width + 2 * QUIET_ZONE) * self.module_pixels;
        let mut img = GrayImage::from_pixel(side, side, Luma([255u8]));

        for (index, color) in code.to_colors().into_iter().enumerate() {
            if color != Color::Dark {
                continue;
            }
            let x0 = (index as u32 % width + QUIET_ZONE) * self.module_pixels;
            let y0 = (index as u32 / width + QUIET_ZONE) * self.module_pixels;
            for dy in 0..self.module_pixels {
                for dx in 0..self.module_pixels {
                    img.put_pixel(x0 + dx, y0 + dy, Luma([0u8]));
                }
            }
        }

        Ok(img)
    }

    /// PNG bytes of the QR code for `data`
    pub fn generate_png(&self, data: &str) -> Result<Vec<u8>> {
        let img = self.render(data)?;
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img).write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)?;
        Ok(buf)
    }

    /// `data:image/png;base64,...` URL suitable for an `<img src>`
    pub fn generate_data_url(&self, data: &str) -> Result<String> {
        let png = self.generate_png(data)?;
        Ok(format!("data:image/png;base64,{}", BASE64.encode(png)))
    }
}

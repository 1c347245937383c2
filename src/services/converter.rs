//! src/services/converter.rs
//!
//! Version specifications and the image conversion strategies computing them.
//!
//! A spec is a comma separated list of `key:value` parts:
//! - `size:WxH` bounding box, aspect ratio kept, never upscaled
//! - `min:WxH` minimum canvas, the image is centered on it
//! - `imageFormat:png|jpg` output format, `jpg` by default
//!
//! A bare `WxH` part is read as `size:WxH`.

use crate::services::storage_service::{StorageError, StorageResult};
use bytes::Bytes;
use image::{
    DynamicImage, ImageFormat, ImageReader, Rgba, RgbaImage, codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
};
use std::{fmt, io::Cursor, str::FromStr, sync::Arc};
use tokio::process::Command;
use tracing::{debug, warn};

const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Jpg,
    Png,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpg => "jpg",
            OutputFormat::Png => "png",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(OutputFormat::Jpg),
            "png" => Ok(OutputFormat::Png),
            other => Err(format!("unsupported image format `{other}`")),
        }
    }
}

/// A parsed version specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionSpec {
    pub size: Option<(u32, u32)>,
    pub min: Option<(u32, u32)>,
    pub format: OutputFormat,
}

impl FromStr for VersionSpec {
    type Err = String;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        if spec.trim().is_empty() {
            return Err("empty version specification".into());
        }

        let mut result = VersionSpec::default();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = part.split_once(':') else {
                result.size = Some(parse_dimensions(part)?);
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "size" => result.size = Some(parse_dimensions(value)?),
                "min" => result.min = Some(parse_dimensions(value)?),
                "imageformat" => result.format = value.parse()?,
                other => debug!(key = other, "ignoring unknown version spec part"),
            }
        }
        Ok(result)
    }
}

fn parse_dimensions(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got `{value}`"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| format!("invalid dimension `{v}` in `{value}`"))
    };
    Ok((parse(width)?, parse(height)?))
}

/// Dimensions an image of `image` size takes when fit into `requested`.
///
/// The image is only ever shrunk. When shrinking, the axis which is
/// relatively larger decides and the other follows the aspect ratio.
pub fn target_dimensions(image: (u32, u32), requested: (u32, u32)) -> (u32, u32) {
    let (image_width, image_height) = image;
    let (requested_width, requested_height) = requested;
    if requested_width >= image_width && requested_height >= image_height {
        return image;
    }

    let thumb_ratio = f64::from(requested_width) / f64::from(requested_height);
    let aspect_ratio = f64::from(image_width) / f64::from(image_height);
    let (width, height) = if thumb_ratio < aspect_ratio {
        (requested_width, (f64::from(requested_width) / aspect_ratio) as u32)
    } else {
        ((f64::from(requested_height) * aspect_ratio) as u32, requested_height)
    };
    (width.max(1), height.max(1))
}

/// Computes the bytes of a derived version from the original content.
#[async_trait::async_trait]
pub trait ImageConverter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Converts `source` (a file with the given extension) per `spec`.
    async fn convert(
        &self,
        source: Bytes,
        source_extension: &str,
        spec: &VersionSpec,
    ) -> StorageResult<Vec<u8>>;
}

/// Picks the conversion strategy once, based on whether a command is configured.
pub fn select_converter(
    command: Option<String>,
    extend_option: Option<String>,
) -> Arc<dyn ImageConverter> {
    match command.filter(|c| !c.trim().is_empty()) {
        Some(command) => Arc::new(CommandConverter::new(command, extend_option)),
        None => {
            warn!(
                "no image conversion command configured, using in-process conversion; \
                 an external tool is faster and supports more formats"
            );
            Arc::new(RasterConverter)
        }
    }
}

/// Converts in-process using the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterConverter;

impl RasterConverter {
    fn convert_blocking(source: &[u8], spec: &VersionSpec) -> StorageResult<Vec<u8>> {
        let image = image::load_from_memory(source)
            .map_err(|err| StorageError::Conversion(err.to_string()))?;

        let original = (image.width(), image.height());
        let (width, height) = spec
            .size
            .map(|requested| target_dimensions(original, requested))
            .unwrap_or(original);
        let scaled = if (width, height) == original {
            image.to_rgba8()
        } else {
            image.resize_exact(width, height, FilterType::Triangle).to_rgba8()
        };

        let (min_width, min_height) = spec.min.unwrap_or((0, 0));
        let canvas_width = width.max(min_width);
        let canvas_height = height.max(min_height);
        let x = i64::from((canvas_width - width) / 2);
        let y = i64::from((canvas_height - height) / 2);

        let mut output = Vec::new();
        match spec.format {
            OutputFormat::Png => {
                let mut canvas =
                    RgbaImage::from_pixel(canvas_width, canvas_height, Rgba([0, 0, 0, 0]));
                imageops::replace(&mut canvas, &scaled, x, y);
                DynamicImage::ImageRgba8(canvas)
                    .write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
                    .map_err(|err| StorageError::Conversion(err.to_string()))?;
            }
            OutputFormat::Jpg => {
                let mut canvas =
                    RgbaImage::from_pixel(canvas_width, canvas_height, Rgba([255, 255, 255, 255]));
                imageops::overlay(&mut canvas, &scaled, x, y);
                DynamicImage::ImageRgba8(canvas)
                    .to_rgb8()
                    .write_with_encoder(JpegEncoder::new_with_quality(&mut output, JPEG_QUALITY))
                    .map_err(|err| StorageError::Conversion(err.to_string()))?;
            }
        }
        Ok(output)
    }
}

#[async_trait::async_trait]
impl ImageConverter for RasterConverter {
    fn name(&self) -> &'static str {
        "raster"
    }

    async fn convert(
        &self,
        source: Bytes,
        _source_extension: &str,
        spec: &VersionSpec,
    ) -> StorageResult<Vec<u8>> {
        let spec = *spec;
        tokio::task::spawn_blocking(move || Self::convert_blocking(&source, &spec))
            .await
            .map_err(|err| StorageError::Conversion(format!("conversion task failed: {err}")))?
    }
}

/// Converts by running an external tool (typically ImageMagick).
///
/// The command template may use `${src}`, `${dest}`, `${width}`, `${height}`,
/// `${imageFormat}` and `${extend}`. The latter expands the extend option
/// template (using `${extendWidth}` and `${extendHeight}`) if a minimum
/// canvas is requested, and to nothing otherwise.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    command: String,
    extend_option: String,
}

impl CommandConverter {
    pub fn new(command: impl Into<String>, extend_option: Option<String>) -> Self {
        Self {
            command: command.into(),
            extend_option: extend_option.unwrap_or_default(),
        }
    }

    fn render(&self, src: &str, dest: &str, size: (u32, u32), spec: &VersionSpec) -> String {
        let extend = match spec.min {
            Some((width, height)) => self
                .extend_option
                .replace("${extendWidth}", &width.to_string())
                .replace("${extendHeight}", &height.to_string()),
            None => String::new(),
        };

        self.command
            .replace("${src}", src)
            .replace("${dest}", dest)
            .replace("${width}", &size.0.to_string())
            .replace("${height}", &size.1.to_string())
            .replace("${imageFormat}", spec.format.extension())
            .replace("${extend}", &extend)
    }
}

#[async_trait::async_trait]
impl ImageConverter for CommandConverter {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn convert(
        &self,
        source: Bytes,
        source_extension: &str,
        spec: &VersionSpec,
    ) -> StorageResult<Vec<u8>> {
        let size = match spec.size {
            Some(size) => size,
            None => ImageReader::new(Cursor::new(&source))
                .with_guessed_format()?
                .into_dimensions()
                .map_err(|err| StorageError::Conversion(err.to_string()))?,
        };

        let src = tempfile::Builder::new()
            .prefix("resize-in-")
            .suffix(&format!(".{source_extension}"))
            .tempfile()?;
        let dest = tempfile::Builder::new()
            .prefix("resize-out-")
            .suffix(&format!(".{}", spec.format))
            .tempfile()?;
        tokio::fs::write(src.path(), &source).await?;

        let command = self.render(
            &src.path().to_string_lossy(),
            &dest.path().to_string_lossy(),
            size,
            spec,
        );
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| StorageError::Conversion("conversion command is empty".into()))?;

        debug!(%command, "running conversion command");
        let output = Command::new(program).args(parts).output().await?;
        if !output.status.success() {
            return Err(StorageError::Conversion(format!(
                "`{command}` exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(tokio::fs::read(dest.path()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(width: u32, height: u32) -> Bytes {
        let image = RgbaImage::from_pixel(width, height, Rgba([200, 10, 10, 255]));
        let mut data = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();
        Bytes::from(data)
    }

    fn dimensions(data: &[u8]) -> (u32, u32) {
        let image = image::load_from_memory(data).unwrap();
        (image.width(), image.height())
    }

    #[test]
    fn parses_specs() {
        let spec: VersionSpec = "size:200x100,min:300x300,imageFormat:PNG".parse().unwrap();
        assert_eq!(spec.size, Some((200, 100)));
        assert_eq!(spec.min, Some((300, 300)));
        assert_eq!(spec.format, OutputFormat::Png);

        let bare: VersionSpec = "64x32".parse().unwrap();
        assert_eq!(bare.size, Some((64, 32)));
        assert_eq!(bare.format, OutputFormat::Jpg);

        let spaced: VersionSpec = " Size : 10 x 20 , foo:bar".parse().unwrap();
        assert_eq!(spaced.size, Some((10, 20)));
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!("".parse::<VersionSpec>().is_err());
        assert!("size:abc".parse::<VersionSpec>().is_err());
        assert!("size:0x10".parse::<VersionSpec>().is_err());
        assert!("imageFormat:gif".parse::<VersionSpec>().is_err());
        assert!("banana".parse::<VersionSpec>().is_err());
    }

    #[test]
    fn never_upscales() {
        assert_eq!(target_dimensions((100, 50), (200, 200)), (100, 50));
        assert_eq!(target_dimensions((100, 50), (100, 50)), (100, 50));
    }

    #[test]
    fn shrinks_keeping_aspect_ratio() {
        assert_eq!(target_dimensions((400, 200), (100, 100)), (100, 50));
        assert_eq!(target_dimensions((200, 400), (100, 100)), (50, 100));
        assert_eq!(target_dimensions((100, 50), (200, 40)), (80, 40));
        assert_eq!(target_dimensions((1000, 1), (10, 10)), (10, 1));
    }

    #[tokio::test]
    async fn raster_shrinks_into_png() {
        let spec: VersionSpec = "size:50x50,imageFormat:png".parse().unwrap();
        let output = RasterConverter.convert(png(200, 100), "png", &spec).await.unwrap();
        assert_eq!(image::guess_format(&output).unwrap(), ImageFormat::Png);
        assert_eq!(dimensions(&output), (50, 25));
    }

    #[tokio::test]
    async fn raster_pads_to_minimum_canvas() {
        let spec: VersionSpec = "size:50x50,min:80x60".parse().unwrap();
        let output = RasterConverter.convert(png(200, 100), "png", &spec).await.unwrap();
        assert_eq!(image::guess_format(&output).unwrap(), ImageFormat::Jpeg);
        assert_eq!(dimensions(&output), (80, 60));

        let padded = image::load_from_memory(&output).unwrap().to_rgb8();
        let corner = padded.get_pixel(0, 0);
        assert!(corner.0.iter().all(|c| *c > 240), "corner {corner:?} is not white");
    }

    #[tokio::test]
    async fn png_padding_is_transparent() {
        let spec: VersionSpec = "size:50x50,min:80x60,imageFormat:png".parse().unwrap();
        let output = RasterConverter.convert(png(200, 100), "png", &spec).await.unwrap();
        assert_eq!(image::guess_format(&output).unwrap(), ImageFormat::Png);
        assert_eq!(dimensions(&output), (80, 60));

        let padded = image::load_from_memory(&output).unwrap().to_rgba8();
        assert_eq!(padded.get_pixel(0, 0).0[3], 0);
        let center = padded.get_pixel(40, 30).0;
        assert_eq!(center[3], 255);
        assert!(center[0] > 190, "center {center:?} lost the image");
    }

    #[tokio::test]
    async fn raster_rejects_non_images() {
        let spec: VersionSpec = "size:10x10".parse().unwrap();
        let result = RasterConverter
            .convert(Bytes::from_static(b"not an image"), "png", &spec)
            .await;
        assert!(matches!(result, Err(StorageError::Conversion(_))));
    }

    #[test]
    fn renders_command_templates() {
        let converter = CommandConverter::new(
            "convert ${src} -resize ${width}x${height} ${extend} ${imageFormat}:${dest}",
            Some("-extent ${extendWidth}x${extendHeight}".into()),
        );
        let spec: VersionSpec = "size:10x20,min:30x40,imageFormat:png".parse().unwrap();
        assert_eq!(
            converter.render("/in.png", "/out.png", (10, 20), &spec),
            "convert /in.png -resize 10x20 -extent 30x40 png:/out.png"
        );

        let plain: VersionSpec = "size:10x20".parse().unwrap();
        assert_eq!(
            converter.render("/in.png", "/out.jpg", (10, 20), &plain),
            "convert /in.png -resize 10x20  jpg:/out.jpg"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_converter_runs_the_tool() {
        let converter = CommandConverter::new("cp ${src} ${dest}", None);
        let spec: VersionSpec = "size:10x10".parse().unwrap();
        let source = png(4, 4);
        let output = converter.convert(source.clone(), "png", &spec).await.unwrap();
        assert_eq!(output, source.to_vec());

        let failing = CommandConverter::new("false ${src}", None);
        assert!(matches!(
            failing.convert(source, "png", &spec).await,
            Err(StorageError::Conversion(_))
        ));
    }

    #[test]
    fn selects_strategy_by_configuration() {
        assert_eq!(select_converter(None, None).name(), "raster");
        assert_eq!(select_converter(Some("  ".into()), None).name(), "raster");
        assert_eq!(select_converter(Some("convert".into()), None).name(), "command");
    }
}

//! Windows OCR engine adapter
//!
//! Wraps the built-in Windows.Media.Ocr engine. The WinRT recognition
//! call is apartment-sensitive, so this adapter declares itself confined
//! and every call lands on the dispatcher's dedicated thread. Engines are
//! created per call; creation is cheap and keeps this type trivially
//! shareable.

use image::{DynamicImage, GenericImageView};
use tracing::{debug, warn};
use windows::core::HSTRING;
use windows::Foundation::IAsyncOperation;
use windows::Globalization::Language;
use windows::Graphics::Imaging::{BitmapPixelFormat, SoftwareBitmap};
use windows::Media::Ocr::{OcrEngine, OcrResult};
use windows::Storage::Streams::{DataReader, DataWriter, InMemoryRandomAccessStream};

use crate::error::BackendError;
use crate::geometry::Quad;
use crate::protocol::{RecognitionState, TextBlock, TextLine};
use crate::vision::crop::crop_quad;

use super::{RecognitionBackend, Scheduling};

pub const NATIVE_ENGINE: &str = "native";

/// OCR engine backed by the operating system's recognizer.
pub struct NativeBackend {
    default_language: String,
}

impl NativeBackend {
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            default_language: default_language.into(),
        }
    }

    fn engine_for(&self, language: Option<&str>) -> Result<OcrEngine, BackendError> {
        let tag = language.unwrap_or(&self.default_language);
        let lang = Language::CreateLanguage(&HSTRING::from(tag))
            .map_err(|err| win_err("creating language", err))?;
        let supported = OcrEngine::IsLanguageSupported(&lang)
            .map_err(|err| win_err("checking language support", err))?;
        if supported {
            return OcrEngine::TryCreateFromLanguage(&lang)
                .map_err(|err| win_err("creating engine", err));
        }
        warn!(
            language = tag,
            "language pack not installed, using the user profile languages"
        );
        OcrEngine::TryCreateFromUserProfileLanguages()
            .map_err(|err| win_err("creating fallback engine", err))
    }

    /// Runs the engine over the whole image and returns recognized lines
    /// with their boxes already in canonical pixel space. Images over the
    /// engine's dimension limit are downscaled first and the boxes scaled
    /// back.
    fn recognize_lines(
        &self,
        image: &DynamicImage,
        language: Option<&str>,
    ) -> Result<Vec<(String, Quad)>, BackendError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let engine = self.engine_for(language)?;
        let max_dim =
            OcrEngine::MaxImageDimension().map_err(|err| win_err("querying size limit", err))?;
        let scale = (max_dim as f32 / width.max(height) as f32).min(1.0);
        let working = if scale < 1.0 {
            let w = ((width as f32 * scale).floor() as u32).max(1);
            let h = ((height as f32 * scale).floor() as u32).max(1);
            debug!(width, height, to_width = w, to_height = h, "downscaling for the engine's size limit");
            image.resize_exact(w, h, image::imageops::FilterType::Triangle)
        } else {
            image.clone()
        };

        let rgba = working.to_rgba8();
        let (w, h) = rgba.dimensions();
        let mut bgra = rgba.into_raw();
        for pixel in bgra.chunks_exact_mut(4) {
            pixel.swap(0, 2);
        }
        let bitmap = software_bitmap(&bgra, w, h)?;
        let pending: IAsyncOperation<OcrResult> = engine
            .RecognizeAsync(&bitmap)
            .map_err(|err| win_err("starting recognition", err))?;
        let result = pending
            .get()
            .map_err(|err| win_err("running recognition", err))?;
        extract_lines(&result, 1.0 / scale)
    }
}

impl RecognitionBackend for NativeBackend {
    fn name(&self) -> &'static str {
        NATIVE_ENGINE
    }

    fn scheduling(&self) -> Scheduling {
        Scheduling::Confined
    }

    fn warm_up(&self) -> Result<(), BackendError> {
        self.engine_for(None).map(|_| ())
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<TextBlock>, BackendError> {
        // The engine has no detect-only mode; run it and keep the geometry.
        let lines = self.recognize_lines(image, None)?;
        Ok(lines
            .into_iter()
            .enumerate()
            .map(|(index, (_, quad))| TextBlock {
                id: index as u32,
                quad,
                lines: vec![TextLine::detected(quad)],
                state: RecognitionState::Detected,
                is_vertical: false,
                score: 1.0,
            })
            .collect())
    }

    fn recognize(
        &self,
        image: &DynamicImage,
        regions: &[Quad],
        language: Option<&str>,
    ) -> Result<Vec<TextBlock>, BackendError> {
        if regions.is_empty() {
            let lines = self.recognize_lines(image, language)?;
            return Ok(lines
                .into_iter()
                .enumerate()
                .map(|(index, (content, quad))| TextBlock {
                    id: index as u32,
                    quad,
                    lines: vec![TextLine { quad, content }],
                    state: RecognitionState::Recognized,
                    is_vertical: false,
                    score: 1.0,
                })
                .collect());
        }

        let mut blocks = Vec::with_capacity(regions.len());
        for (index, region) in regions.iter().enumerate() {
            let content = match crop_quad(image, region) {
                Some(cropped) => {
                    let lines = self.recognize_lines(&cropped, language)?;
                    let texts: Vec<String> = lines
                        .into_iter()
                        .map(|(text, _)| text)
                        .filter(|text| !text.is_empty())
                        .collect();
                    texts.join(" ")
                }
                None => String::new(),
            };
            blocks.push(TextBlock {
                id: index as u32,
                quad: *region,
                lines: vec![TextLine {
                    quad: *region,
                    content,
                }],
                state: RecognitionState::Recognized,
                is_vertical: false,
                score: 1.0,
            });
        }
        Ok(blocks)
    }

    fn supported_languages(&self) -> Result<Vec<String>, BackendError> {
        let available = OcrEngine::AvailableRecognizerLanguages()
            .map_err(|err| win_err("listing languages", err))?;
        let count = available
            .Size()
            .map_err(|err| win_err("listing languages", err))?;
        let mut tags = Vec::with_capacity(count as usize);
        for index in 0..count {
            if let Ok(language) = available.GetAt(index) {
                if let Ok(tag) = language.LanguageTag() {
                    tags.push(tag.to_string());
                }
            }
        }
        Ok(tags)
    }
}

fn win_err(context: &str, err: windows::core::Error) -> BackendError {
    BackendError::native(format!("{context}: {err}"))
}

/// Builds a BGRA8 SoftwareBitmap by staging the pixels through an
/// in-memory stream; CopyFromBuffer needs a WinRT buffer, not a slice.
fn software_bitmap(bgra: &[u8], width: u32, height: u32) -> Result<SoftwareBitmap, BackendError> {
    let stream =
        InMemoryRandomAccessStream::new().map_err(|err| win_err("creating stream", err))?;
    let writer =
        DataWriter::CreateDataWriter(&stream).map_err(|err| win_err("creating writer", err))?;
    writer
        .WriteBytes(bgra)
        .map_err(|err| win_err("writing pixels", err))?;
    writer
        .StoreAsync()
        .map_err(|err| win_err("storing pixels", err))?
        .get()
        .map_err(|err| win_err("storing pixels", err))?;
    writer
        .FlushAsync()
        .map_err(|err| win_err("flushing pixels", err))?
        .get()
        .map_err(|err| win_err("flushing pixels", err))?;
    stream
        .Seek(0)
        .map_err(|err| win_err("rewinding stream", err))?;

    let bitmap = SoftwareBitmap::Create(BitmapPixelFormat::Bgra8, width as i32, height as i32)
        .map_err(|err| win_err("creating bitmap", err))?;
    let input = stream
        .GetInputStreamAt(0)
        .map_err(|err| win_err("reading stream", err))?;
    let reader =
        DataReader::CreateDataReader(&input).map_err(|err| win_err("creating reader", err))?;
    reader
        .LoadAsync(bgra.len() as u32)
        .map_err(|err| win_err("loading pixels", err))?
        .get()
        .map_err(|err| win_err("loading pixels", err))?;
    let buffer = reader
        .ReadBuffer(bgra.len() as u32)
        .map_err(|err| win_err("reading buffer", err))?;
    bitmap
        .CopyFromBuffer(&buffer)
        .map_err(|err| win_err("filling bitmap", err))?;
    Ok(bitmap)
}

/// One entry per OCR line: its text and the union of its word boxes,
/// scaled back to the original image when a downscale happened.
fn extract_lines(result: &OcrResult, inverse_scale: f32) -> Result<Vec<(String, Quad)>, BackendError> {
    let lines = result
        .Lines()
        .map_err(|err| win_err("reading lines", err))?;
    let count = lines.Size().map_err(|err| win_err("reading lines", err))?;
    let mut extracted = Vec::with_capacity(count as usize);
    for index in 0..count {
        let line = lines
            .GetAt(index)
            .map_err(|err| win_err("reading line", err))?;
        let text = line
            .Text()
            .map_err(|err| win_err("reading line text", err))?
            .to_string();
        let words = line
            .Words()
            .map_err(|err| win_err("reading words", err))?;
        let word_count = words.Size().map_err(|err| win_err("reading words", err))?;
        let mut bounds: Option<(f32, f32, f32, f32)> = None;
        for word_index in 0..word_count {
            let word = words
                .GetAt(word_index)
                .map_err(|err| win_err("reading word", err))?;
            let rect = word
                .BoundingRect()
                .map_err(|err| win_err("reading word bounds", err))?;
            let (x0, y0, x1, y1) = (rect.X, rect.Y, rect.X + rect.Width, rect.Y + rect.Height);
            bounds = Some(match bounds {
                None => (x0, y0, x1, y1),
                Some((bx0, by0, bx1, by1)) => {
                    (bx0.min(x0), by0.min(y0), bx1.max(x1), by1.max(y1))
                }
            });
        }
        let Some((x0, y0, x1, y1)) = bounds else {
            continue;
        };
        let quad = Quad::from_rect(
            (x0 * inverse_scale).round() as i32,
            (y0 * inverse_scale).round() as i32,
            ((x1 - x0) * inverse_scale).round() as i32,
            ((y1 - y0) * inverse_scale).round() as i32,
        );
        extracted.push((text, quad));
    }
    Ok(extracted)
}

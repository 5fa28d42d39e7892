//! ONNX text detection and recognition
//!
//! The neural engine pairs a DB-style detection model with a CTC
//! recognition model, both run through ONNX Runtime. Model files resolve
//! through [`models::ModelManager`]; sessions initialize lazily on first
//! use so startup stays cheap when another engine serves the traffic.

pub mod models;

use std::collections::HashMap;
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::BackendError;
use crate::geometry::{canonicalize, Quad, RawQuad, ReadingDirection, SourceSpace, VerticalOrigin};
use crate::protocol::{ModelDescriptor, RecognitionState, TextBlock, TextLine};
use crate::vision::crop::crop_quad;

use super::{RecognitionBackend, Scheduling};
use models::ModelManager;

pub const NEURAL_ENGINE: &str = "neural";

/// Long-side cap for the detection input, rounded to multiples of 32 as
/// the DB architecture requires.
const DET_TARGET: u32 = 960;
const DET_THRESHOLD: f32 = 0.3;
/// Probability-map components smaller than this are noise.
const MIN_COMPONENT_AREA: u32 = 16;
/// DB shrinks text regions during training; grow each box back by this
/// fraction of its height before cropping.
const BOX_PAD_RATIO: f32 = 0.3;
const REC_HEIGHT: u32 = 48;
const REC_MAX_WIDTH: u32 = 640;
/// Boxes taller than this ratio of their width hold vertical text.
const VERTICAL_ASPECT: f32 = 1.5;

struct OnnxModel {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxModel {
    fn load(path: &Path) -> Result<Self, BackendError> {
        info!(path = %path.display(), "loading ONNX model");
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| BackendError::Inference("model declares no inputs".to_string()))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| BackendError::Inference("model declares no outputs".to_string()))?;
        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }

    /// Runs one NCHW float tensor through the model and copies the first
    /// output out as `(dims, data)`.
    fn run(&mut self, tensor: Array4<f32>) -> Result<(Vec<usize>, Vec<f32>), BackendError> {
        let shape = tensor.shape().to_vec();
        let (data, _) = tensor.into_raw_vec_and_offset();
        let value = Value::from_array(([shape[0], shape[1], shape[2], shape[3]], data))?;
        let outputs = self.session.run(ort::inputs![self.input_name.as_str() => value])?;
        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            BackendError::Inference(format!("model output '{}' missing", self.output_name))
        })?;
        let (dims, data) = output.try_extract_tensor::<f32>()?;
        Ok((dims.iter().map(|&d| d as usize).collect(), data.to_vec()))
    }
}

struct Loaded {
    detector: OnnxModel,
    recognizer: OnnxModel,
    vocab: Vec<String>,
}

/// OCR engine backed by PaddleOCR-family ONNX models.
pub struct NeuralBackend {
    manager: ModelManager,
    loaded: Mutex<Option<Loaded>>,
}

impl NeuralBackend {
    pub fn new(manager: ModelManager) -> Self {
        Self {
            manager,
            loaded: Mutex::new(None),
        }
    }

    fn with_loaded<T>(
        &self,
        op: impl FnOnce(&mut Loaded) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut slot = self.loaded.lock();
        match &mut *slot {
            Some(loaded) => op(loaded),
            None => {
                let mut fresh = self.load()?;
                let result = op(&mut fresh);
                *slot = Some(fresh);
                result
            }
        }
    }

    fn load(&self) -> Result<Loaded, BackendError> {
        let det_path = self
            .manager
            .ensure(&models::DETECTION)
            .map_err(|err| BackendError::ModelUnavailable(format!("{err:#}")))?;
        let rec_path = self
            .manager
            .ensure(&models::RECOGNITION)
            .map_err(|err| BackendError::ModelUnavailable(format!("{err:#}")))?;
        let dict_path = self
            .manager
            .ensure(&models::DICTIONARY)
            .map_err(|err| BackendError::ModelUnavailable(format!("{err:#}")))?;
        Ok(Loaded {
            detector: OnnxModel::load(&det_path)?,
            recognizer: OnnxModel::load(&rec_path)?,
            vocab: load_vocab(&dict_path)?,
        })
    }
}

impl RecognitionBackend for NeuralBackend {
    fn name(&self) -> &'static str {
        NEURAL_ENGINE
    }

    fn scheduling(&self) -> Scheduling {
        Scheduling::PoolSafe
    }

    fn warm_up(&self) -> Result<(), BackendError> {
        self.with_loaded(|_| Ok(()))
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<TextBlock>, BackendError> {
        self.with_loaded(|loaded| detect_blocks(&mut loaded.detector, image))
    }

    fn recognize(
        &self,
        image: &DynamicImage,
        regions: &[Quad],
        language: Option<&str>,
    ) -> Result<Vec<TextBlock>, BackendError> {
        if let Some(code) = language {
            if !self.manager.languages().iter().any(|known| known == code) {
                debug!(language = code, "no dedicated model for language, using default");
            }
        }
        self.with_loaded(|loaded| {
            let mut blocks = if regions.is_empty() {
                detect_blocks(&mut loaded.detector, image)?
            } else {
                regions
                    .iter()
                    .enumerate()
                    .map(|(index, quad)| {
                        let (_, _, w, h) = quad.bounding_rect();
                        TextBlock {
                            id: index as u32,
                            quad: *quad,
                            lines: vec![TextLine::detected(*quad)],
                            state: RecognitionState::Detected,
                            is_vertical: h as f32 > w as f32 * VERTICAL_ASPECT,
                            score: 1.0,
                        }
                    })
                    .collect()
            };

            for block in &mut blocks {
                let mut confidences = Vec::with_capacity(block.lines.len());
                for line in &mut block.lines {
                    let Some(strip) = crop_quad(image, &line.quad) else {
                        continue;
                    };
                    let (text, confidence) = recognize_strip(
                        &mut loaded.recognizer,
                        &loaded.vocab,
                        &strip,
                        block.is_vertical,
                    )?;
                    line.content = text;
                    confidences.push(confidence);
                }
                if !confidences.is_empty() {
                    block.score = confidences.iter().sum::<f32>() / confidences.len() as f32;
                }
                block.state = RecognitionState::Recognized;
            }
            Ok(blocks)
        })
    }

    fn supported_languages(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.manager.languages())
    }

    fn supported_models(&self) -> Vec<ModelDescriptor> {
        self.manager.descriptors()
    }

    fn install_model(&self, name: &str) -> Result<bool, BackendError> {
        let Some(spec) = models::spec_by_name(name) else {
            return Ok(false);
        };
        self.manager
            .ensure(spec)
            .map_err(|err| BackendError::ModelUnavailable(format!("{err:#}")))?;
        Ok(true)
    }
}

/// Detection input dimensions: long side capped at [`DET_TARGET`], both
/// sides rounded to the nearest multiple of 32, never upscaled.
fn det_input_dims(width: u32, height: u32) -> (u32, u32) {
    let scale = (DET_TARGET as f32 / width.max(height).max(1) as f32).min(1.0);
    let round32 = |side: u32| ((side as f32 * scale / 32.0).round() as u32).max(1) * 32;
    (round32(width), round32(height))
}

fn to_tensor(rgb: &RgbImage) -> Array4<f32> {
    let (w, h) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] =
                (pixel.0[channel] as f32 / 255.0 - 0.5) / 0.5;
        }
    }
    tensor
}

#[derive(Debug)]
struct Component {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u32,
    prob_sum: f32,
}

impl Component {
    fn new(x: u32, y: u32, prob: f32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            area: 1,
            prob_sum: prob,
        }
    }

    fn absorb(&mut self, x: u32, y: u32, prob: f32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.area += 1;
        self.prob_sum += prob;
    }
}

fn detect_blocks(
    detector: &mut OnnxModel,
    image: &DynamicImage,
) -> Result<Vec<TextBlock>, BackendError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Ok(Vec::new());
    }
    let (tw, th) = det_input_dims(width, height);
    let resized = image.resize_exact(tw, th, FilterType::Triangle).to_rgb8();
    let (dims, data) = detector.run(to_tensor(&resized))?;
    let (map_h, map_w) = match dims.as_slice() {
        [1, 1, h, w] => (*h, *w),
        other => {
            return Err(BackendError::Inference(format!(
                "unexpected detection output shape {other:?}"
            )))
        }
    };

    let mut mask = GrayImage::new(map_w as u32, map_h as u32);
    for y in 0..map_h {
        for x in 0..map_w {
            if data[y * map_w + x] > DET_THRESHOLD {
                mask.put_pixel(x as u32, y as u32, Luma([255u8]));
            }
        }
    }

    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
    let mut components: HashMap<u32, Component> = HashMap::new();
    for y in 0..map_h as u32 {
        for x in 0..map_w as u32 {
            let label = labels.get_pixel(x, y).0[0];
            if label == 0 {
                continue;
            }
            let prob = data[y as usize * map_w + x as usize];
            components
                .entry(label)
                .and_modify(|component| component.absorb(x, y, prob))
                .or_insert_with(|| Component::new(x, y, prob));
        }
    }

    let mut found: Vec<Component> = components
        .into_values()
        .filter(|component| component.area >= MIN_COMPONENT_AREA)
        .collect();
    found.sort_by_key(|component| (component.min_y, component.min_x));

    let map_space = SourceSpace {
        normalized: true,
        vertical_origin: VerticalOrigin::TopDown,
    };
    let blocks = found
        .iter()
        .enumerate()
        .map(|(index, component)| {
            let pad = ((component.max_y - component.min_y + 1) as f32 * BOX_PAD_RATIO).max(1.0);
            let raw = RawQuad::axis_aligned(
                (component.min_x as f32 - pad).max(0.0) / map_w as f32,
                (component.min_y as f32 - pad).max(0.0) / map_h as f32,
                ((component.max_x + 1) as f32 + pad).min(map_w as f32) / map_w as f32,
                ((component.max_y + 1) as f32 + pad).min(map_h as f32) / map_h as f32,
            );
            let quad = canonicalize(&raw, map_space, width, height, ReadingDirection::Standard);
            let (_, _, w, h) = quad.bounding_rect();
            TextBlock {
                id: index as u32,
                quad,
                lines: vec![TextLine::detected(quad)],
                state: RecognitionState::Detected,
                is_vertical: h as f32 > w as f32 * VERTICAL_ASPECT,
                score: component.prob_sum / component.area as f32,
            }
        })
        .collect();
    Ok(blocks)
}

fn recognize_strip(
    recognizer: &mut OnnxModel,
    vocab: &[String],
    strip: &DynamicImage,
    vertical: bool,
) -> Result<(String, f32), BackendError> {
    let upright = if vertical { strip.rotate270() } else { strip.clone() };
    let (w, h) = upright.dimensions();
    if w == 0 || h == 0 {
        return Ok((String::new(), 0.0));
    }
    let scaled_w =
        ((w as f32 * REC_HEIGHT as f32 / h as f32).round() as u32).clamp(16, REC_MAX_WIDTH);
    let resized = upright
        .resize_exact(scaled_w, REC_HEIGHT, FilterType::Triangle)
        .to_rgb8();
    let (dims, data) = recognizer.run(to_tensor(&resized))?;
    let (steps, classes) = match dims.as_slice() {
        [1, steps, classes] => (*steps, *classes),
        [steps, classes] => (*steps, *classes),
        other => {
            return Err(BackendError::Inference(format!(
                "unexpected recognition output shape {other:?}"
            )))
        }
    };
    Ok(ctc_decode(&data, steps, classes, vocab))
}

/// Greedy CTC decode: argmax per timestep, collapse repeats, drop the
/// blank class at index 0. Classes above the vocabulary are ignored.
fn ctc_decode(probs: &[f32], steps: usize, classes: usize, vocab: &[String]) -> (String, f32) {
    let mut text = String::new();
    let mut picked = Vec::new();
    let mut previous = 0usize;
    for step in 0..steps {
        let row = &probs[step * classes..(step + 1) * classes];
        let (best, prob) = argmax(row);
        if best != 0 && best != previous {
            if let Some(entry) = vocab.get(best - 1) {
                text.push_str(entry);
                picked.push(prob);
            }
        }
        previous = best;
    }
    let confidence = if picked.is_empty() {
        0.0
    } else {
        picked.iter().sum::<f32>() / picked.len() as f32
    };
    (text, confidence)
}

fn argmax(row: &[f32]) -> (usize, f32) {
    let mut best = 0usize;
    let mut value = f32::MIN;
    for (index, &prob) in row.iter().enumerate() {
        if prob > value {
            best = index;
            value = prob;
        }
    }
    (best, value)
}

fn load_vocab(path: &Path) -> Result<Vec<String>, BackendError> {
    let raw = std::fs::read_to_string(path)?;
    let mut vocab: Vec<String> = raw
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect();
    while vocab.last().is_some_and(|entry| entry.is_empty()) {
        vocab.pop();
    }
    // Dictionaries ship without the space class; it decodes as the last index.
    vocab.push(" ".to_string());
    Ok(vocab)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_dims_are_multiples_of_32_and_capped() {
        assert_eq!(det_input_dims(1920, 1080), (960, 544));
        assert_eq!(det_input_dims(100, 200), (96, 192));
        assert_eq!(det_input_dims(20, 10), (32, 32));
        let (w, h) = det_input_dims(1333, 777);
        assert_eq!(w % 32, 0);
        assert_eq!(h % 32, 0);
        assert!(w <= 960 && h <= 960);
    }

    #[test]
    fn ctc_collapses_repeats_and_skips_blanks() {
        let vocab = vec!["a".to_string(), "b".to_string()];
        // Rows are [blank, a, b]; "a a blank a b" decodes to "aab".
        let probs = [
            [0.0, 0.9, 0.0],
            [0.0, 0.8, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 0.7, 0.0],
            [0.0, 0.0, 0.6],
        ]
        .concat();
        let (text, confidence) = ctc_decode(&probs, 5, 3, &vocab);
        assert_eq!(text, "aab");
        assert!((confidence - (0.9 + 0.7 + 0.6) / 3.0).abs() < 1e-6);
    }

    #[test]
    fn ctc_ignores_classes_beyond_the_vocabulary() {
        let vocab = vec!["a".to_string()];
        let probs = vec![0.0, 0.0, 0.9];
        let (text, confidence) = ctc_decode(&probs, 1, 3, &vocab);
        assert!(text.is_empty());
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn vocab_gains_a_trailing_space_class() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dict.txt");
        std::fs::write(&path, "a\nb\n\n").unwrap();
        let vocab = load_vocab(&path).unwrap();
        assert_eq!(vocab, vec!["a".to_string(), "b".to_string(), " ".to_string()]);
    }

    #[test]
    fn tensor_normalization_is_centered() {
        let mut rgb = RgbImage::new(2, 1);
        rgb.put_pixel(0, 0, image::Rgb([0, 128, 255]));
        rgb.put_pixel(1, 0, image::Rgb([255, 255, 255]));
        let tensor = to_tensor(&rgb);
        assert_eq!(tensor.shape(), &[1, 3, 1, 2]);
        assert!((tensor[[0, 0, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] - 0.003_921_6).abs() < 1e-4);
    }
}

//! Scripted in-memory engine
//!
//! Answers from a preset script and counts its calls. Tests drive it to
//! exercise the dispatcher and session machinery without model files, and
//! development runs can register it to check wiring end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::{DynamicImage, GenericImageView};

use crate::error::BackendError;
use crate::geometry::Quad;
use crate::protocol::{RecognitionState, TextBlock, TextLine};

use super::{RecognitionBackend, Scheduling};

pub const STUB_ENGINE: &str = "stub";

pub struct StubBackend {
    name: &'static str,
    scheduling: Scheduling,
    blocks: Vec<TextBlock>,
    text: String,
    languages: Vec<String>,
    delay: Duration,
    fail: bool,
    detect_calls: AtomicUsize,
    recognize_calls: AtomicUsize,
}

impl StubBackend {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            scheduling: Scheduling::PoolSafe,
            blocks: Vec::new(),
            text: "stub text".to_string(),
            languages: vec!["en".to_string()],
            delay: Duration::ZERO,
            fail: false,
            detect_calls: AtomicUsize::new(0),
            recognize_calls: AtomicUsize::new(0),
        }
    }

    /// Blocks returned by every `detect` call, in the detected state.
    pub fn with_blocks(mut self, blocks: Vec<TextBlock>) -> Self {
        self.blocks = blocks;
        self
    }

    /// Content assigned by every `recognize` call.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_scheduling(mut self, scheduling: Scheduling) -> Self {
        self.scheduling = scheduling;
        self
    }

    /// Sleep inserted into every detect/recognize call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every detect/recognize call fails with an inference error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn detect_count(&self) -> usize {
        self.detect_calls.load(Ordering::Relaxed)
    }

    pub fn recognize_count(&self) -> usize {
        self.recognize_calls.load(Ordering::Relaxed)
    }

    /// A one-line detected block covering the given rectangle. Test data
    /// helper used throughout the crate.
    pub fn block(id: u32, x: i32, y: i32, w: i32, h: i32) -> TextBlock {
        let quad = Quad::from_rect(x, y, w, h);
        TextBlock {
            id,
            quad,
            lines: vec![TextLine::detected(quad)],
            state: RecognitionState::Detected,
            is_vertical: false,
            score: 1.0,
        }
    }

    fn pause_and_check(&self) -> Result<(), BackendError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail {
            return Err(BackendError::Inference("scripted failure".to_string()));
        }
        Ok(())
    }

    fn recognized(&self, quad: Quad, id: u32) -> TextBlock {
        TextBlock {
            id,
            quad,
            lines: vec![TextLine {
                quad,
                content: self.text.clone(),
            }],
            state: RecognitionState::Recognized,
            is_vertical: false,
            score: 1.0,
        }
    }
}

impl RecognitionBackend for StubBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn scheduling(&self) -> Scheduling {
        self.scheduling
    }

    fn detect(&self, _image: &DynamicImage) -> Result<Vec<TextBlock>, BackendError> {
        self.detect_calls.fetch_add(1, Ordering::Relaxed);
        self.pause_and_check()?;
        Ok(self.blocks.clone())
    }

    fn recognize(
        &self,
        image: &DynamicImage,
        regions: &[Quad],
        _language: Option<&str>,
    ) -> Result<Vec<TextBlock>, BackendError> {
        self.recognize_calls.fetch_add(1, Ordering::Relaxed);
        self.pause_and_check()?;
        if regions.is_empty() {
            let quad = Quad::from_rect(0, 0, image.width() as i32, image.height() as i32);
            return Ok(vec![self.recognized(quad, 0)]);
        }
        Ok(regions
            .iter()
            .enumerate()
            .map(|(i, quad)| self.recognized(*quad, i as u32))
            .collect())
    }

    fn supported_languages(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.languages.clone())
    }
}

//! Wire-facing data model
//!
//! The shapes every recognition call answers with, shared by the backends,
//! the session cache, and the server. All of it serializes with snake_case
//! names so the wire stays stable across refactors.

use serde::{Deserialize, Serialize};

use crate::geometry::Quad;

/// Recognition progress of a single text block.
///
/// Moves in one direction only: once a block is `Recognized` it never goes
/// back, and recognition never runs for it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionState {
    #[default]
    Detected,
    Recognized,
}

/// One line of text inside a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub quad: Quad,
    /// Empty until the line has been recognized.
    #[serde(default)]
    pub content: String,
}

impl TextLine {
    pub fn detected(quad: Quad) -> Self {
        Self {
            quad,
            content: String::new(),
        }
    }
}

/// A detected region of text, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// Unique within one response; assigned sequentially at detection time.
    pub id: u32,
    pub quad: Quad,
    pub lines: Vec<TextLine>,
    pub state: RecognitionState,
    pub is_vertical: bool,
    /// Detector confidence in `[0, 1]`.
    pub score: f32,
}

/// Dimensions of the source image a response's coordinates refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextResolution {
    pub width: u32,
    pub height: u32,
}

/// The uniform answer shape for every recognition call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResponse {
    pub id: String,
    pub context_resolution: ContextResolution,
    pub results: Vec<TextBlock>,
}

impl RecognitionResponse {
    /// Well-formed response carrying no results. What callers get when a
    /// backend fails instead of an error.
    pub fn empty(id: impl Into<String>, context_resolution: ContextResolution) -> Self {
        Self {
            id: id.into(),
            context_resolution,
            results: Vec::new(),
        }
    }
}

/// An installable (or installed) model advertised by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub language_codes: Vec<String>,
    pub is_installed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Quad;

    #[test]
    fn response_serializes_with_snake_case_fields() {
        let response = RecognitionResponse {
            id: "ctx-1".to_string(),
            context_resolution: ContextResolution {
                width: 100,
                height: 200,
            },
            results: vec![TextBlock {
                id: 0,
                quad: Quad::from_rect(10, 140, 40, 40),
                lines: vec![TextLine::detected(Quad::from_rect(10, 140, 40, 40))],
                state: RecognitionState::Detected,
                is_vertical: false,
                score: 0.9,
            }],
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["context_resolution"]["width"], 100);
        assert_eq!(json["results"][0]["state"], "detected");
        assert_eq!(json["results"][0]["quad"]["top_left"]["x"], 10);
        assert_eq!(json["results"][0]["lines"][0]["content"], "");
    }

    #[test]
    fn line_content_defaults_when_absent() {
        let line: TextLine = serde_json::from_str(
            r#"{"quad":{"top_left":{"x":0,"y":0},"top_right":{"x":1,"y":0},
                "bottom_right":{"x":1,"y":1},"bottom_left":{"x":0,"y":1}}}"#,
        )
        .unwrap();
        assert!(line.content.is_empty());
    }
}

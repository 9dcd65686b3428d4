use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rig::completion::Message;
use rig::message::{ImageMediaType, Text, UserContent};
use rig::OneOrMany;

/// Instruction given to the neocortex. It carries no memory snapshot and no tools.
pub const NEOCORTEX_INSTRUCTION: &str =
    "You are the Neocortex, a powerful reasoning engine. Assist the Cortex with complex tasks.";

/// Render the cortex instruction around a point-in-time memory snapshot.
///
/// The result is frozen into the agent at construction; later memory writes
/// only reach the cortex through its tools.
pub fn render_cortex_instruction(memory: &str, memory_tool: &str, neocortex_tool: &str) -> String {
    format!(
        r#"You are the Cortex, a proactive Small Language Model operating an OS.

[SYSTEM STATE / MEMORY]
{memory}

Your Goal:
1. Observe the user's context (screenshots/text provided in input).
2. Maintain the 'Short Term Memory' above using `{memory_tool}`.
3. If a complex task arises, summon the Neocortex using `{neocortex_tool}`."#
    )
}

/// A base64-encoded image attached to an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub media_type: String,
    pub data: String,
}

impl ImageData {
    pub fn from_bytes(media_type: &str, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.to_string(),
            data: general_purpose::STANDARD.encode(bytes),
        }
    }

    fn rig_media_type(&self) -> Option<ImageMediaType> {
        match self.media_type.as_str() {
            "image/jpeg" | "image/jpg" => Some(ImageMediaType::JPEG),
            "image/png" => Some(ImageMediaType::PNG),
            "image/gif" => Some(ImageMediaType::GIF),
            "image/webp" => Some(ImageMediaType::WEBP),
            _ => None,
        }
    }
}

/// One observation from the context stream, consumed by exactly one tick.
#[derive(Debug, Clone)]
pub struct ContextItem {
    pub text: Option<String>,
    pub images: Vec<ImageData>,
    pub captured_at: DateTime<Utc>,
}

impl ContextItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            images: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    pub fn image(media_type: &str, bytes: &[u8]) -> Self {
        Self {
            text: None,
            images: vec![ImageData::from_bytes(media_type, bytes)],
            captured_at: Utc::now(),
        }
    }

    /// Attach a caption (or replace the existing one).
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.text.as_deref().map_or(true, |t| t.trim().is_empty())
    }

    /// Text kept in session history. Images are replaced by placeholders so
    /// replayed history stays small.
    pub fn history_text(&self) -> String {
        let mut parts: Vec<String> = self
            .images
            .iter()
            .map(|img| format!("[image: {}]", img.media_type))
            .collect();
        if let Some(text) = self.text.as_deref().filter(|t| !t.is_empty()) {
            parts.push(text.to_string());
        }
        if parts.is_empty() {
            "[empty observation]".to_string()
        } else {
            parts.join("\n")
        }
    }

    /// Build the user message submitted to the model for this observation.
    pub fn to_message(&self) -> Message {
        let mut parts: Vec<UserContent> = Vec::new();
        for img in &self.images {
            match img.rig_media_type() {
                Some(media_type) => parts.push(UserContent::image_base64(
                    img.data.clone(),
                    Some(media_type),
                    None,
                )),
                None => tracing::warn!("Dropping image with unsupported type {}", img.media_type),
            }
        }

        let text = self.text.clone().unwrap_or_default();
        if !text.is_empty() || parts.is_empty() {
            parts.push(UserContent::Text(Text {
                text: if text.is_empty() {
                    "[empty observation]".to_string()
                } else {
                    text
                },
            }));
        }

        Message::User {
            content: OneOrMany::many(parts).unwrap_or_else(|_| {
                OneOrMany::one(UserContent::Text(Text {
                    text: "[empty observation]".to_string(),
                }))
            }),
        }
    }
}

impl From<&str> for ContextItem {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for ContextItem {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

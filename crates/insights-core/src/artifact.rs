//! Tokens flowing from a run to the consumer.
//!
//! Text fragments are passed through as-is. Binary artifacts (images produced
//! by the code interpreter) travel as [`Token::Image`] and render to an inline
//! markdown image with a base64 data URI, which display surfaces recognize by
//! the [`IMAGE_TOKEN_PREFIX`] marker.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Marker that opens a rendered image token.
pub const IMAGE_TOKEN_PREFIX: &str = "![](data:";

/// A binary image payload with its MIME type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageArtifact {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ImageArtifact {
    /// Wrap raw bytes, sniffing the MIME type from the magic number.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mime_type = sniff_mime(&data).to_string();
        Self { mime_type, data }
    }

    /// `data:<mime>;base64,<payload>`
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.data))
    }

    /// Inline markdown form used on the token stream.
    pub fn to_markdown(&self) -> String {
        format!("\n\n![]({})\n\n", self.to_data_uri())
    }
}

fn sniff_mime(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(b"GIF8") {
        "image/gif"
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

/// One unit of streamed output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Text(String),
    Image(ImageArtifact),
}

impl Token {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Image(image) => image.data.is_empty(),
        }
    }

    /// Display form: text unchanged, images as inline markdown.
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Image(image) => image.to_markdown(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Image(_) => None,
        }
    }
}

impl From<String> for Token {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Token {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<ImageArtifact> for Token {
    fn from(image: ImageArtifact) -> Self {
        Self::Image(image)
    }
}

/// Recover an image from its rendered markdown form.
pub fn parse_image_token(rendered: &str) -> Option<ImageArtifact> {
    let start = rendered.find(IMAGE_TOKEN_PREFIX)? + "![](".len();
    let uri = &rendered[start..];
    let uri = &uri[..uri.find(')')?];
    let rest = uri.strip_prefix("data:")?;
    let (mime_type, payload) = rest.split_once(";base64,")?;
    let data = STANDARD.decode(payload).ok()?;
    Some(ImageArtifact {
        mime_type: mime_type.to_string(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn sniffs_png() {
        let image = ImageArtifact::from_bytes(PNG_HEADER.to_vec());
        assert_eq!(image.mime_type, "image/png");
        assert!(image.to_data_uri().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn unknown_bytes_are_octet_stream() {
        let image = ImageArtifact::from_bytes(vec![1, 2, 3]);
        assert_eq!(image.mime_type, "application/octet-stream");
    }

    #[test]
    fn markdown_carries_prefix_and_parses_back() {
        let image = ImageArtifact::from_bytes(PNG_HEADER.to_vec());
        let rendered = Token::Image(image.clone()).render();
        assert!(rendered.starts_with("\n\n"));
        assert!(rendered.contains(IMAGE_TOKEN_PREFIX));
        assert_eq!(parse_image_token(&rendered), Some(image));
    }

    #[test]
    fn plain_text_is_not_an_image() {
        assert!(parse_image_token("SELECT 1").is_none());
        assert_eq!(Token::from("abc").render(), "abc");
    }

    #[test]
    fn empty_tokens() {
        assert!(Token::from("").is_empty());
        assert!(Token::Image(ImageArtifact::from_bytes(Vec::new())).is_empty());
        assert!(!Token::from("x").is_empty());
    }
}

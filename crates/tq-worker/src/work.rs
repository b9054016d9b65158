use async_trait::async_trait;

use crate::Result;

/// A transformation applied to a message body
#[async_trait]
pub trait WorkUnit: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, body: &[u8]) -> Result<Vec<u8>>;
}

/// Reverses UTF-8 text by character
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseText;

#[async_trait]
impl WorkUnit for ReverseText {
    fn name(&self) -> &str {
        "reverse_text"
    }

    async fn run(&self, body: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(body)?;
        Ok(text.chars().rev().collect::<String>().into_bytes())
    }
}

//! Optional machine translation of stored text

use async_trait::async_trait;

/// Translates prompts, outlines and lines for display
///
/// Results are cached in the store's `translated_*` columns, so each text is
/// translated at most once.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate one text
    ///
    /// # Errors
    /// Returns a message describing the failure; callers log it and serve the
    /// untranslated view.
    async fn translate(&self, text: &str) -> Result<String, String>;
}

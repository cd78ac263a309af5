//! Text and URL helpers shared by the parser and the CLI.
//!
//! - **Text**: control-character stripping, slugs, and the [`Tokenizer`]
//!   collaborator that produces `extracted_text`
//! - **URLs**: normalization of URLs found in feed content, and SSRF checks for
//!   operator-submitted feed URLs

mod text;
mod urls;

pub use text::{slugify, strip_control_chars, strip_html, StopWordTokenizer, Tokenizer};
pub use urls::{normalize_url, validate_url, UrlValidationError};

//! Utility functions for common operations.
//!
//! This module provides reusable utilities for:
//!
//! - **URL validation**: SSRF-safe feed URL checks and loopback link detection
//! - **Text processing**: free-text normalization for the comma-delimited page format
//! - **Filesystem**: crash-safe write-to-temp-then-rename file replacement
//!
//! # Examples
//!
//! ```
//! use feed_archive::util::{is_loopback_link, normalize_url, sanitize_text};
//!
//! assert!(is_loopback_link("http://localhost/post", &[]));
//! assert_eq!(normalize_url("https://example.com/"), "https://example.com");
//! assert_eq!(sanitize_text("Hello, world"), "Hello， world");
//! ```

mod fs;
mod text;
mod url_validator;

pub use fs::write_atomic;
pub use text::{sanitize_text, COMMA_SUBSTITUTE};
pub use url_validator::{is_loopback_link, normalize_url, validate_url, UrlValidationError};

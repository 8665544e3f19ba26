//! Built-in [`GroupDirectory`](crate::GroupDirectory) implementations.
//!
//! | Feature     | Type              |
//! |-------------|-------------------|
//! | `rest-http` | [`HttpDirectory`] |

#[cfg(feature = "rest-http")]
pub mod http;

#[cfg(feature = "rest-http")]
pub use http::HttpDirectory;

//! Backend pool adapters
//!
//! Each adapter registers its pools under a name prefix so backends sharing
//! one registry never collide, and wraps borrow/operate/release in a single
//! convenience call.

#[cfg(feature = "database")]
pub mod database;

#[cfg(feature = "cache")]
pub mod cache;

#[cfg(feature = "http")]
pub mod http;

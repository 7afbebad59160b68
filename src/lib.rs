//! Circle Core Library
//!
//! Core functionality for coordination circles - a federated membership and
//! delegation engine. This crate decides who may act on behalf of whom,
//! with what scope, for how long, within a circle. Presentation concerns
//! (HTTP routing, rendering, identity lookups) live outside this crate and
//! call into [`circle::CircleManager`].

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

pub mod circle;
pub mod scope;

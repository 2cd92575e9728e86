//! Environment Management Module
//!
//! Decides where tools run: on the host, or inside a container when the
//! tool declares an image.

pub mod container;

pub use container::{select_runtime, ContainerMode, ContainerSpec, CONTAINER_RUNTIME};

#![allow(
    clippy::len_without_is_empty,
    clippy::new_without_default,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

pub mod app;
pub mod common;
pub mod config;
pub mod forward;
pub mod router;
pub mod upstream;

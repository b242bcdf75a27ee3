pub mod debug;
pub(crate) mod json;
pub mod log;

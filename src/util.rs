pub(crate) mod error;
pub mod retry;
pub(crate) mod text;

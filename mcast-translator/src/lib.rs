pub mod engine;
pub mod fib;
pub mod interface;
pub mod registration;

pub use engine::{Translator, TranslatorError};

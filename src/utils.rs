pub mod token;
pub mod postprocess;
#[cfg(feature = "terminal_printing")]
pub mod printing;
pub(crate) mod prompt_processing;

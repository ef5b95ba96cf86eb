use anyhow::Result;
pub use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};
use log::debug;

use crate::utils::token::CountToken;

/// Counter using the Tiktoken tokenizer.
///
/// Models unknown to tiktoken (Llama, Mixtral, ... served through OpenAI-compatible APIs) are
/// counted with `cl100k_base`, which is close enough for prompt-size estimates.
#[derive(Clone)]
#[readonly::make]
pub struct Tiktoken {
    /// The model name of the tokenizer. read-only.
    #[readonly]
    pub model: String,
    /// The tokenizer. read-only.
    #[readonly]
    pub bpe: CoreBPE,
}

impl Tiktoken {
    /// Create a new Tiktoken counter.
    pub fn new(model: impl Into<String>) -> Result<Self> {
        let model = model.into();
        let bpe = match get_bpe_from_model(&model) {
            Ok(bpe) => bpe,
            Err(e) => {
                debug!("no tiktoken encoding for model {}, using cl100k_base: {}", model, e);
                cl100k_base()?
            }
        };
        Ok(Tiktoken { model, bpe })
    }
}

impl CountToken for Tiktoken {
    fn count_token(&self, string: &str) -> usize {
        self.bpe.encode_with_special_tokens(string).len()
    }
}

#[cfg(test)]
mod test_tiktoken {
    use super::Tiktoken;
    use crate::utils::token::CountToken;

    #[test]
    fn test_unknown_model_falls_back() {
        let counter = Tiktoken::new("llama3-8b-8192").unwrap();
        assert_eq!("llama3-8b-8192", counter.model);
        assert_eq!(0, counter.count_token(""));
        assert!(counter.count_token("My card got stuck in the ATM") > 0);
    }
}

use std::collections::HashMap;

use burn::tensor::{Data, Shape};
use num_traits::PrimInt;

use super::vocab::{tokenize, Vocabulary};

pub const PAD: &str = "<PAD>";
pub const SOS: &str = "<SOS>";
pub const EOS: &str = "<EOS>";
pub const UNK: &str = "<UNK>";

#[derive(Clone, Debug)]
pub struct AdditionalSymbols {
    pub pad: u32,
    pub sos: u32,
    pub eos: u32,
    pub unk: u32,
}

/// Maps label tokens to class ids and back.
///
/// Ids `0..4` are taken by `<PAD>`, `<SOS>`, `<EOS>` and `<UNK>`; the
/// vocabulary follows in its own order.
#[derive(Clone, Debug)]
pub struct TokenConverter {
    pub num_classes: usize,
    pub additional_symbols: AdditionalSymbols,
    max_text_length: Option<usize>,
    token_mapper: HashMap<String, u32>,
    token_inverse_mapper: Vec<String>,
}

impl TokenConverter {
    pub fn new(vocab: &Vocabulary) -> Self {
        let mut token_inverse_mapper: Vec<String> =
            [PAD, SOS, EOS, UNK].iter().map(|s| s.to_string()).collect();
        token_inverse_mapper.extend(vocab.tokens().map(str::to_string));

        let token_mapper = token_inverse_mapper
            .iter()
            .enumerate()
            .map(|(idx, token)| (token.clone(), idx as u32))
            .collect();

        Self {
            num_classes: token_inverse_mapper.len(),
            additional_symbols: AdditionalSymbols {
                pad: 0,
                sos: 1,
                eos: 2,
                unk: 3,
            },
            max_text_length: None,
            token_mapper,
            token_inverse_mapper,
        }
    }

    /// Caps the number of label tokens kept per sample.
    pub fn with_max_text_length(mut self, max_text_length: Option<usize>) -> Self {
        self.max_text_length = max_text_length;
        self
    }

    pub fn encode_single(
        &self,
        text: &str,
        add_sos_eos: bool,
        real_max_length: Option<usize>,
    ) -> Vec<u32> {
        let tokens = tokenize(text).take(self.max_text_length.unwrap_or(usize::MAX));
        let mut res = Vec::with_capacity(real_max_length.unwrap_or(text.len() + 2));
        if add_sos_eos {
            res.push(self.additional_symbols.sos);
        }
        for token in tokens {
            let idx = match self.token_mapper.get(token) {
                Some(&idx) => idx,
                None => self.additional_symbols.unk,
            };
            res.push(idx);
        }
        if add_sos_eos {
            res.push(self.additional_symbols.eos);
        }
        if let Some(length) = real_max_length {
            res.resize(length.max(res.len()), self.additional_symbols.pad);
        }

        res
    }

    fn real_max_length(&self, texts: &[&str], add_sos_eos: bool) -> usize {
        let additional_symbol_len = if add_sos_eos { 2 } else { 0 };
        let longest = texts
            .iter()
            .map(|text| tokenize(text).count())
            .max()
            .unwrap_or(0);

        match self.max_text_length {
            Some(num) => longest.min(num) + additional_symbol_len,
            None => longest + additional_symbol_len,
        }
    }

    /// Encodes a batch, right-padding every row to the longest one.
    pub fn encode(&self, texts: &[&str], add_sos_eos: bool) -> Vec<Vec<u32>> {
        let real_max_length = self.real_max_length(texts, add_sos_eos);

        texts
            .iter()
            .map(|text| self.encode_single(text, add_sos_eos, Some(real_max_length)))
            .collect()
    }

    pub fn encode_to_tensor_data(&self, texts: &[&str], add_sos_eos: bool) -> Data<i64, 2> {
        let batch = texts.len();
        let real_max_length = self.real_max_length(texts, add_sos_eos);
        let mut res = Vec::with_capacity(batch * real_max_length);
        for text in texts {
            res.extend(
                self.encode_single(text, add_sos_eos, Some(real_max_length))
                    .into_iter()
                    .map(|id| id as i64),
            );
        }

        Data::new(res, Shape::new([batch, real_max_length]))
    }

    /// Turns one id sequence back into text.
    ///
    /// Decoding stops at the first `<EOS>`; `<PAD>` and `<SOS>` are dropped.
    pub fn decode<INT: PrimInt>(&self, encoded: &[INT]) -> String {
        let mut tokens = Vec::with_capacity(encoded.len());
        for id in encoded {
            let id = match id.to_u32() {
                Some(id) => id,
                None => {
                    tokens.push(UNK);
                    continue;
                }
            };
            match id {
                _ if id == self.additional_symbols.eos => break,
                _ if id == self.additional_symbols.pad || id == self.additional_symbols.sos => {}
                _ => tokens.push(
                    self.token_inverse_mapper
                        .get(id as usize)
                        .map(String::as_str)
                        .unwrap_or(UNK),
                ),
            }
        }

        tokens.join(" ")
    }

    pub fn decode_batch<INT: PrimInt>(&self, encoded_texts: &[Vec<INT>]) -> Vec<String> {
        encoded_texts.iter().map(|text| self.decode(text)).collect()
    }
}

//! This module contains the [`Vocabulary`] struct, which represents a
//! Provider's token vocabulary, bound once and shared read-only across
//! every session that targets it (`spec.md` §3, §5).
use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;
use serde::Deserialize;
use std::array;
use std::collections::hash_map::Entry;
use std::fmt::Debug;

use crate::utils;
use crate::utils::ByteSet;

const BYTES_NUM: usize = 257; // 256 + 1 because jagged array's implementation requires one additional index.

/// A wrapper struct that represents a token in bytes in a language model's
/// vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[repr(transparent)]
pub struct Token(pub Box<[u8]>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FirstBytes([u32; BYTES_NUM]);
impl tinyvec::Array for FirstBytes {
    type Item = u32;
    const CAPACITY: usize = BYTES_NUM;

    fn as_slice(&self) -> &[Self::Item] {
        &self.0
    }

    fn as_slice_mut(&mut self) -> &mut [Self::Item] {
        &mut self.0
    }

    fn default() -> Self {
        Self([0; BYTES_NUM])
    }
}

/// The struct represents a language model's vocabulary: an ordered list of
/// string token pieces plus an end-of-sequence marker (`spec.md` §3).
#[derive(Clone)]
pub struct Vocabulary {
    pub(crate) token_to_id: AHashMap<Token, u32>,
    pub(crate) id_to_token: AHashMap<u32, Token>,
    pub(crate) id_to_token_string: AHashMap<u32, String>,
    pub(crate) first_byte_to_token_ids: Vec<FixedBitSet>,
    eos_token_id: u32,
}

impl Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("id_to_token_string", &self.id_to_token_string)
            .field("eos_token_id", &self.eos_token_id)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type for [`Vocabulary`] creation.
pub enum CreateVocabularyError {
    /// The vocabulary size exceeds the maximum supported size.
    #[error("the vocabulary size is {0}, while the maximum supported is {1}")]
    VocabularyTooLarge(usize, usize),
    /// The EOS token id supplied is not present in `id_to_token`.
    #[error("EOS token id {0} has no corresponding entry in the vocabulary")]
    UnknownEosTokenId(u32),
}

impl Vocabulary {
    /// Creates a new instance of [`Vocabulary`].
    ///
    /// # Arguments
    ///
    /// * `id_to_token` - A map from token IDs to tokens.
    /// * `id_to_token_string` - A map from token IDs to tokens in UTF-8
    ///   string representation. This parameter is necessary because a
    ///   token's UTF-8 representation may not be equivalent to the UTF-8
    ///   string decoded from its bytes, vice versa. For example, a token
    ///   may contain a `0xFF` byte.
    /// * `eos_token_id` - The id of the provider's end-of-sequence token.
    ///   A [`crate::ipm::ParserState`] only ever allows this id when it is
    ///   in an accepting state, per `spec.md` §4.2.
    pub fn new(
        id_to_token: AHashMap<u32, Token>,
        id_to_token_string: AHashMap<u32, String>,
        eos_token_id: u32,
    ) -> Result<Vocabulary, CreateVocabularyError> {
        if id_to_token.len() >= 0x1000000 {
            return Err(CreateVocabularyError::VocabularyTooLarge(
                id_to_token.len(),
                0x1000000,
            ));
        }
        if !id_to_token.contains_key(&eos_token_id) {
            return Err(CreateVocabularyError::UnknownEosTokenId(eos_token_id));
        }
        let mut token_to_id = AHashMap::with_capacity(id_to_token.len());
        for (&token_id, token) in id_to_token.iter() {
            match token_to_id.entry(token.clone()) {
                Entry::Occupied(entry) => {
                    log::warn!(
                        "token id {} and token id {} correspond to the same token; \
                         the second id will be ignored when matching tokens to ids",
                        entry.get(),
                        token_id
                    );
                }
                Entry::Vacant(entry) => {
                    entry.insert(token_id);
                }
            }
        }
        let mut first_bytes_to_token_ids = Vec::new();
        let mut temp: [Vec<(u32, &Token)>; 256] = array::from_fn(|_| (vec![]));
        for (&token_id, token) in id_to_token.iter() {
            if token.0.is_empty() {
                log::warn!("token id {} corresponds to an empty token; ignored", token_id);
                continue;
            }
            let first_byte = token.0[0];
            temp[first_byte as usize].push((token_id, token));
        }
        let vocab_size = id_to_token
            .keys()
            .copied()
            .max()
            .map(|x| x + 1)
            .unwrap_or(0) as usize;
        for tokens in temp {
            let mut set = FixedBitSet::with_capacity(vocab_size);
            for (token_id, _token) in tokens {
                set.insert(token_id as usize);
            }
            first_bytes_to_token_ids.push(set);
        }
        Self::check_vocabulary_utf8_support(&token_to_id);
        Ok(Self {
            token_to_id,
            id_to_token,
            id_to_token_string,
            first_byte_to_token_ids: first_bytes_to_token_ids,
            eos_token_id,
        })
    }

    fn check_vocabulary_utf8_support(token_to_id: &AHashMap<Token, u32>) {
        let mut not_existing_bytes = ByteSet::with_capacity(256);
        for byte in 0..=247u8 {
            let found = token_to_id.keys().any(|token| token.0.contains(&byte));
            if !found {
                not_existing_bytes.insert(byte as usize);
            }
        }
        if !not_existing_bytes.is_clear() {
            log::warn!(
                "the following bytes are not present in any token: {:?}; this likely indicates \
                 a vocabulary loading bug or a non-UTF-8-compatible tokenizer",
                utils::get_display_form_from_bitset_on_stack(&not_existing_bytes)
            );
        }
    }

    /// Retrieves the token associated with the given token ID.
    pub fn token(&self, token_id: u32) -> Option<&Token> {
        self.id_to_token.get(&token_id)
    }

    /// Retrieves the token string associated with the given token ID.
    pub fn token_string(&self, token_id: u32) -> Option<&str> {
        self.id_to_token_string.get(&token_id).map(|x| x.as_str())
    }

    /// Retrieves the token ID associated with the given token.
    pub fn token_id(&self, token: &Token) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// The id of the end-of-sequence marker.
    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// Retrieves the size of the vocabulary (one past the largest token id).
    pub fn vocab_size(&self) -> usize {
        self.id_to_token
            .keys()
            .copied()
            .max()
            .map(|x| x + 1)
            .unwrap_or(0) as usize
    }

    pub(crate) fn tokens_with_first_byte(&self, byte: u8) -> impl Iterator<Item = u32> + '_ {
        self.first_byte_to_token_ids
            .get(byte as usize)
            .into_iter()
            .flat_map(|set| set.ones().map(|x| x as u32))
    }
}

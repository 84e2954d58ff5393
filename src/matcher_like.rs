//! This module contains the [`MatcherLike`] trait, which defines the behavior of a matcher-like object.

use std::sync::Arc;

use displaydoc::Display;

use crate::bitmask::TokenBitmask;
use crate::grammar::Grammar;
use crate::vocabulary::Vocabulary;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Represents the error when a [`MatcherLike`] tries to compute the next token bitmask.
pub enum FindBitmaskError {
    /// The matcher has consumed a stop token. No more tokens can be accepted.
    Terminated,
}

impl std::error::Error for FindBitmaskError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
/// Represents the error when a [`MatcherLike`] tries to roll back.
pub enum RollbackError {
    /// More steps are requested than the matcher has recorded or is allowed to record.
    #[error("Cannot roll back {requested} steps: {available} steps are recorded and at most {max_rollback_steps} can be rolled back.")]
    RollbackLimitExceeded {
        /// The requested number of steps.
        requested: usize,
        /// The number of recorded steps.
        available: usize,
        /// The configured maximum.
        max_rollback_steps: usize,
    },
}

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// A trait that defines the behavior of a [`MatcherLike`] object.
pub trait MatcherLike: sealed::Sealed {
    /// Tries to accept a new token with the given token ID.
    ///
    /// # Arguments
    ///
    /// * `token_id` - The ID of the token to be accepted.
    ///
    /// # Returns
    ///
    /// * `true` - If the token is accepted. The previous state is recorded for rollback.
    /// * `false` - If the token is unknown, special, not a valid continuation of the grammar,
    ///     or the matcher is terminated. The [`MatcherLike`] internal states are not updated in this case.
    fn accept_token(&mut self, token_id: u32) -> bool;

    /// Tries to accept new bytes as if they were one token.
    ///
    /// # Returns
    ///
    /// * `true` - If the bytes are accepted.
    /// * `false` - If they are not. The [`MatcherLike`] internal states are not updated in this case.
    fn accept_bytes(&mut self, bytes: &[u8]) -> bool;

    /// Restores the state from `num_tokens` accepted tokens ago.
    ///
    /// # Errors
    ///
    /// Returns a [`RollbackError`] when more tokens are requested than recorded.
    /// The [`MatcherLike`] internal states are not updated in this case.
    fn rollback(&mut self, num_tokens: usize) -> Result<(), RollbackError>;

    /// Computes the bitmask of the tokens that can be accepted next.
    ///
    /// # Errors
    ///
    /// Returns [`FindBitmaskError::Terminated`] when a stop token has been accepted.
    fn find_next_token_bitmask(&mut self) -> Result<TokenBitmask, FindBitmaskError>;

    /// Computes the longest string the grammar forces next, truncated to valid UTF-8.
    fn find_jump_forward_string(&mut self) -> String;

    /// Checks if the matcher is terminated.
    ///
    /// A matcher is terminated when it has accepted a stop token, or when it is configured to terminate
    /// without a stop token and the grammar is matched.
    fn is_terminated(&self) -> bool;

    /// Checks if the matcher may end here, that is the grammar is matched or a stop token was accepted.
    fn can_terminate(&self) -> bool;

    /// Resets the matcher to its initial state. Notably, the cache is preserved.
    fn reset(&mut self);

    /// Converts the matcher to a boxed matcher.
    fn into_boxed_matcher(self) -> Box<dyn MatcherLike + Send>;

    /// Gets the vocabulary of the matcher.
    fn vocab(&self) -> Arc<Vocabulary>;

    /// Gets the grammar of the matcher.
    fn grammar(&self) -> Arc<Grammar>;
}

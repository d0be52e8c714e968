//! Synthetic provider used when `engine.mock_mode` is set.
//!
//! Responses have a fixed shape and a bounded pseudo-random completion
//! length. Each call seeds its own RNG from the provider seed and the
//! request, so the provider keeps no mutable state and can be shared by
//! concurrent sessions.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ctxforge_core::error::Result;
use ctxforge_core::traits::ChatProvider;
use ctxforge_core::types::*;

const MIN_COMPLETION_TOKENS: u64 = 20;
const MAX_COMPLETION_TOKENS: u64 = 200;
const CHARS_PER_TOKEN: usize = 4;
const EXCERPT_CHARS: usize = 80;

pub struct MockChatProvider {
    seed: u64,
}

impl MockChatProvider {
    /// `None` picks a fresh seed for this process.
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            seed: seed.unwrap_or_else(rand::random),
        }
    }

    fn rng_for(&self, request: &ChatRequest) -> StdRng {
        let mut hasher = DefaultHasher::new();
        request.provider.hash(&mut hasher);
        request.model.hash(&mut hasher);
        for m in &request.messages {
            m.role.as_str().hash(&mut hasher);
            m.content.hash(&mut hasher);
        }
        StdRng::seed_from_u64(self.seed ^ hasher.finish())
    }

    fn respond(&self, request: &ChatRequest) -> ChatCompletion {
        let mut rng = self.rng_for(request);

        let upper = MAX_COMPLETION_TOKENS.min(request.max_tokens.max(1) as u64);
        let lower = MIN_COMPLETION_TOKENS.min(upper);
        let completion_tokens = rng.gen_range(lower..=upper);
        let prompt_tokens = (request.prompt_chars() / CHARS_PER_TOKEN) as u64;

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let excerpt: String = last_user.chars().take(EXCERPT_CHARS).collect();

        let content = format!(
            "[mock {}/{}] Response to: {}",
            request.provider, request.model, excerpt
        );

        ChatCompletion {
            content,
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
            }),
        }
    }
}

impl ChatProvider for MockChatProvider {
    fn complete(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatCompletion>> {
        let completion = self.respond(&request);
        Box::pin(async move { Ok(completion) })
    }
}

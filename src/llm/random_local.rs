//! The zero-network baseline adapter: samples a uniformly random valid
//! choice index instead of calling out to a real model. Used as a control
//! in benchmarks, and to exercise the engine without API credentials.

use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::Mutex;

use crate::{
    llm::{ChatCompletionResult, ChatRequest, Driver, FinishReason, LlmError, LlmRetryResult, TokenUsage},
    prelude::*,
    retry::{retry_result_fatal, retry_result_ok},
};

/// Driver that performs no network I/O and returns a uniformly random
/// 1-based choice index as its reply content.
///
/// The RNG is seeded once at construction (from `RANDOM_LOCAL_SEED` if set,
/// otherwise from entropy) and then advanced on every call, so a fixed seed
/// and fixed sequence of requests reproduce a fixed sequence of choices.
#[derive(Debug)]
pub struct RandomLocalDriver {
    rng: Mutex<StdRng>,
}

impl RandomLocalDriver {
    pub fn new() -> Self {
        let rng = match std::env::var("RANDOM_LOCAL_SEED") {
            Ok(seed) => match seed.parse::<u64>() {
                Ok(seed) => StdRng::seed_from_u64(seed),
                Err(_) => {
                    warn!(%seed, "ignoring malformed RANDOM_LOCAL_SEED, using entropy instead");
                    StdRng::from_os_rng()
                }
            },
            Err(_) => StdRng::from_os_rng(),
        };
        RandomLocalDriver {
            rng: Mutex::new(rng),
        }
    }

    /// Build a driver with an explicit seed, for tests.
    #[cfg(test)]
    fn with_seed(seed: u64) -> Self {
        RandomLocalDriver {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomLocalDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for RandomLocalDriver {
    async fn complete_once(&self, request: &ChatRequest) -> LlmRetryResult<ChatCompletionResult> {
        if request.choice_count == 0 {
            return retry_result_fatal(
                LlmError::MalformedResponse("random_local cannot choose from zero choices".to_owned())
                    .into(),
            );
        }
        let chosen = {
            let mut rng = self.rng.lock().expect("random_local rng poisoned");
            rng.random_range(1..=request.choice_count as i64)
        };
        let content = json!({ "result": chosen, "reasoning": "random_local baseline" }).to_string();
        retry_result_ok(ChatCompletionResult {
            content,
            usage: TokenUsage::default(),
            cost_usd: Some(0.0),
            finish_reason: FinishReason::Stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(choice_count: usize) -> ChatRequest {
        ChatRequest {
            messages: vec![],
            model: "seeded".to_owned(),
            temperature: None,
            max_tokens: None,
            timeout: std::time::Duration::from_secs(5),
            choice_count,
        }
    }

    #[tokio::test]
    async fn same_seed_and_same_call_sequence_is_reproducible() {
        let a = RandomLocalDriver::with_seed(42);
        let b = RandomLocalDriver::with_seed(42);
        for _ in 0..5 {
            let ra = a.complete_once(&request(4)).await;
            let rb = b.complete_once(&request(4)).await;
            let (keen_retry::RetryResult::Ok { output: oa, .. }, keen_retry::RetryResult::Ok { output: ob, .. }) =
                (ra, rb)
            else {
                panic!("expected Ok from random_local");
            };
            assert_eq!(oa.content, ob.content);
        }
    }

    #[tokio::test]
    async fn zero_choices_is_fatal_not_a_panic() {
        let driver = RandomLocalDriver::with_seed(1);
        let result = driver.complete_once(&request(0)).await;
        assert!(matches!(result, keen_retry::RetryResult::Fatal { .. }));
    }

    #[tokio::test]
    async fn chosen_index_is_always_in_range() {
        let driver = RandomLocalDriver::with_seed(7);
        for _ in 0..20 {
            let keen_retry::RetryResult::Ok { output, .. } = driver.complete_once(&request(3)).await
            else {
                panic!("expected Ok from random_local");
            };
            let parsed: Value = serde_json::from_str(&output.content).unwrap();
            let result = parsed["result"].as_i64().unwrap();
            assert!((1..=3).contains(&result));
        }
    }
}

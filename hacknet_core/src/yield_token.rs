//! Yield tokens: the resumability predicates a suspended task waits on.
//!
//! A task step returns a token; the owning [`Operation`](crate::Operation)
//! polls it once per tick with the simulated time delta and advances the
//! task only after the token reports resumed. A resumed token is dropped by
//! the driver and never polled again.

use crate::lock;
use hacknet_env::{OperationId, PersonContext};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Side-effect-free (or idempotent) resumption predicate.
pub type Predicate = Box<dyn FnMut() -> bool + Send>;

/// One-shot side effect run by [`YieldToken::ActWait`].
pub type Action = Box<dyn FnOnce() + Send>;

/// A suspension point returned by a task step.
pub enum YieldToken {
    /// Resumes once the accumulated simulated time reaches the remaining seconds
    Delay(f64),

    /// Resumes when the predicate returns true
    Condition(Predicate),

    /// Resumes when input for an operation arrives on a person context
    Input(InputWait),

    /// Resumes when every token has resumed, front to back
    Sequence(VecDeque<YieldToken>),

    /// Resumes when every token has resumed, in any order
    Aggregate(Vec<YieldToken>),

    /// Runs `action` once on first poll, then waits on `token`
    ActWait {
        action: Option<Action>,
        token: Box<YieldToken>,
    },
}

impl YieldToken {
    /// Waits `seconds` of simulated time.
    pub fn delay(seconds: f64) -> Self {
        YieldToken::Delay(seconds)
    }

    /// Waits until `predicate` holds.
    pub fn condition<F>(predicate: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        YieldToken::Condition(Box::new(predicate))
    }

    /// Waits for input keyed by `operation_id` on `context`.
    ///
    /// The returned slot receives the captured line; the task keeps it and
    /// reads it on the step after resumption.
    pub fn input(context: Arc<dyn PersonContext>, operation_id: OperationId) -> (Self, InputSlot) {
        let slot = InputSlot::default();
        let wait = InputWait {
            context,
            operation_id,
            captured: false,
            slot: slot.clone(),
        };
        (YieldToken::Input(wait), slot)
    }

    /// Waits for the response stored under `key` on `context`.
    ///
    /// A `Condition` that moves the response into the returned slot; like
    /// `Input` it captures at most once, since a resumed token is never
    /// polled again.
    pub fn response(context: Arc<dyn PersonContext>, key: impl Into<String>) -> (Self, InputSlot) {
        let key = key.into();
        let slot = InputSlot::default();
        let filled = slot.clone();
        let token = YieldToken::condition(move || match context.take_response(&key) {
            Some(value) => {
                filled.fill(value);
                true
            }
            None => false,
        });
        (token, slot)
    }

    /// Waits on each token in order.
    pub fn sequence(tokens: impl IntoIterator<Item = YieldToken>) -> Self {
        YieldToken::Sequence(tokens.into_iter().collect())
    }

    /// Waits on all tokens, order-independent.
    pub fn aggregate(tokens: impl IntoIterator<Item = YieldToken>) -> Self {
        YieldToken::Aggregate(tokens.into_iter().collect())
    }

    /// Runs `action` exactly once, then waits on `token`.
    pub fn act_wait<F>(action: F, token: YieldToken) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        YieldToken::ActWait {
            action: Some(Box::new(action)),
            token: Box::new(token),
        }
    }

    /// Polls the token with the simulated time elapsed since the last poll.
    ///
    /// Zero, negative and NaN deltas never advance a `Delay`. Inside a
    /// `Sequence` only the front token is credited with the delta; tokens
    /// reached later in the same poll see a zero delta.
    pub fn resume(&mut self, delta: f64) -> bool {
        match self {
            YieldToken::Delay(remaining) => {
                if delta > 0.0 {
                    *remaining -= delta;
                }
                *remaining <= 0.0
            }
            YieldToken::Condition(predicate) => predicate(),
            YieldToken::Input(wait) => wait.resume(),
            YieldToken::Sequence(tokens) => {
                let mut delta = delta;
                while let Some(front) = tokens.front_mut() {
                    if !front.resume(delta) {
                        return false;
                    }
                    tokens.pop_front();
                    delta = 0.0;
                }
                true
            }
            YieldToken::Aggregate(tokens) => {
                tokens.retain_mut(|token| !token.resume(delta));
                tokens.is_empty()
            }
            YieldToken::ActWait { action, token } => {
                if let Some(action) = action.take() {
                    action();
                }
                token.resume(delta)
            }
        }
    }
}

impl fmt::Debug for YieldToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            YieldToken::Delay(remaining) => f.debug_tuple("Delay").field(remaining).finish(),
            YieldToken::Condition(_) => f.write_str("Condition(..)"),
            YieldToken::Input(wait) => f
                .debug_struct("Input")
                .field("operation_id", &wait.operation_id)
                .field("captured", &wait.captured)
                .finish(),
            YieldToken::Sequence(tokens) => f.debug_tuple("Sequence").field(tokens).finish(),
            YieldToken::Aggregate(tokens) => f.debug_tuple("Aggregate").field(tokens).finish(),
            YieldToken::ActWait { action, token } => f
                .debug_struct("ActWait")
                .field("fired", &action.is_none())
                .field("token", token)
                .finish(),
        }
    }
}

/// Pending read of one input line.
pub struct InputWait {
    context: Arc<dyn PersonContext>,
    operation_id: OperationId,
    captured: bool,
    slot: InputSlot,
}

impl InputWait {
    /// Captures at most once; afterwards always reports resumed without
    /// touching the context's input map again.
    fn resume(&mut self) -> bool {
        if self.captured {
            return true;
        }
        match self.context.take_input(self.operation_id) {
            Some(text) => {
                self.slot.fill(text);
                self.captured = true;
                true
            }
            None => false,
        }
    }
}

/// Shared cell receiving the line captured by an `Input` token.
#[derive(Clone, Default)]
pub struct InputSlot(Arc<Mutex<Option<String>>>);

impl InputSlot {
    fn fill(&self, text: String) {
        *lock(&self.0) = Some(text);
    }

    /// Takes the captured line.
    pub fn take(&self) -> Option<String> {
        lock(&self.0).take()
    }

    /// Returns true if a line was captured and not yet taken.
    pub fn is_filled(&self) -> bool {
        lock(&self.0).is_some()
    }
}

impl fmt::Debug for InputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InputSlot").field(&*lock(&self.0)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hacknet_env::{ContextId, SessionContext};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delay_resumes_at_threshold() {
        let mut token = YieldToken::delay(1.0);
        assert!(!token.resume(0.5));
        assert!(token.resume(0.5));
    }

    #[test]
    fn test_delay_ignores_non_positive_deltas() {
        let mut token = YieldToken::delay(0.25);
        assert!(!token.resume(0.0));
        assert!(!token.resume(-3.0));
        assert!(!token.resume(f64::NAN));
        assert!(token.resume(0.25));
    }

    #[test]
    fn test_zero_delay_resumes_immediately() {
        let mut token = YieldToken::delay(0.0);
        assert!(token.resume(0.0));
    }

    #[test]
    fn test_condition_follows_predicate() {
        let flag = Arc::new(Mutex::new(false));
        let seen = flag.clone();
        let mut token = YieldToken::condition(move || *lock(&seen));

        assert!(!token.resume(1.0));
        *lock(&flag) = true;
        assert!(token.resume(0.0));
    }

    #[test]
    fn test_input_captures_once() {
        let ctx = Arc::new(SessionContext::new(ContextId::from_seed(1)));
        let (mut token, slot) = YieldToken::input(ctx.clone(), OperationId(5));

        assert!(!token.resume(0.0));
        assert!(!slot.is_filled());

        ctx.submit_input(OperationId(5), "first".to_string());
        assert!(token.resume(0.0));

        // A second line must not be consumed by an already-resumed token
        ctx.submit_input(OperationId(5), "second".to_string());
        assert!(token.resume(0.0));
        assert_eq!(slot.take(), Some("first".to_string()));
        assert_eq!(ctx.take_input(OperationId(5)), Some("second".to_string()));
    }

    #[test]
    fn test_input_ignores_other_operations() {
        let ctx = Arc::new(SessionContext::new(ContextId::from_seed(2)));
        let (mut token, _slot) = YieldToken::input(ctx.clone(), OperationId(1));
        ctx.submit_input(OperationId(2), "not mine".to_string());
        assert!(!token.resume(0.0));
    }

    #[test]
    fn test_response_takes_keyed_value() {
        let ctx = Arc::new(SessionContext::new(ContextId::from_seed(3)));
        let (mut token, slot) = YieldToken::response(ctx.clone(), "confirm:4");

        ctx.submit_response("confirm:5".to_string(), "y".to_string());
        assert!(!token.resume(0.0));

        ctx.submit_response("confirm:4".to_string(), "n".to_string());
        assert!(token.resume(0.0));
        assert_eq!(slot.take(), Some("n".to_string()));
        assert_eq!(ctx.take_response("confirm:4"), None);
        assert_eq!(ctx.take_response("confirm:5"), Some("y".to_string()));
    }

    #[test]
    fn test_sequence_resumes_front_to_back() {
        let gate = Arc::new(Mutex::new(false));
        let seen = gate.clone();
        let mut token = YieldToken::sequence([
            YieldToken::delay(1.0),
            YieldToken::condition(move || *lock(&seen)),
        ]);

        assert!(!token.resume(1.0));
        match &token {
            YieldToken::Sequence(rest) => assert_eq!(rest.len(), 1),
            other => panic!("unexpected token {:?}", other),
        }

        *lock(&gate) = true;
        assert!(token.resume(0.0));
    }

    #[test]
    fn test_sequence_does_not_credit_delta_twice() {
        let mut token = YieldToken::sequence([YieldToken::delay(1.0), YieldToken::delay(1.0)]);
        assert!(!token.resume(1.0));
        assert!(token.resume(1.0));
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let gate = Arc::new(Mutex::new(false));
        let seen = gate.clone();
        let mut token = YieldToken::aggregate([
            YieldToken::condition(move || *lock(&seen)),
            YieldToken::delay(2.0),
        ]);

        assert!(!token.resume(2.0));
        *lock(&gate) = true;
        assert!(token.resume(0.0));
    }

    #[test]
    fn test_act_wait_runs_action_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut token = YieldToken::act_wait(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            YieldToken::delay(1.0),
        );

        assert!(!token.resume(0.4));
        assert!(!token.resume(0.4));
        assert!(token.resume(0.4));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        // Quarter-second steps keep every sum exact in f64
        #[test]
        fn test_delay_resumes_on_first_tick_reaching_target(
            target_quarters in 1u32..200,
            delta_quarters in proptest::collection::vec(0u32..20, 1..64),
        ) {
            let target = target_quarters as f64 * 0.25;
            let mut token = YieldToken::delay(target);
            let mut total = 0.0;
            for quarters in delta_quarters {
                let delta = quarters as f64 * 0.25;
                total += delta;
                let resumed = token.resume(delta);
                prop_assert_eq!(resumed, total >= target);
                if resumed {
                    break;
                }
            }
        }
    }
}

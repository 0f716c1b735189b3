use rootstore_common::Event;
use serde_json::Value;
use std::sync::Arc;

/// Errors a partition reducer can produce while handling an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReduceError {
    #[error("event {event:?} rejected: {reason}")]
    Rejected { event: String, reason: String },
    #[error("reducer panicked: {0}")]
    Panicked(String),
}

impl ReduceError {
    pub fn rejected(event: &Event, reason: impl Into<String>) -> Self {
        Self::Rejected {
            event: event.kind.clone(),
            reason: reason.into(),
        }
    }
}

/// A state partition: an initial state plus a pure update function.
///
/// `reduce` must not perform I/O and must return its input unchanged for
/// event types it does not recognize.
pub trait Reducer: Send + Sync {
    fn initial_state(&self) -> Value;

    fn reduce(&self, state: &Value, event: &Event) -> Result<Value, ReduceError>;
}

impl<R: Reducer + ?Sized> Reducer for Arc<R> {
    fn initial_state(&self) -> Value {
        (**self).initial_state()
    }

    fn reduce(&self, state: &Value, event: &Event) -> Result<Value, ReduceError> {
        (**self).reduce(state, event)
    }
}

impl<R: Reducer + ?Sized> Reducer for Box<R> {
    fn initial_state(&self) -> Value {
        (**self).initial_state()
    }

    fn reduce(&self, state: &Value, event: &Event) -> Result<Value, ReduceError> {
        (**self).reduce(state, event)
    }
}

/// Reducer built from an initial value and a closure.
pub struct FnReducer<F> {
    initial: Value,
    update: F,
}

impl<F> Reducer for FnReducer<F>
where
    F: Fn(&Value, &Event) -> Result<Value, ReduceError> + Send + Sync,
{
    fn initial_state(&self) -> Value {
        self.initial.clone()
    }

    fn reduce(&self, state: &Value, event: &Event) -> Result<Value, ReduceError> {
        (self.update)(state, event)
    }
}

/// Build a partition from a closure that may reject events.
pub fn try_reducer_fn<F>(initial: Value, update: F) -> FnReducer<F>
where
    F: Fn(&Value, &Event) -> Result<Value, ReduceError> + Send + Sync,
{
    FnReducer { initial, update }
}

/// Build a partition from an infallible closure.
pub fn reducer_fn<F>(
    initial: Value,
    update: F,
) -> FnReducer<impl Fn(&Value, &Event) -> Result<Value, ReduceError> + Send + Sync>
where
    F: Fn(&Value, &Event) -> Value + Send + Sync,
{
    try_reducer_fn(initial, move |state: &Value, event: &Event| {
        Ok(update(state, event))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fn_reducer_applies_closure() {
        let counter = reducer_fn(json!(0), |state, event| match event.kind.as_str() {
            "inc" => json!(state.as_i64().unwrap_or(0) + 1),
            _ => state.clone(),
        });
        assert_eq!(counter.initial_state(), json!(0));
        assert_eq!(counter.reduce(&json!(4), &Event::new("inc")), Ok(json!(5)));
        assert_eq!(counter.reduce(&json!(4), &Event::new("other")), Ok(json!(4)));
    }

    #[test]
    fn try_reducer_fn_can_reject() {
        let strict = try_reducer_fn(json!(null), |state, event| {
            if event.is("bad") {
                Err(ReduceError::rejected(event, "not allowed"))
            } else {
                Ok(state.clone())
            }
        });
        let err = strict.reduce(&json!(null), &Event::new("bad")).unwrap_err();
        assert_eq!(
            err,
            ReduceError::Rejected {
                event: "bad".into(),
                reason: "not allowed".into()
            }
        );
    }

    #[test]
    fn shared_reducer_delegates() {
        let shared: Arc<dyn Reducer> = Arc::new(reducer_fn(json!("x"), |s, _| s.clone()));
        assert_eq!(shared.initial_state(), json!("x"));
    }
}

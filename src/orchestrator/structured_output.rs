//! Structured Output Parser (C5, `spec.md` §4.5).
//!
//! Invoked only when an execution carries a non-null `output_schema`. Parses
//! the Graph Runner's candidate final output as JSON, validates it, and on
//! failure re-invokes the terminal node's LLM with a corrective prompt that
//! names the validator's error path — bounded to 3 total attempts
//! (`spec.md` §9 "Structured-output loop").

use serde_json::Value;
use std::future::Future;

const MAX_ATTEMPTS: u32 = 3;

/// Outcome of running the structured-output loop.
pub struct StructuredOutputOutcome {
    pub raw: String,
    pub structured: Option<Value>,
    /// Set only if every attempt failed. Structured-output failure is
    /// recoverable: the execution still completes SUCCESS with the raw
    /// string and this error, per `spec.md` §4.5 step 4.
    pub parse_error: Option<String>,
}

/// Run the validate/retry loop. `reinvoke` re-runs the terminal node's LLM
/// call with a corrective prompt describing `errors` and returns the next
/// candidate output string.
pub async fn enforce<F, Fut>(
    initial_candidate: String,
    schema: &Value,
    mut reinvoke: F,
) -> StructuredOutputOutcome
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(err) => {
            return StructuredOutputOutcome {
                raw: initial_candidate,
                structured: None,
                parse_error: Some(format!("invalid output_schema: {}", err)),
            }
        }
    };

    let mut candidate = initial_candidate;
    let mut last_error = String::new();

    for attempt in 1..=MAX_ATTEMPTS {
        match serde_json::from_str::<Value>(&candidate) {
            Ok(instance) => {
                let errors: Vec<String> = validator
                    .iter_errors(&instance)
                    .map(|e| format!("{}: {}", e.instance_path, e))
                    .collect();
                if errors.is_empty() {
                    return StructuredOutputOutcome {
                        raw: candidate.clone(),
                        structured: Some(instance),
                        parse_error: None,
                    };
                }
                last_error = errors.join("; ");
            }
            Err(err) => {
                last_error = format!("invalid JSON: {}", err);
            }
        }

        if attempt == MAX_ATTEMPTS {
            break;
        }

        let corrective_prompt = format!(
            "Your previous response did not satisfy the required JSON Schema.\n\
             Schema: {}\n\
             Validation error(s): {}\n\
             Respond again with ONLY a JSON value that satisfies the schema.",
            schema, last_error
        );
        match reinvoke(corrective_prompt).await {
            Ok(next) => candidate = next,
            Err(invoke_err) => {
                last_error = format!("{} (retry failed: {})", last_error, invoke_err);
                break;
            }
        }
    }

    StructuredOutputOutcome {
        raw: candidate,
        structured: None,
        parse_error: Some(last_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn succeeds_on_first_valid_attempt() {
        let schema = json!({"type": "object", "required": ["answer"]});
        let outcome = enforce(r#"{"answer":42}"#.to_string(), &schema, |_| async { Ok(String::new()) }).await;
        assert_eq!(outcome.structured, Some(json!({"answer": 42})));
        assert!(outcome.parse_error.is_none());
    }

    #[tokio::test]
    async fn retries_once_then_succeeds() {
        let schema = json!({"type": "object", "required": ["answer"]});
        let outcome = enforce("hello".to_string(), &schema, |_| async { Ok(r#"{"answer":42}"#.to_string()) }).await;
        assert_eq!(outcome.structured, Some(json!({"answer": 42})));
        assert!(outcome.parse_error.is_none());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_but_keeps_raw() {
        let schema = json!({"type": "object", "required": ["answer"]});
        let outcome = enforce("hello".to_string(), &schema, |_| async { Ok("still not json".to_string()) }).await;
        assert!(outcome.structured.is_none());
        assert!(outcome.parse_error.is_some());
        assert_eq!(outcome.raw, "still not json");
    }
}

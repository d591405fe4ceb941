//! Oracle Resolver
//!
//! Evaluates a declarative resolution schema against an external data
//! source and yields a binary outcome. The resolver never mutates
//! market state; the settlement engine acts on the returned value.
//!
//! Retries use exponential backoff with jitter:
//! `delay = min(initial x multiplier^(attempt-1), max_delay) +/- jitter x delay`.
//! Retryable: network failures, timeouts, HTTP 5xx, HTTP 429.
//! Non-retryable: other HTTP 4xx, schema evaluation errors.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::errors::{CoreError, CoreResult};
use crate::models::Outcome;

/// Default per-attempt deadline.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default attempt budget.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

// ============================================================
// SCHEMA (wire format)
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
}

/// The condition a selected value is tested against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Declarative description of how a market resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolutionSchema {
    HttpJson {
        source_url: String,
        method: HttpMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        json_path: String,
        condition: Condition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Graphql {
        endpoint: String,
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variables: Option<Value>,
        json_path: String,
        condition: Condition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl ResolutionSchema {
    pub fn json_path(&self) -> &str {
        match self {
            Self::HttpJson { json_path, .. } | Self::Graphql { json_path, .. } => json_path,
        }
    }

    pub fn condition(&self) -> &Condition {
        match self {
            Self::HttpJson { condition, .. } | Self::Graphql { condition, .. } => condition,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Self::HttpJson { retry_count, .. } | Self::Graphql { retry_count, .. } => {
                retry_count.unwrap_or(DEFAULT_RETRY_COUNT)
            }
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        match self {
            Self::HttpJson { timeout_ms, .. } | Self::Graphql { timeout_ms, .. } => {
                timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
            }
        }
    }

    /// Structural validation at market creation time.
    pub fn validate(&self) -> CoreResult<()> {
        let path = self.json_path();
        if !path.starts_with('$') {
            return Err(CoreError::MalformedResolutionSchema(format!(
                "json_path must start with '$': {path}"
            )));
        }
        let cond = self.condition();
        if cond.operator != Operator::Exists && cond.value.is_none() {
            return Err(CoreError::MalformedResolutionSchema(format!(
                "operator {:?} requires a comparison value",
                cond.operator
            )));
        }
        match self {
            Self::HttpJson { source_url, .. } if source_url.is_empty() => Err(
                CoreError::MalformedResolutionSchema("empty source_url".into()),
            ),
            Self::Graphql { endpoint, query, .. } if endpoint.is_empty() || query.is_empty() => {
                Err(CoreError::MalformedResolutionSchema(
                    "empty graphql endpoint or query".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

// ============================================================
// JSON PATH (subset: $.a.b[0].c)
// ============================================================

/// Select a value by a `$.a.b[0].c`-style path.
///
/// Returns `Ok(None)` when a segment is absent; `Err` on a malformed
/// path expression.
pub fn select<'a>(root: &'a Value, path: &str) -> CoreResult<Option<&'a Value>> {
    let rest = path
        .strip_prefix('$')
        .ok_or_else(|| CoreError::OracleSchemaError(format!("path must start with '$': {path}")))?;

    let mut current = root;
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    key.push(next);
                    chars.next();
                }
                if key.is_empty() {
                    return Err(CoreError::OracleSchemaError(format!(
                        "empty key segment in path: {path}"
                    )));
                }
                match current.get(&key) {
                    Some(v) => current = v,
                    None => return Ok(None),
                }
            }
            '[' => {
                let mut digits = String::new();
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                    digits.push(next);
                }
                let idx: usize = digits.parse().map_err(|_| {
                    CoreError::OracleSchemaError(format!("bad index '[{digits}]' in path: {path}"))
                })?;
                match current.get(idx) {
                    Some(v) => current = v,
                    None => return Ok(None),
                }
            }
            _ => {
                return Err(CoreError::OracleSchemaError(format!(
                    "unexpected '{c}' in path: {path}"
                )));
            }
        }
    }
    Ok(Some(current))
}

// ============================================================
// CONDITION EVALUATION
// ============================================================

/// Evaluate a condition: YES if it holds, NO otherwise.
///
/// # Errors
/// - `OracleIndeterminate` when the selector found nothing and the
///   operator is not `exists`
/// - `OracleSchemaError` for type mismatches on ordered comparisons
pub fn evaluate_condition(cond: &Condition, selected: Option<&Value>) -> CoreResult<Outcome> {
    if cond.operator == Operator::Exists {
        return Ok(bool_outcome(selected.is_some()));
    }

    let actual = selected.ok_or_else(|| {
        CoreError::OracleIndeterminate("selector matched nothing".into())
    })?;
    let expected = cond.value.as_ref().ok_or_else(|| {
        CoreError::OracleSchemaError(format!("operator {:?} requires a value", cond.operator))
    })?;

    let holds = match cond.operator {
        Operator::Eq => json_eq(actual, expected),
        Operator::Neq => !json_eq(actual, expected),
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let a = as_number(actual)?;
            let b = as_number(expected)?;
            match cond.operator {
                Operator::Gt => a > b,
                Operator::Gte => a >= b,
                Operator::Lt => a < b,
                Operator::Lte => a <= b,
                _ => unreachable!(),
            }
        }
        Operator::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|v| json_eq(v, needle)),
            _ => {
                return Err(CoreError::OracleSchemaError(
                    "contains requires a string or array on the left".into(),
                ));
            }
        },
        Operator::Exists => unreachable!(),
    };
    Ok(bool_outcome(holds))
}

fn bool_outcome(b: bool) -> Outcome {
    if b { Outcome::Yes } else { Outcome::No }
}

/// Equality with numeric coercion so `1` and `1.0` compare equal.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn as_number(v: &Value) -> CoreResult<f64> {
    v.as_f64().ok_or_else(|| {
        CoreError::OracleSchemaError(format!("expected number, got {v}"))
    })
}

// ============================================================
// RETRY POLICY
// ============================================================

/// Exponential backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fractional jitter applied symmetrically (0.1 = +/-10%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after `attempt` (1-based), pre-jitter.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let raw = self.initial_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        (raw as u64).min(self.max_delay_ms)
    }

    /// Base delay with jitter applied.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let base = self.base_delay_ms(attempt) as f64;
        let spread = base * self.jitter;
        let jittered = base + rand::thread_rng().gen_range(-spread..=spread);
        jittered.max(0.0) as u64
    }
}

// ============================================================
// RESOLVER
// ============================================================

/// The outcome of a resolution attempt, handed to settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub outcome: Outcome,
    /// Full response body for the audit trail
    pub raw_data: Value,
    /// The value the selector extracted
    pub evaluated_value: Option<Value>,
}

/// Fetches external data and evaluates resolution schemas.
pub struct OracleResolver {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OracleResolver {
    pub fn new(policy: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, policy }
    }

    /// Resolve a schema against its data source.
    ///
    /// Retries per policy on network failures, timeouts, 5xx and 429.
    /// Pure against a pure oracle: identical inputs give identical
    /// outcomes.
    pub async fn resolve(&self, schema: &ResolutionSchema) -> CoreResult<Resolution> {
        schema.validate()?;
        let attempts = schema.retry_count().max(1);
        let deadline = Duration::from_millis(schema.timeout_ms());

        let mut last_err = CoreError::OracleTimeout;
        for attempt in 1..=attempts {
            match timeout(deadline, self.fetch(schema)).await {
                Ok(Ok(raw)) => return self.evaluate(schema, raw),
                Ok(Err(err)) if err.is_retryable_oracle() => {
                    warn!(attempt, error = %err, "oracle request failed");
                    last_err = err;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    warn!(attempt, "oracle request timed out");
                    last_err = CoreError::OracleTimeout;
                }
            }

            if attempt < attempts {
                let delay = self.policy.delay_ms(attempt);
                info!(attempt, delay_ms = delay, "retrying oracle request");
                sleep(Duration::from_millis(delay)).await;
            }
        }
        Err(last_err)
    }

    /// Evaluate an already-fetched body. Pure; used by tests and by
    /// `oracle.resolved` replays.
    pub fn evaluate(&self, schema: &ResolutionSchema, raw: Value) -> CoreResult<Resolution> {
        let selected = select(&raw, schema.json_path())?;
        let outcome = evaluate_condition(schema.condition(), selected)?;
        Ok(Resolution {
            outcome,
            evaluated_value: selected.cloned(),
            raw_data: raw,
        })
    }

    async fn fetch(&self, schema: &ResolutionSchema) -> CoreResult<Value> {
        let request = match schema {
            ResolutionSchema::HttpJson {
                source_url,
                method,
                headers,
                body,
                ..
            } => {
                let mut req = match method {
                    HttpMethod::Get => self.client.get(source_url),
                    HttpMethod::Post => self.client.post(source_url),
                };
                if let Some(headers) = headers {
                    for (name, value) in headers {
                        req = req.header(name.as_str(), value.as_str());
                    }
                }
                if let Some(body) = body {
                    req = req.json(body);
                }
                req
            }
            ResolutionSchema::Graphql {
                endpoint,
                query,
                variables,
                ..
            } => self.client.post(endpoint).json(&serde_json::json!({
                "query": query,
                "variables": variables.clone().unwrap_or(Value::Null),
            })),
        };

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(CoreError::OracleHttpError { status });
        }
        response.json::<Value>().await.map_err(map_reqwest_error)
    }
}

impl Default for OracleResolver {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

fn map_reqwest_error(err: reqwest::Error) -> CoreError {
    if err.is_timeout() {
        CoreError::OracleTimeout
    } else if let Some(status) = err.status() {
        CoreError::OracleHttpError {
            status: status.as_u16(),
        }
    } else {
        // Connection-level failure: retryable, modelled as a 5xx-class error
        CoreError::OracleHttpError { status: 0 }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A syntactically valid schema for tests that never hit the wire.
    pub fn manual_schema() -> ResolutionSchema {
        ResolutionSchema::HttpJson {
            source_url: "https://oracle.invalid/status".into(),
            method: HttpMethod::Get,
            headers: None,
            body: None,
            json_path: "$.data.status".into(),
            condition: Condition {
                operator: Operator::Eq,
                value: Some(Value::String("closed".into())),
            },
            retry_count: Some(1),
            timeout_ms: Some(1_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_round_trip() {
        let wire = json!({
            "type": "http_json",
            "source_url": "https://api.example.com/event",
            "method": "GET",
            "json_path": "$.data.status",
            "condition": { "operator": "eq", "value": "closed" },
            "retry_count": 3,
            "timeout_ms": 30000
        });
        let schema: ResolutionSchema = serde_json::from_value(wire).unwrap();
        assert_eq!(schema.retry_count(), 3);
        assert_eq!(schema.timeout_ms(), 30_000);
        schema.validate().unwrap();

        match &schema {
            ResolutionSchema::HttpJson { method, .. } => assert_eq!(*method, HttpMethod::Get),
            _ => panic!("expected http_json"),
        }
    }

    #[test]
    fn test_wire_format_defaults() {
        let wire = json!({
            "type": "graphql",
            "endpoint": "https://api.example.com/graphql",
            "query": "{ market { resolved } }",
            "json_path": "$.data.market.resolved",
            "condition": { "operator": "exists" }
        });
        let schema: ResolutionSchema = serde_json::from_value(wire).unwrap();
        assert_eq!(schema.retry_count(), DEFAULT_RETRY_COUNT);
        assert_eq!(schema.timeout_ms(), DEFAULT_TIMEOUT_MS);
        schema.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_value() {
        let wire = json!({
            "type": "http_json",
            "source_url": "https://api.example.com",
            "method": "GET",
            "json_path": "$.x",
            "condition": { "operator": "gt" }
        });
        let schema: ResolutionSchema = serde_json::from_value(wire).unwrap();
        assert!(matches!(
            schema.validate().unwrap_err(),
            CoreError::MalformedResolutionSchema(_)
        ));
    }

    #[test]
    fn test_select_nested_path() {
        let doc = json!({
            "data": {
                "items": [
                    { "name": "first" },
                    { "name": "second" }
                ],
                "count": 2
            }
        });
        assert_eq!(
            select(&doc, "$.data.items[1].name").unwrap(),
            Some(&json!("second"))
        );
        assert_eq!(select(&doc, "$.data.count").unwrap(), Some(&json!(2)));
        assert_eq!(select(&doc, "$.data.missing").unwrap(), None);
        assert_eq!(select(&doc, "$.data.items[9]").unwrap(), None);
        assert_eq!(select(&doc, "$").unwrap(), Some(&doc));
    }

    #[test]
    fn test_select_malformed_path() {
        let doc = json!({});
        assert!(select(&doc, "data.status").is_err());
        assert!(select(&doc, "$.items[x]").is_err());
    }

    fn eval(op: Operator, value: Option<Value>, selected: Option<&Value>) -> CoreResult<Outcome> {
        evaluate_condition(
            &Condition {
                operator: op,
                value,
            },
            selected,
        )
    }

    #[test]
    fn test_condition_operators() {
        let v = json!("closed");
        assert_eq!(
            eval(Operator::Eq, Some(json!("closed")), Some(&v)).unwrap(),
            Outcome::Yes
        );
        assert_eq!(
            eval(Operator::Neq, Some(json!("closed")), Some(&v)).unwrap(),
            Outcome::No
        );

        let n = json!(105_000);
        assert_eq!(
            eval(Operator::Gt, Some(json!(100_000)), Some(&n)).unwrap(),
            Outcome::Yes
        );
        assert_eq!(
            eval(Operator::Lte, Some(json!(100_000)), Some(&n)).unwrap(),
            Outcome::No
        );
        // Numeric coercion: 105000 == 105000.0
        assert_eq!(
            eval(Operator::Eq, Some(json!(105_000.0)), Some(&n)).unwrap(),
            Outcome::Yes
        );
    }

    #[test]
    fn test_condition_contains() {
        let s = json!("market closed early");
        assert_eq!(
            eval(Operator::Contains, Some(json!("closed")), Some(&s)).unwrap(),
            Outcome::Yes
        );

        let arr = json!(["a", "b"]);
        assert_eq!(
            eval(Operator::Contains, Some(json!("b")), Some(&arr)).unwrap(),
            Outcome::Yes
        );
        assert_eq!(
            eval(Operator::Contains, Some(json!("z")), Some(&arr)).unwrap(),
            Outcome::No
        );

        assert!(eval(Operator::Contains, Some(json!(1)), Some(&json!(5))).is_err());
    }

    #[test]
    fn test_condition_exists() {
        assert_eq!(eval(Operator::Exists, None, Some(&json!(1))).unwrap(), Outcome::Yes);
        assert_eq!(eval(Operator::Exists, None, None).unwrap(), Outcome::No);
    }

    #[test]
    fn test_missing_path_is_indeterminate() {
        let err = eval(Operator::Eq, Some(json!("x")), None).unwrap_err();
        assert!(matches!(err, CoreError::OracleIndeterminate(_)));
    }

    #[test]
    fn test_ordered_comparison_type_mismatch() {
        let err = eval(Operator::Gt, Some(json!(1)), Some(&json!("nope"))).unwrap_err();
        assert!(matches!(err, CoreError::OracleSchemaError(_)));
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay_ms(1), 100);
        assert_eq!(policy.base_delay_ms(2), 200);
        assert_eq!(policy.base_delay_ms(3), 400);
        // Capped at max_delay
        assert_eq!(policy.base_delay_ms(10), 10_000);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay_ms(2);
            assert!((180..=220).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn test_evaluate_is_pure() {
        let resolver = OracleResolver::default();
        let schema = test_support::manual_schema();
        let body = json!({ "data": { "status": "closed" } });

        let first = resolver.evaluate(&schema, body.clone()).unwrap();
        let second = resolver.evaluate(&schema, body.clone()).unwrap();
        assert_eq!(first.outcome, Outcome::Yes);
        assert_eq!(second.outcome, Outcome::Yes);
        assert_eq!(first.evaluated_value, Some(json!("closed")));
        assert_eq!(first.raw_data, body);

        let open = resolver
            .evaluate(&schema, json!({ "data": { "status": "open" } }))
            .unwrap();
        assert_eq!(open.outcome, Outcome::No);
    }
}

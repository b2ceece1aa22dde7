//! Backend Response Documents
//!
//! Typed view over search responses. Buckets are parsed from raw JSON so
//! that any named entry carrying `buckets` becomes a nested bucket list and
//! any entry carrying `value` becomes a single metric value; everything
//! else the backend adds (`key_as_string`, error bounds, ...) is ignored.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One aggregation bucket
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct Bucket {
    pub key: String,
    pub doc_count: u64,
    /// Named sub-aggregation results
    pub aggregations: BTreeMap<String, AggregationResult>,
}

/// Result of a named aggregation
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationResult {
    /// Multi-bucket aggregation (terms, filters)
    Buckets(Vec<Bucket>),
    /// Single-value metric aggregation, `None` when there was nothing to aggregate
    Value(Option<f64>),
}

impl Bucket {
    pub fn new(key: impl Into<String>, doc_count: u64) -> Self {
        Self {
            key: key.into(),
            doc_count,
            aggregations: BTreeMap::new(),
        }
    }

    pub fn with_buckets(mut self, name: impl Into<String>, buckets: Vec<Bucket>) -> Self {
        self.aggregations
            .insert(name.into(), AggregationResult::Buckets(buckets));
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.aggregations
            .insert(name.into(), AggregationResult::Value(Some(value)));
        self
    }

    /// Sub-aggregation buckets by name
    pub fn buckets(&self, name: &str) -> Option<&[Bucket]> {
        match self.aggregations.get(name) {
            Some(AggregationResult::Buckets(buckets)) => Some(buckets),
            _ => None,
        }
    }

    /// Single metric value by name
    pub fn value(&self, name: &str) -> Option<f64> {
        match self.aggregations.get(name) {
            Some(AggregationResult::Value(value)) => *value,
            _ => None,
        }
    }

    fn from_object(key: Option<String>, object: Map<String, Value>) -> Result<Self, String> {
        let keyed = key.is_some();
        let mut bucket = Bucket::new(key.unwrap_or_default(), 0);

        for (name, value) in object {
            match name.as_str() {
                "key" => {
                    if !keyed {
                        bucket.key = key_to_string(&value)?;
                    }
                }
                "doc_count" => {
                    bucket.doc_count = value
                        .as_u64()
                        .ok_or_else(|| format!("invalid doc_count: {}", value))?;
                }
                _ => {
                    if let Some(result) = AggregationResult::from_value(value)? {
                        bucket.aggregations.insert(name, result);
                    }
                }
            }
        }

        Ok(bucket)
    }
}

impl TryFrom<Value> for Bucket {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(object) => Bucket::from_object(None, object),
            other => Err(format!("expected bucket object, got {}", other)),
        }
    }
}

fn key_to_string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("unsupported bucket key: {}", other)),
    }
}

impl AggregationResult {
    /// Interpret a named entry; `Ok(None)` when it is not an aggregation result
    fn from_value(value: Value) -> Result<Option<Self>, String> {
        let Value::Object(mut object) = value else {
            return Ok(None);
        };

        if let Some(buckets) = object.remove("buckets") {
            let buckets = match buckets {
                Value::Array(items) => items
                    .into_iter()
                    .map(Bucket::try_from)
                    .collect::<Result<Vec<_>, _>>()?,
                // Keyed form used by filters aggregations
                Value::Object(keyed) => keyed
                    .into_iter()
                    .map(|(key, item)| match item {
                        Value::Object(inner) => Bucket::from_object(Some(key), inner),
                        other => Err(format!("expected bucket object, got {}", other)),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                other => return Err(format!("invalid buckets: {}", other)),
            };
            return Ok(Some(Self::Buckets(buckets)));
        }

        if let Some(value) = object.remove("value") {
            return Ok(Some(Self::Value(value.as_f64())));
        }

        Ok(None)
    }
}

/// One search result of a multi-search
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct SearchResponse {
    pub took: Option<u64>,
    pub timed_out: bool,
    pub aggregations: BTreeMap<String, AggregationResult>,
    /// Reason reported when this item of the multi-search failed
    pub error: Option<String>,
}

impl SearchResponse {
    pub fn with_buckets(mut self, name: impl Into<String>, buckets: Vec<Bucket>) -> Self {
        self.aggregations
            .insert(name.into(), AggregationResult::Buckets(buckets));
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.aggregations
            .insert(name.into(), AggregationResult::Value(Some(value)));
        self
    }

    pub fn buckets(&self, name: &str) -> Option<&[Bucket]> {
        match self.aggregations.get(name) {
            Some(AggregationResult::Buckets(buckets)) => Some(buckets),
            _ => None,
        }
    }

    /// Take ownership of a top-level bucket list
    pub fn take_buckets(&mut self, name: &str) -> Option<Vec<Bucket>> {
        match self.aggregations.remove(name) {
            Some(AggregationResult::Buckets(buckets)) => Some(buckets),
            Some(other) => {
                self.aggregations.insert(name.to_string(), other);
                None
            }
            None => None,
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        match self.aggregations.get(name) {
            Some(AggregationResult::Value(value)) => *value,
            _ => None,
        }
    }
}

impl TryFrom<Value> for SearchResponse {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(object) = value else {
            return Err(format!("expected response object, got {}", value));
        };

        let mut response = SearchResponse::default();
        for (name, value) in object {
            match name.as_str() {
                "took" => response.took = value.as_u64(),
                "timed_out" => response.timed_out = value.as_bool().unwrap_or(false),
                "error" => response.error = Some(error_reason(&value)),
                "aggregations" => {
                    if let Value::Object(aggregations) = value {
                        for (agg_name, agg_value) in aggregations {
                            if let Some(result) = AggregationResult::from_value(agg_value)? {
                                response.aggregations.insert(agg_name, result);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(response)
    }
}

fn error_reason(value: &Value) -> String {
    value
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Envelope of a multi-search reply, one response per request pair
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MultiSearchResponse {
    #[serde(default)]
    pub responses: Vec<SearchResponse>,
}

use std::collections::BTreeSet;

use serde_json::Value;
use serde_json_path::JsonPath;

use super::MatchKeyError;

/// JSONPath match key
///
/// Every string or number the expression selects becomes a key. Objects,
/// arrays, booleans and nulls are skipped.
#[derive(Debug, Clone)]
pub struct JsonPathKey {
    expr: String,
    path: JsonPath,
}

impl JsonPathKey {
    pub fn configure(params: &Value) -> Result<Self, MatchKeyError> {
        let expr = params
            .get("expr")
            .and_then(Value::as_str)
            .ok_or_else(|| MatchKeyError::Configuration("jsonpath: expr must be given".to_string()))?;

        let path = JsonPath::parse(expr).map_err(|e| {
            MatchKeyError::Configuration(format!("jsonpath: invalid expression `{expr}`: {e}"))
        })?;

        Ok(Self {
            expr: expr.to_string(),
            path,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn keys(&self, payload: &Value, keys: &mut BTreeSet<String>) {
        for node in self.path.query(payload).all() {
            match node {
                Value::String(s) => {
                    keys.insert(s.clone());
                },
                Value::Number(n) => {
                    keys.insert(n.to_string());
                },
                _ => {},
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(expr: &str, payload: Value) -> BTreeSet<String> {
        let key = JsonPathKey::configure(&json!({ "expr": expr })).unwrap();
        let mut keys = BTreeSet::new();
        key.keys(&payload, &mut keys);
        keys
    }

    #[test]
    fn test_array_of_scalars() {
        let result = keys(
            "$.identifiers[*].isbn",
            json!({"identifiers": [{"isbn": "A"}, {"isbn": "B"}]}),
        );
        assert_eq!(result, BTreeSet::from(["A".to_string(), "B".to_string()]));
    }

    #[test]
    fn test_object_match_is_excluded() {
        let result = keys("$.matchKey", json!({"matchKey": {"title": "x"}}));
        assert!(result.is_empty());

        let result = keys("$.identifiers", json!({"identifiers": [{"isbn": "A"}]}));
        assert!(result.is_empty());
    }

    #[test]
    fn test_numbers_and_booleans() {
        let result = keys("$.values[*]", json!({"values": [7, 2.5, true, null, "s"]}));
        assert_eq!(
            result,
            BTreeSet::from(["7".to_string(), "2.5".to_string(), "s".to_string()])
        );
    }

    #[test]
    fn test_marc_in_json_expression() {
        let payload = json!({"marc": {"fields": [
            {"001": "a1"},
            {"020": {"subfields": [{"a": "978-1"}, {"c": "price"}]}},
            {"020": {"subfields": [{"a": "978-2"}]}}
        ]}});
        let result = keys("$.marc.fields[*]['020'].subfields[*].a", payload);
        assert_eq!(result, BTreeSet::from(["978-1".to_string(), "978-2".to_string()]));
    }

    #[test]
    fn test_no_match_is_empty() {
        assert!(keys("$.missing", json!({"id": 1})).is_empty());
    }

    #[test]
    fn test_configuration_errors() {
        let err = JsonPathKey::configure(&json!({})).unwrap_err();
        assert_eq!(err.to_string(), "jsonpath: expr must be given");

        let err = JsonPathKey::configure(&json!({"expr": "$.fields[x"})).unwrap_err();
        assert!(matches!(err, MatchKeyError::Configuration(_)));
    }
}

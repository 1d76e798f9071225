//! Structured MARC document
//!
//! Field and subfield order is significant and repeated tags or codes are
//! kept as they appear.

use serde_json::{Map, Value};

use super::CodecError;

/// Up to nine indicator positions (`ind1`..`ind9`)
pub const MAX_INDICATORS: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarcDocument {
    pub leader: Option<String>,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Control(ControlField),
    Data(DataField),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlField {
    pub tag: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataField {
    pub tag: String,
    pub indicators: Indicators,
    pub subfields: Vec<Subfield>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subfield {
    pub code: String,
    pub value: String,
}

/// Indicator values keyed by 1-based position; unset positions are absent
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Indicators([Option<String>; MAX_INDICATORS]);

impl Indicators {
    pub fn new(ind1: Option<&str>, ind2: Option<&str>) -> Self {
        let mut indicators = Self::default();
        indicators.set(1, ind1);
        indicators.set(2, ind2);
        indicators
    }

    /// Value at 1-based `position`
    pub fn get(&self, position: usize) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|i| self.0.get(i))
            .and_then(|v| v.as_deref())
    }

    /// Set or clear the value at 1-based `position`; out of range is ignored
    pub fn set(&mut self, position: usize, value: Option<&str>) {
        if let Some(slot) = position.checked_sub(1).and_then(|i| self.0.get_mut(i)) {
            *slot = value.map(str::to_string);
        }
    }

    /// Set positions in order, as `(position, value)`
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_deref().map(|v| (i + 1, v)))
    }

    /// Parse an attribute name of the form `indN`
    pub fn position(name: &str) -> Option<usize> {
        let n: usize = name.strip_prefix("ind")?.parse().ok()?;
        (1..=MAX_INDICATORS).contains(&n).then_some(n)
    }
}

impl Field {
    pub fn tag(&self) -> &str {
        match self {
            Field::Control(f) => &f.tag,
            Field::Data(f) => &f.tag,
        }
    }
}

impl DataField {
    pub fn new(tag: &str, indicators: Indicators) -> Self {
        Self {
            tag: tag.to_string(),
            indicators,
            subfields: Vec::new(),
        }
    }

    /// Field with the first two indicators set
    pub fn with_indicators(tag: &str, ind1: Option<&str>, ind2: Option<&str>) -> Self {
        Self::new(tag, Indicators::new(ind1, ind2))
    }

    pub fn with_subfield(mut self, code: &str, value: &str) -> Self {
        self.push_subfield(code, value);
        self
    }

    pub fn push_subfield(&mut self, code: &str, value: &str) -> &mut Self {
        self.subfields.push(Subfield {
            code: code.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// First value for `code`
    pub fn subfield(&self, code: &str) -> Option<&str> {
        self.subfields
            .iter()
            .find(|s| s.code == code)
            .map(|s| s.value.as_str())
    }

    fn matches(&self, tag: &str, ind1: Option<&str>, ind2: Option<&str>) -> bool {
        self.tag == tag
            && ind1.is_none_or(|i| self.indicators.get(1) == Some(i))
            && ind2.is_none_or(|i| self.indicators.get(2) == Some(i))
    }
}

impl MarcDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_control_field(&mut self, tag: &str, value: &str) {
        self.fields.push(Field::Control(ControlField {
            tag: tag.to_string(),
            value: value.to_string(),
        }));
    }

    /// Insert a data field keeping fields ordered by tag
    ///
    /// The new field goes after any existing fields with the same tag, so
    /// repeated inserts keep their call order.
    pub fn insert_data_field(&mut self, field: DataField) {
        let index = self
            .fields
            .iter()
            .position(|f| f.tag() > field.tag.as_str())
            .unwrap_or(self.fields.len());

        self.fields.insert(index, Field::Data(field));
    }

    /// First data field with `tag` whose first two indicators match when given
    pub fn lookup_data_field(
        &self,
        tag: &str,
        ind1: Option<&str>,
        ind2: Option<&str>,
    ) -> Option<&DataField> {
        self.data_fields().find(|f| f.matches(tag, ind1, ind2))
    }

    /// Remove every field with `tag`, returning how many were removed
    pub fn remove_fields(&mut self, tag: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|f| f.tag() != tag);
        before - self.fields.len()
    }

    pub fn data_fields(&self) -> impl Iterator<Item = &DataField> {
        self.fields.iter().filter_map(|f| match f {
            Field::Data(d) => Some(d),
            Field::Control(_) => None,
        })
    }

    pub fn control_field(&self, tag: &str) -> Option<&str> {
        self.fields.iter().find_map(|f| match f {
            Field::Control(c) if c.tag == tag => Some(c.value.as_str()),
            _ => None,
        })
    }

    /// MARC-in-JSON form
    ///
    /// `fields` is omitted when the document has none.
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();

        if let Some(leader) = &self.leader {
            root.insert("leader".to_string(), Value::String(leader.clone()));
        }

        if !self.fields.is_empty() {
            let fields = self.fields.iter().map(field_to_json).collect();
            root.insert("fields".to_string(), Value::Array(fields));
        }

        Value::Object(root)
    }

    /// Parse the MARC-in-JSON form
    pub fn from_json(value: &Value) -> Result<Self, CodecError> {
        let root = value
            .as_object()
            .ok_or_else(|| invalid("document must be an object"))?;

        let leader = match root.get("leader") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(invalid("leader must be a string")),
        };

        let fields = match root.get("fields") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .map(field_from_json)
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(invalid("fields must be an array")),
        };

        Ok(Self { leader, fields })
    }
}

fn field_to_json(field: &Field) -> Value {
    let mut entry = Map::new();

    match field {
        Field::Control(c) => {
            entry.insert(c.tag.clone(), Value::String(c.value.clone()));
        },
        Field::Data(d) => {
            let mut body = Map::new();
            for (position, value) in d.indicators.iter() {
                body.insert(format!("ind{position}"), Value::String(value.to_string()));
            }
            let subfields = d
                .subfields
                .iter()
                .map(|s| {
                    let mut sub = Map::new();
                    sub.insert(s.code.clone(), Value::String(s.value.clone()));
                    Value::Object(sub)
                })
                .collect();
            body.insert("subfields".to_string(), Value::Array(subfields));
            entry.insert(d.tag.clone(), Value::Object(body));
        },
    }

    Value::Object(entry)
}

fn field_from_json(entry: &Value) -> Result<Field, CodecError> {
    let (tag, body) = single_entry(entry, "field")?;

    match body {
        Value::String(value) => Ok(Field::Control(ControlField {
            tag: tag.clone(),
            value: value.clone(),
        })),
        Value::Object(body) => {
            let mut indicators = Indicators::default();
            for (key, value) in body {
                if let Some(position) = Indicators::position(key) {
                    let value = value
                        .as_str()
                        .ok_or_else(|| invalid(&format!("{tag} {key} must be a string")))?;
                    indicators.set(position, Some(value));
                }
            }

            let mut field = DataField::new(tag, indicators);
            if let Some(subfields) = body.get("subfields") {
                let subfields = subfields
                    .as_array()
                    .ok_or_else(|| invalid(&format!("{tag} subfields must be an array")))?;
                for sub in subfields {
                    let (code, value) = single_entry(sub, "subfield")?;
                    let value = value
                        .as_str()
                        .ok_or_else(|| invalid(&format!("{tag} ${code} must be a string")))?;
                    field.push_subfield(code, value);
                }
            }

            Ok(Field::Data(field))
        },
        _ => Err(invalid(&format!("field {tag} must be a string or an object"))),
    }
}

fn single_entry<'a>(value: &'a Value, what: &str) -> Result<(&'a String, &'a Value), CodecError> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid(&format!("{what} must be an object")))?;
    let mut entries = object.iter();
    match (entries.next(), entries.next()) {
        (Some(entry), None) => Ok(entry),
        _ => Err(invalid(&format!("{what} must have exactly one key"))),
    }
}

fn invalid(message: &str) -> CodecError {
    CodecError::InvalidDocument(message.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> MarcDocument {
        let mut doc = MarcDocument::new();
        doc.leader = Some("00714cam a2200205 a 4500".to_string());
        doc.push_control_field("001", "a1");
        doc.insert_data_field(
            DataField::with_indicators("245", Some("1"), Some("0"))
                .with_subfield("a", "Title")
                .with_subfield("a", "Again"),
        );
        doc.insert_data_field(DataField::with_indicators("100", Some("1"), None).with_subfield("a", "Author"));
        doc
    }

    #[test]
    fn test_insert_keeps_tag_order() {
        let doc = sample();
        let tags: Vec<_> = doc.fields.iter().map(Field::tag).collect();
        assert_eq!(tags, vec!["001", "100", "245"]);
    }

    #[test]
    fn test_insert_after_equal_tags() {
        let mut doc = sample();
        doc.insert_data_field(DataField::with_indicators("999", Some("0"), Some("0")).with_subfield("l", "first"));
        doc.insert_data_field(DataField::with_indicators("999", Some("0"), Some("0")).with_subfield("l", "second"));
        doc.insert_data_field(DataField::with_indicators("500", None, None));

        let last: Vec<_> = doc
            .data_fields()
            .filter(|f| f.tag == "999")
            .map(|f| f.subfield("l").unwrap())
            .collect();
        assert_eq!(last, vec!["first", "second"]);
        assert_eq!(doc.fields[3].tag(), "500");
    }

    #[test]
    fn test_lookup_by_indicators() {
        let mut doc = sample();
        doc.insert_data_field(DataField::with_indicators("999", Some("0"), Some("0")).with_subfield("l", "member"));
        doc.insert_data_field(DataField::with_indicators("999", Some("1"), Some("0")).with_subfield("i", "cluster"));

        assert_eq!(
            doc.lookup_data_field("999", Some("1"), Some("0")).unwrap().subfield("i"),
            Some("cluster")
        );
        assert_eq!(
            doc.lookup_data_field("999", None, None).unwrap().subfield("l"),
            Some("member")
        );
        assert!(doc.lookup_data_field("999", Some("2"), None).is_none());
    }

    #[test]
    fn test_remove_fields() {
        let mut doc = sample();
        doc.insert_data_field(DataField::with_indicators("999", None, None));
        doc.insert_data_field(DataField::with_indicators("999", None, None));
        assert_eq!(doc.remove_fields("999"), 2);
        assert_eq!(doc.remove_fields("999"), 0);
        assert_eq!(doc.fields.len(), 3);
    }

    #[test]
    fn test_to_json_shape() {
        let json = sample().to_json();
        assert_eq!(
            json,
            json!({
                "leader": "00714cam a2200205 a 4500",
                "fields": [
                    {"001": "a1"},
                    {"100": {"ind1": "1", "subfields": [{"a": "Author"}]}},
                    {"245": {"ind1": "1", "ind2": "0", "subfields": [{"a": "Title"}, {"a": "Again"}]}}
                ]
            })
        );
    }

    #[test]
    fn test_empty_document_omits_fields() {
        assert_eq!(MarcDocument::new().to_json(), json!({}));
    }

    #[test]
    fn test_from_json_inverse() {
        let doc = sample();
        assert_eq!(MarcDocument::from_json(&doc.to_json()).unwrap(), doc);
    }

    #[test]
    fn test_from_json_high_indicators() {
        let doc = MarcDocument::from_json(&json!({
            "fields": [{"900": {"ind3": "x", "subfields": []}}]
        }))
        .unwrap();
        let field = doc.lookup_data_field("900", None, None).unwrap();
        assert_eq!(field.indicators.get(3), Some("x"));
        assert_eq!(field.indicators.get(1), None);
    }

    #[test]
    fn test_from_json_rejects_bad_shapes() {
        assert!(MarcDocument::from_json(&json!([])).is_err());
        assert!(MarcDocument::from_json(&json!({"fields": {}})).is_err());
        assert!(MarcDocument::from_json(&json!({"fields": [{"001": "a", "002": "b"}]})).is_err());
        assert!(MarcDocument::from_json(&json!({"fields": [{"245": {"subfields": [{"a": 1}]}}]}))
            .is_err());
    }

    #[test]
    fn test_indicator_position() {
        assert_eq!(Indicators::position("ind1"), Some(1));
        assert_eq!(Indicators::position("ind9"), Some(9));
        assert_eq!(Indicators::position("ind0"), None);
        assert_eq!(Indicators::position("ind10"), None);
        assert_eq!(Indicators::position("tag"), None);
    }
}

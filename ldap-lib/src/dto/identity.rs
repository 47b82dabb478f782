use serde_json::{Map, Value};

/// JSON pointer to the flag marking a schema trait as a password identifier,
/// relative to the trait definition (`/` in the extension key escaped as `~1`).
const IDENTIFIER_FLAG_POINTER: &str = "/ory.sh~1kratos/credentials/password/identifier";

/// A Kratos identity as returned by the admin API. Traits keep the order Kratos sent them in.
#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub schema_id: String,
    #[serde(default)]
    pub traits: Map<String, Value>,
}

impl Identity {
    pub fn trait_value(&self, key: &str) -> Option<TraitValue<'_>> {
        self.traits.get(key).map(TraitValue::from)
    }

    pub fn trait_values(&self) -> impl Iterator<Item = (&str, TraitValue<'_>)> {
        self.traits.iter().map(|(key, value)| (key.as_str(), TraitValue::from(value)))
    }
}

/// An identity schema, keyed by its id when fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub id: String,
    pub definition: Value,
}

/// A single value of an identity trait. Anything that is not a JSON array is a scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraitValue<'a> {
    Sequence(&'a [Value]),
    Scalar(&'a Value),
}

impl<'a> From<&'a Value> for TraitValue<'a> {
    fn from(value: &'a Value) -> Self {
        match value {
            Value::Array(values) => TraitValue::Sequence(values),
            other => TraitValue::Scalar(other),
        }
    }
}

impl<'a> TraitValue<'a> {
    /// The first value of this trait: the scalar itself, or the first element of a sequence.
    pub fn first(&self) -> Option<&'a Value> {
        match *self {
            TraitValue::Sequence(values) => values.first(),
            TraitValue::Scalar(value) => Some(value),
        }
    }

    /// All values of this trait in their LDAP string representation. Nulls are dropped.
    pub fn attribute_values(&self) -> Vec<String> {
        match *self {
            TraitValue::Sequence(values) => values.iter().filter_map(render).collect(),
            TraitValue::Scalar(value) => render(value).into_iter().collect(),
        }
    }
}

/// Strings are used verbatim, nested objects and other scalars as their JSON text.
fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Values that cannot identify anybody: null, false, zero and the empty string.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn is_identifier_trait(definition: &Value) -> bool {
    // Array-typed traits carry the flag on their item definition.
    let definition = definition.get("items").unwrap_or(definition);
    definition.pointer(IDENTIFIER_FLAG_POINTER) == Some(&Value::Bool(true))
}

/// The keys of all traits the schema declares as identifiers, in declaration order.
pub fn identifier_traits_of(schema: &Schema) -> Vec<String> {
    schema
        .definition
        .pointer("/properties/traits/properties")
        .and_then(Value::as_object)
        .map(|traits| {
            traits
                .iter()
                .filter(|(_, definition)| is_identifier_trait(definition))
                .map(|(key, _)| key.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// The value identifying this identity: the first non-blank value over all identifier traits.
pub fn identifier_of(identity: &Identity, schema: &Schema) -> Option<String> {
    identifier_traits_of(schema)
        .iter()
        .filter_map(|key| identity.trait_value(key)?.first())
        .find(|value| !is_blank(value))
        .and_then(render)
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{test_util::*, *};

    #[test]
    fn identifier_traits_keep_declaration_order() {
        let schema = schema_with_identifiers("default", &["username", "email", "emails"]);

        assert_eq!(identifier_traits_of(&schema), vec!["username", "email", "emails"]);
    }

    #[test]
    fn schema_without_traits_has_no_identifiers() {
        let schema = Schema {
            id: "empty".to_string(),
            definition: json!({ "type": "object" }),
        };

        assert!(identifier_traits_of(&schema).is_empty());
    }

    #[test]
    fn identifier_flag_must_be_true() {
        let schema = Schema {
            id: "default".to_string(),
            definition: json!({ "properties": { "traits": { "properties": {
                "email": { "ory.sh/kratos": { "credentials": { "password": { "identifier": "true" } } } }
            } } } }),
        };

        assert!(identifier_traits_of(&schema).is_empty());
    }

    #[test]
    fn identifier_from_scalar_trait() {
        let schema = schema_with_identifiers("default", &["email"]);
        let identity = identity("1", "default", json!({ "email": "alice@example.org", "name": "Alice" }));

        assert_eq!(identifier_of(&identity, &schema), Some("alice@example.org".to_string()));
    }

    #[test]
    fn identifier_from_first_element_of_sequence_trait() {
        let schema = schema_with_identifiers("default", &["emails"]);
        let identity = identity("1", "default", json!({ "emails": ["first@example.org", "second@example.org"] }));

        assert_eq!(identifier_of(&identity, &schema), Some("first@example.org".to_string()));
    }

    #[test]
    fn empty_identifier_falls_through_to_next_trait() {
        let schema = schema_with_identifiers("default", &["username", "email"]);
        let identity = identity("1", "default", json!({ "username": "", "email": "bob@example.org" }));

        assert_eq!(identifier_of(&identity, &schema), Some("bob@example.org".to_string()));
    }

    #[test]
    fn no_identifier_when_all_values_empty() {
        let schema = schema_with_identifiers("default", &["username", "emails"]);
        let identity = identity("1", "default", json!({ "username": null, "emails": [], "name": "Nobody" }));

        assert_eq!(identifier_of(&identity, &schema), None);
    }

    #[test]
    fn attribute_values_render_scalars() {
        let identity = identity("1", "default", json!({ "age": 42, "tags": ["a", null, "b"], "nested": { "x": 1 } }));

        assert_eq!(identity.trait_value("age").unwrap().attribute_values(), vec!["42"]);
        assert_eq!(identity.trait_value("tags").unwrap().attribute_values(), vec!["a", "b"]);
        assert_eq!(identity.trait_value("nested").unwrap().attribute_values(), vec![r#"{"x":1}"#]);
    }

    #[rstest::rstest]
    #[case::false_flag(json!(false))]
    #[case::zero(json!(0))]
    #[case::zero_float(json!(0.0))]
    #[case::empty_string(json!(""))]
    #[case::null(json!(null))]
    fn blank_identifier_falls_through_to_next_trait(#[case] blank: Value) {
        let schema = schema_with_identifiers("default", &["username", "email"]);
        let identity = identity("1", "default", json!({ "username": blank, "email": "bob@example.org" }));

        assert_eq!(identifier_of(&identity, &schema), Some("bob@example.org".to_string()));
    }

    #[test]
    fn non_zero_number_identifies() {
        let schema = schema_with_identifiers("default", &["username"]);
        let identity = identity("1", "default", json!({ "username": 1001 }));

        assert_eq!(identifier_of(&identity, &schema), Some("1001".to_string()));
    }

    #[test]
    fn traits_keep_provider_order() {
        let identity = identity("1", "default", json!({ "zeta": "z", "alpha": "a", "mid": "m" }));

        let keys: Vec<&str> = identity.trait_values().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }
}

//! Document types, the per-type schema registry, and strict-schema derivation.
//!
//! Each supported document type carries a default JSON Schema describing the
//! structured result, the name of its repeating array field (when it has
//! one), and the composite key used to deduplicate rows across tiles.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Supported document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocType {
    Invoice,
    BankStatement,
    LoanContract,
    Drawdown,
}

impl DocType {
    /// Parse the wire string used by the upload collaborator.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invoice" => Some(Self::Invoice),
            "bankStatement" => Some(Self::BankStatement),
            "loanContract" => Some(Self::LoanContract),
            "drawdown" => Some(Self::Drawdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::BankStatement => "bankStatement",
            Self::LoanContract => "loanContract",
            Self::Drawdown => "drawdown",
        }
    }

    /// The top-level array field holding the repeating rows, if any.
    /// Loan contracts are a single flat record.
    pub fn array_field(&self) -> Option<&'static str> {
        match self {
            Self::Invoice => Some("invoiceRows"),
            Self::BankStatement => Some("transactions"),
            Self::LoanContract => None,
            Self::Drawdown => Some("drawdowns"),
        }
    }

    /// Fields forming the composite dedup key for rows of this type.
    pub fn dedup_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Invoice => &["invoiceNumber"],
            Self::BankStatement => &["date", "description", "amount"],
            Self::LoanContract => &["contractNumber"],
            Self::Drawdown => &["variableSymbol", "invoiceNumber"],
        }
    }

    /// Whether tiling defaults to on for this type. Drawdown schedules are
    /// dense multi-row tables; the other types are short enough to read whole.
    pub fn tiling_default(&self) -> bool {
        matches!(self, Self::Drawdown)
    }

    /// Names of the field validators configured for this type.
    pub fn validators(&self) -> &'static [&'static str] {
        match self {
            Self::Drawdown => &["iban"],
            _ => &[],
        }
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default extraction schema for a document type.
///
/// Callers may override this with `customSchema`; the registry value is the
/// fallback the upload collaborator relies on.
pub fn registry_schema(doc_type: DocType) -> Value {
    match doc_type {
        DocType::Drawdown => json!({
            "type": "object",
            "properties": {
                "drawdowns": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "invoiceNumber": { "type": "string" },
                            "variableSymbol": { "type": "string" },
                            "amount": { "type": "number" },
                            "iban": { "type": "string" },
                            "dueDate": { "type": "string" }
                        }
                    }
                },
                "totalSum": { "type": "number" },
                "currency": { "type": "string" }
            }
        }),
        DocType::Invoice => json!({
            "type": "object",
            "properties": {
                "invoiceNumber": { "type": "string" },
                "variableSymbol": { "type": "string" },
                "issueDate": { "type": "string" },
                "dueDate": { "type": "string" },
                "supplierName": { "type": "string" },
                "supplierId": { "type": "string" },
                "customerName": { "type": "string" },
                "iban": { "type": "string" },
                "invoiceRows": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": { "type": "string" },
                            "quantity": { "type": "number" },
                            "unitPrice": { "type": "number" },
                            "total": { "type": "number" }
                        }
                    }
                },
                "totalAmount": { "type": "number" },
                "currency": { "type": "string" }
            }
        }),
        DocType::BankStatement => json!({
            "type": "object",
            "properties": {
                "accountIban": { "type": "string" },
                "statementNumber": { "type": "string" },
                "periodFrom": { "type": "string" },
                "periodTo": { "type": "string" },
                "openingBalance": { "type": "number" },
                "closingBalance": { "type": "number" },
                "currency": { "type": "string" },
                "transactions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "date": { "type": "string" },
                            "description": { "type": "string" },
                            "amount": { "type": "number" },
                            "counterpartyIban": { "type": "string" },
                            "variableSymbol": { "type": "string" }
                        }
                    }
                }
            }
        }),
        DocType::LoanContract => json!({
            "type": "object",
            "properties": {
                "contractNumber": { "type": "string" },
                "borrowerName": { "type": "string" },
                "borrowerId": { "type": "string" },
                "lenderName": { "type": "string" },
                "principal": { "type": "number" },
                "currency": { "type": "string" },
                "interestRate": { "type": "number" },
                "signedDate": { "type": "string" },
                "maturityDate": { "type": "string" },
                "iban": { "type": "string" }
            }
        }),
    }
}

/// Derive the strict variant of a JSON Schema for server-side structured
/// output: every object node gets `additionalProperties: false` and a
/// `required` list covering all of its properties. Idempotent.
///
/// The untransformed schema is still the one embedded into prompt text;
/// strictness is an API-level contract, not an instruction to the model.
pub fn strict_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len() + 2);
            for (k, v) in map {
                let transformed = match k.as_str() {
                    "properties" => transform_properties(v),
                    "items" => strict_schema(v),
                    _ => v.clone(),
                };
                out.insert(k.clone(), transformed);
            }
            if map.get("type").and_then(Value::as_str) == Some("object") {
                out.insert("additionalProperties".into(), Value::Bool(false));
                let required: Vec<Value> = map
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| props.keys().cloned().map(Value::String).collect())
                    .unwrap_or_default();
                out.insert("required".into(), Value::Array(required));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn transform_properties(props: &Value) -> Value {
    match props {
        Value::Object(map) => {
            let transformed = map
                .iter()
                .map(|(k, v)| (k.clone(), strict_schema(v)))
                .collect();
            Value::Object(transformed)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_types() {
        assert_eq!(DocType::parse("invoice"), Some(DocType::Invoice));
        assert_eq!(DocType::parse("bankStatement"), Some(DocType::BankStatement));
        assert_eq!(DocType::parse("loanContract"), Some(DocType::LoanContract));
        assert_eq!(DocType::parse("drawdown"), Some(DocType::Drawdown));
        assert_eq!(DocType::parse("receipt"), None);
    }

    #[test]
    fn array_fields_match_registry() {
        for dt in [
            DocType::Invoice,
            DocType::BankStatement,
            DocType::Drawdown,
        ] {
            let field = dt.array_field().unwrap();
            let schema = registry_schema(dt);
            assert!(
                schema["properties"][field].is_object(),
                "{dt} schema missing {field}"
            );
        }
        assert_eq!(DocType::LoanContract.array_field(), None);
    }

    #[test]
    fn only_drawdown_tiles_by_default() {
        assert!(DocType::Drawdown.tiling_default());
        assert!(!DocType::Invoice.tiling_default());
        assert!(!DocType::BankStatement.tiling_default());
        assert!(!DocType::LoanContract.tiling_default());
    }

    #[test]
    fn strict_marks_every_object_node() {
        let strict = strict_schema(&registry_schema(DocType::Drawdown));

        assert_eq!(strict["additionalProperties"], Value::Bool(false));
        let required: Vec<&str> = strict["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(required.contains(&"drawdowns"));
        assert!(required.contains(&"totalSum"));

        let item = &strict["properties"]["drawdowns"]["items"];
        assert_eq!(item["additionalProperties"], Value::Bool(false));
        let item_required = item["required"].as_array().unwrap();
        assert_eq!(item_required.len(), 5);
    }

    #[test]
    fn strict_is_idempotent() {
        for dt in [
            DocType::Invoice,
            DocType::BankStatement,
            DocType::LoanContract,
            DocType::Drawdown,
        ] {
            let once = strict_schema(&registry_schema(dt));
            let twice = strict_schema(&once);
            assert_eq!(once, twice, "strict(strict(S)) != strict(S) for {dt}");
        }
    }

    #[test]
    fn strict_leaves_non_object_nodes_alone() {
        let schema = json!({ "type": "string" });
        assert_eq!(strict_schema(&schema), schema);

        let schema = json!({ "type": "array", "items": { "type": "number" } });
        let strict = strict_schema(&schema);
        assert_eq!(strict["items"]["type"], "number");
        assert!(strict.get("additionalProperties").is_none());
    }

    #[test]
    fn strict_handles_object_without_properties() {
        let schema = json!({ "type": "object" });
        let strict = strict_schema(&schema);
        assert_eq!(strict["additionalProperties"], Value::Bool(false));
        assert_eq!(strict["required"], json!([]));
    }
}

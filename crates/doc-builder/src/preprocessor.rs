use crate::error::Result;
use serde_json::Value;

/// A single transformation stage applied to the raw upstream issue mapping
/// before field extraction.
///
/// Stages run in the order given by the `preprocessors` settings key. A
/// stage receives the whole issue and returns the (possibly rewritten)
/// issue; stages cannot register further stages, so the chain is always
/// finite.
pub trait IssuePreprocessor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, project_key: &str, issue: Value) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Uppercase;

    impl IssuePreprocessor for Uppercase {
        fn name(&self) -> &str {
            "uppercase_summary"
        }

        fn process(&self, _project_key: &str, mut issue: Value) -> Result<Value> {
            if let Some(summary) = issue
                .get_mut("fields")
                .and_then(|f| f.get_mut("summary"))
            {
                if let Some(text) = summary.as_str() {
                    *summary = Value::String(text.to_uppercase());
                }
            }
            Ok(issue)
        }
    }

    #[test]
    fn stage_rewrites_issue() {
        let issue = json!({"fields": {"summary": "hello"}});
        let out = Uppercase.process("ORG", issue).unwrap();
        assert_eq!(out, json!({"fields": {"summary": "HELLO"}}));
    }
}

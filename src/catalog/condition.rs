use crate::context::{DataContext, DataValue};

/// Evaluate a branch condition expression against the data context.
/// Supports: `data.key > N`, `data.key == "value"`, `data.key exists`,
/// `data.key != N`, and a bare truthy check `data.key`. The `data.` prefix
/// is optional.
pub fn evaluate(condition: &str, data: &DataContext) -> bool {
    let condition = condition.trim();

    // "data.key exists"
    if condition.ends_with(" exists") {
        let key = condition.trim_end_matches(" exists").trim();
        let key = key.strip_prefix("data.").unwrap_or(key);
        return data.resolve_path(key).is_some();
    }

    // Comparison operators
    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(pos) = condition.find(op) {
            let left = condition[..pos].trim();
            let right = condition[pos + op.len()..].trim();

            let left_key = left.strip_prefix("data.").unwrap_or(left);
            let left_val = data.resolve_path(left_key);

            return compare_values(left_val, op, right);
        }
    }

    // Bare truthy check: "data.key"
    let key = condition.strip_prefix("data.").unwrap_or(condition);
    match data.resolve_path(key) {
        Some(value) => value.is_truthy(),
        None => false,
    }
}

fn compare_values(left: Option<&DataValue>, op: &str, right: &str) -> bool {
    let left = match left {
        Some(v) => v,
        None => return op == "!=",
    };

    // Try numeric comparison
    if let Some(left_num) = left.as_f64()
        && let Ok(right_num) = right.parse::<f64>()
    {
        return match op {
            "==" => (left_num - right_num).abs() < f64::EPSILON,
            "!=" => (left_num - right_num).abs() >= f64::EPSILON,
            ">" => left_num > right_num,
            "<" => left_num < right_num,
            ">=" => left_num >= right_num,
            "<=" => left_num <= right_num,
            _ => false,
        };
    }

    // Boolean literals
    if let Some(left_bool) = left.as_bool()
        && let Ok(right_bool) = right.parse::<bool>()
    {
        return match op {
            "==" => left_bool == right_bool,
            "!=" => left_bool != right_bool,
            _ => false,
        };
    }

    // String comparison
    let left_str = match left.as_str() {
        Some(s) => s,
        None => return false,
    };

    let right_str = right.trim_matches('"').trim_matches('\'');

    match op {
        "==" => left_str == right_str,
        "!=" => left_str != right_str,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx() -> DataContext {
        let mut ctx = DataContext::new();
        ctx.seed("amount", DataValue::Decimal(150.0));
        ctx.seed("attempts", DataValue::Int(2));
        ctx.seed("approved", DataValue::Bool(true));
        let mut kyc = BTreeMap::new();
        kyc.insert("level".to_string(), DataValue::Text("verified".into()));
        ctx.seed("kyc", DataValue::Map(kyc));
        ctx
    }

    #[test]
    fn numeric_comparisons() {
        let ctx = ctx();
        assert!(evaluate("amount > 100", &ctx));
        assert!(evaluate("data.amount > 100", &ctx));
        assert!(!evaluate("amount > 200", &ctx));
        assert!(evaluate("attempts <= 2", &ctx));
        assert!(evaluate("amount != 151", &ctx));
    }

    #[test]
    fn string_and_bool_comparisons() {
        let ctx = ctx();
        assert!(evaluate("kyc.level == \"verified\"", &ctx));
        assert!(evaluate("kyc.level != 'rejected'", &ctx));
        assert!(evaluate("approved == true", &ctx));
        assert!(!evaluate("approved == false", &ctx));
    }

    #[test]
    fn exists_and_truthy() {
        let ctx = ctx();
        assert!(evaluate("kyc.level exists", &ctx));
        assert!(!evaluate("kyc.missing exists", &ctx));
        assert!(evaluate("approved", &ctx));
        assert!(!evaluate("missing_key", &ctx));
    }

    #[test]
    fn missing_key_satisfies_only_not_equal() {
        let ctx = ctx();
        assert!(evaluate("missing != 5", &ctx));
        assert!(!evaluate("missing == 5", &ctx));
        assert!(!evaluate("missing > 5", &ctx));
    }
}

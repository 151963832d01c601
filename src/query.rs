//! Query predicate matching and the aggregation pipeline (§4.6): the
//! operators a `QUERY` message's filter can use, and the
//! `$match`/`$project`/`$group`/`$sort`/`$limit`/`$skip` pipeline stages.

use std::cmp::Ordering;

use regex::Regex;

use crate::document::Value;
use crate::error::{NexaError, Result};

/// Tests `doc` against a query document: each top-level key is a (possibly
/// dotted) field path, and each value is either a literal (implicit `$eq`)
/// or an operator object (`{"$gt": 5}`).
pub fn matches(doc: &Value, query: &Value) -> Result<bool> {
    let conditions = query
        .as_object()
        .ok_or_else(|| NexaError::BadQuery("query must be an object".into()))?;

    for (path, condition) in conditions {
        let field_value = doc.get_path(path);
        if !matches_condition(field_value, condition)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_condition(field: Option<&Value>, condition: &Value) -> Result<bool> {
    if let Some(ops) = condition.as_object() {
        if !ops.is_empty() && ops.iter().all(|(k, _)| k.starts_with('$')) {
            for (op, operand) in ops {
                if !apply_operator(op, field, operand)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }
    Ok(values_equal(field, Some(condition)))
}

fn apply_operator(op: &str, field: Option<&Value>, operand: &Value) -> Result<bool> {
    Ok(match op {
        "$eq" => values_equal(field, Some(operand)),
        "$ne" => !values_equal(field, Some(operand)),
        "$gt" => field.and_then(|f| compare(f, operand)) == Some(Ordering::Greater),
        "$gte" => matches!(
            field.and_then(|f| compare(f, operand)),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        "$lt" => field.and_then(|f| compare(f, operand)) == Some(Ordering::Less),
        "$lte" => matches!(
            field.and_then(|f| compare(f, operand)),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        "$in" => {
            let items = operand
                .as_array()
                .ok_or_else(|| NexaError::BadQuery("$in operand must be an array".into()))?;
            items.iter().any(|item| values_equal(field, Some(item)))
        }
        "$nin" => {
            let items = operand
                .as_array()
                .ok_or_else(|| NexaError::BadQuery("$nin operand must be an array".into()))?;
            !items.iter().any(|item| values_equal(field, Some(item)))
        }
        "$exists" => {
            let want = operand.as_bool().unwrap_or(true);
            field.is_some() == want
        }
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| NexaError::BadQuery("$regex operand must be a string".into()))?;
            let re = Regex::new(pattern)
                .map_err(|e| NexaError::BadQuery(format!("invalid regex: {e}")))?;
            field.and_then(Value::as_str).map(|s| re.is_match(s)).unwrap_or(false)
        }
        other => return Err(NexaError::BadQuery(format!("unknown query operator {other}"))),
    })
}

fn values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => value_eq(a, b),
        _ => false,
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    use Value::*;
    match (a, b) {
        (Null, Null) => true,
        (Bool(a), Bool(b)) => a == b,
        (Int(a), Int(b)) => a == b,
        (Float(a), Float(b)) => a == b,
        (Int(a), Float(b)) => *a as f64 == *b,
        (Float(a), Int(b)) => *a == *b as f64,
        (String(a), String(b)) => a == b,
        (Array(a), Array(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| value_eq(x, y)),
        (Object(a), Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, v)| b.iter().any(|(k2, v2)| k == k2 && value_eq(v, v2)))
        }
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    use Value::*;
    match (a, b) {
        (Int(a), Int(b)) => a.partial_cmp(b),
        (Float(a), Float(b)) => a.partial_cmp(b),
        (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
        (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
        (String(a), String(b)) => a.partial_cmp(b),
        (Bool(a), Bool(b)) => a.partial_cmp(b),
        _ => None,
    }
}

/// Runs an aggregation pipeline (a list of single-key stage documents) over
/// `docs` in order.
pub fn run_pipeline(docs: Vec<Value>, stages: &[Value]) -> Result<Vec<Value>> {
    let mut current = docs;
    for stage in stages {
        let obj = stage
            .as_object()
            .ok_or_else(|| NexaError::BadQuery("pipeline stage must be an object".into()))?;
        let (op, arg) = obj
            .first()
            .ok_or_else(|| NexaError::BadQuery("pipeline stage must name one operator".into()))?;

        current = match op.as_str() {
            "$match" => {
                let mut kept = Vec::with_capacity(current.len());
                for doc in current {
                    if matches(&doc, arg)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$project" => current.iter().map(|doc| project(doc, arg)).collect::<Result<Vec<_>>>()?,
            "$group" => group(current, arg)?,
            "$sort" => {
                sort_docs(&mut current, arg)?;
                current
            }
            "$limit" => {
                let n = arg
                    .as_i64()
                    .ok_or_else(|| NexaError::BadQuery("$limit requires an integer".into()))?
                    .max(0) as usize;
                current.into_iter().take(n).collect()
            }
            "$skip" => {
                let n = arg
                    .as_i64()
                    .ok_or_else(|| NexaError::BadQuery("$skip requires an integer".into()))?
                    .max(0) as usize;
                current.into_iter().skip(n).collect()
            }
            other => return Err(NexaError::BadQuery(format!("unknown pipeline stage {other}"))),
        };
    }
    Ok(current)
}

fn project(doc: &Value, spec: &Value) -> Result<Value> {
    let fields = spec
        .as_object()
        .ok_or_else(|| NexaError::BadQuery("$project argument must be an object".into()))?;

    let mut include_id = true;
    let mut out = Vec::new();
    for (field, include) in fields {
        let keep = !matches!(include, Value::Int(0) | Value::Bool(false));
        if field == "_id" {
            include_id = keep;
            continue;
        }
        if keep {
            if let Some(v) = doc.get_path(field) {
                out.push((field.clone(), v.clone()));
            }
        }
    }
    if include_id {
        if let Some(id) = doc.get("_id") {
            out.insert(0, ("_id".to_string(), id.clone()));
        }
    }
    Ok(Value::Object(out))
}

fn group(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>> {
    let fields = spec
        .as_object()
        .ok_or_else(|| NexaError::BadQuery("$group argument must be an object".into()))?;

    let id_expr = fields
        .iter()
        .find(|(k, _)| k == "_id")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| NexaError::BadQuery("$group requires an _id expression".into()))?;
    let accumulators: Vec<(String, Value)> =
        fields.iter().filter(|(k, _)| k != "_id").cloned().collect();

    let mut buckets: Vec<(Value, Vec<Value>)> = Vec::new();
    for doc in docs {
        let key = eval_expr(&doc, &id_expr);
        match buckets.iter().position(|(k, _)| value_eq(k, &key)) {
            Some(pos) => buckets[pos].1.push(doc),
            None => buckets.push((key, vec![doc])),
        }
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (key, members) in buckets {
        let mut entries = vec![("_id".to_string(), key)];
        for (name, accumulator_spec) in &accumulators {
            entries.push((name.clone(), eval_accumulator(accumulator_spec, &members)?));
        }
        out.push(Value::Object(entries));
    }
    Ok(out)
}

fn eval_expr(doc: &Value, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => doc.get_path(&s[1..]).cloned().unwrap_or(Value::Null),
        other => other.clone(),
    }
}

fn eval_accumulator(spec: &Value, members: &[Value]) -> Result<Value> {
    let obj = spec
        .as_object()
        .ok_or_else(|| NexaError::BadQuery("group accumulator must be an object".into()))?;
    let (op, arg) = obj
        .first()
        .ok_or_else(|| NexaError::BadQuery("group accumulator must name one operator".into()))?;

    Ok(match op.as_str() {
        "$count" => Value::Int(members.len() as i64),
        "$sum" => Value::Float(members.iter().filter_map(|m| eval_expr(m, arg).as_f64()).sum()),
        "$avg" => {
            let values: Vec<f64> = members.iter().filter_map(|m| eval_expr(m, arg).as_f64()).collect();
            if values.is_empty() {
                Value::Null
            } else {
                Value::Float(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        "$min" => members
            .iter()
            .filter_map(|m| eval_expr(m, arg).as_f64())
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))))
            .map(Value::Float)
            .unwrap_or(Value::Null),
        "$max" => members
            .iter()
            .filter_map(|m| eval_expr(m, arg).as_f64())
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
            .map(Value::Float)
            .unwrap_or(Value::Null),
        other => return Err(NexaError::BadQuery(format!("unknown group accumulator {other}"))),
    })
}

fn sort_docs(docs: &mut [Value], spec: &Value) -> Result<()> {
    let fields = spec
        .as_object()
        .ok_or_else(|| NexaError::BadQuery("$sort argument must be an object".into()))?
        .to_vec();

    docs.sort_by(|a, b| {
        for (path, direction) in &fields {
            let descending = direction.as_i64().unwrap_or(1) < 0;
            let ord = compare_optional(a.get_path(path), b.get_path(path));
            let ord = if descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(fields: Vec<(&str, Value)>) -> Value {
        Value::Object(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn equality_and_comparison_operators() {
        let doc = obj(vec![("age", Value::Int(30))]);
        assert!(matches(&doc, &obj(vec![("age", Value::Int(30))])).unwrap());
        assert!(matches(&doc, &obj(vec![("age", obj(vec![("$gte", Value::Int(18))]))])).unwrap());
        assert!(!matches(&doc, &obj(vec![("age", obj(vec![("$lt", Value::Int(18))]))])).unwrap());
    }

    #[test]
    fn in_and_exists_operators() {
        let doc = obj(vec![("tag", Value::String("blue".into()))]);
        assert!(matches(
            &doc,
            &obj(vec![(
                "tag",
                obj(vec![("$in", Value::Array(vec![Value::String("blue".into()), Value::String("red".into())]))])
            )])
        )
        .unwrap());
        assert!(matches(&doc, &obj(vec![("missing", obj(vec![("$exists", Value::Bool(false))]))])).unwrap());
    }

    #[test]
    fn regex_operator_matches_substring() {
        let doc = obj(vec![("name", Value::String("hello world".into()))]);
        assert!(matches(&doc, &obj(vec![("name", obj(vec![("$regex", Value::String("wor.d".into()))]))])).unwrap());
    }

    #[test]
    fn invalid_regex_is_a_bad_query_error() {
        let doc = obj(vec![("name", Value::String("x".into()))]);
        let result = matches(&doc, &obj(vec![("name", obj(vec![("$regex", Value::String("(".into()))]))]));
        assert!(matches!(result, Err(NexaError::BadQuery(_))));
    }

    #[test]
    fn dotted_field_path_in_query() {
        let doc = obj(vec![("address", obj(vec![("city", Value::String("nyc".into()))]))]);
        assert!(matches(&doc, &obj(vec![("address.city", Value::String("nyc".into()))])).unwrap());
    }

    #[test]
    fn pipeline_match_project_sort_limit() {
        let docs = vec![
            obj(vec![("name", Value::String("a".into())), ("score", Value::Int(3))]),
            obj(vec![("name", Value::String("b".into())), ("score", Value::Int(1))]),
            obj(vec![("name", Value::String("c".into())), ("score", Value::Int(2))]),
        ];
        let stages = vec![
            obj(vec![("$sort", obj(vec![("score", Value::Int(1))]))]),
            obj(vec![("$limit", Value::Int(2))]),
        ];
        let result = run_pipeline(docs, &stages).unwrap();
        let names: Vec<_> = result.iter().map(|d| d.get("name").unwrap().as_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn pipeline_group_with_sum_and_count() {
        let docs = vec![
            obj(vec![("kind", Value::String("fruit".into())), ("qty", Value::Int(3))]),
            obj(vec![("kind", Value::String("fruit".into())), ("qty", Value::Int(2))]),
            obj(vec![("kind", Value::String("veg".into())), ("qty", Value::Int(5))]),
        ];
        let stages = vec![obj(vec![(
            "$group",
            obj(vec![
                ("_id", Value::String("$kind".into())),
                ("total", obj(vec![("$sum", Value::String("$qty".into()))])),
                ("count", obj(vec![("$count", Value::Object(vec![]))])),
            ]),
        )])];
        let result = run_pipeline(docs, &stages).unwrap();
        assert_eq!(result.len(), 2);
        let fruit = result
            .iter()
            .find(|d| d.get("_id") == Some(&Value::String("fruit".into())))
            .unwrap();
        assert_eq!(fruit.get("total"), Some(&Value::Float(5.0)));
        assert_eq!(fruit.get("count"), Some(&Value::Int(2)));
    }
}

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Related<P, C> {
    pub parent_item: P,
    pub related_items: Vec<C>,
}

/// Records are compared on their serialized form, so a numeric `7` and a
/// textual `"7"` are different values. When the parent has no direct
/// `from_field` and the name contains a `.`, it is walked as a path through
/// nested objects; any missing segment yields no values.
pub fn map_items_as_related<'a, P, C>(
    parents: &'a [P],
    candidates: &'a [C],
    from_field: &str,
    related_field: &str,
) -> Result<Vec<Related<&'a P, &'a C>>, serde_json::Error>
where
    P: Serialize,
    C: Serialize,
{
    let candidate_keys = candidates
        .iter()
        .map(|candidate| {
            serde_json::to_value(candidate).map(|doc| match doc.get(related_field) {
                Some(Value::Null) | None => None,
                Some(v) => Some(v.clone()),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::new();
    for parent in parents {
        let doc = serde_json::to_value(parent)?;
        let from_values = resolve_from_values(&doc, from_field);
        if from_values.is_empty() {
            continue;
        }

        let related_items: Vec<&C> = candidates
            .iter()
            .zip(&candidate_keys)
            .filter_map(|(candidate, key)| match key {
                Some(key) if from_values.contains(key) => Some(candidate),
                _ => None,
            })
            .collect();

        if !related_items.is_empty() {
            out.push(Related {
                parent_item: parent,
                related_items,
            });
        }
    }
    Ok(out)
}

fn resolve_from_values(doc: &Value, field: &str) -> Vec<Value> {
    let direct = doc.get(field).filter(|v| !v.is_null());
    match direct {
        Some(value) => spread(value),
        None if field.contains('.') => field
            .split('.')
            .try_fold(doc, |node, segment| node.get(segment))
            .map(spread)
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

fn spread(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

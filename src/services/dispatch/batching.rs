use std::collections::HashMap;

/// An entry waiting for the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    /// Position in the corpus; results are reassembled by it.
    pub index: usize,
    pub id: String,
    pub text: String,
    /// Entries sharing a group (e.g. singular/plural) travel in one batch.
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub number: usize,
    pub items: Vec<PendingItem>,
}

/// Splits `items` into batches of at most `batch_size`, keeping corpus order.
///
/// A linked group is gathered at the position of its first member and never
/// split; a group larger than `batch_size` becomes one oversized batch.
pub fn plan_batches(items: Vec<PendingItem>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);

    let mut units: Vec<Vec<PendingItem>> = Vec::new();
    let mut group_unit: HashMap<String, usize> = HashMap::new();
    for item in items {
        match item.group.as_ref().and_then(|g| group_unit.get(g).copied()) {
            Some(u) => units[u].push(item),
            None => {
                if let Some(g) = &item.group {
                    group_unit.insert(g.clone(), units.len());
                }
                units.push(vec![item]);
            }
        }
    }

    let mut batches = Vec::new();
    let mut current: Vec<PendingItem> = Vec::new();
    for unit in units {
        if !current.is_empty() && current.len() + unit.len() > batch_size {
            batches.push(std::mem::take(&mut current));
        }
        current.extend(unit);
        if current.len() >= batch_size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }

    batches
        .into_iter()
        .enumerate()
        .map(|(number, items)| Batch { number, items })
        .collect()
}

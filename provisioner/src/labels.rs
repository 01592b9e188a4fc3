use std::collections::BTreeMap;

/// Label carried by every resource belonging to an instance.
pub const PROJECT_LABEL: &str = "project";
/// Value of [`PROJECT_LABEL`].
pub const PROJECT: &str = "ethernetes";
/// Selector matching every resource managed by ethernetes.
pub const PROJECT_LABEL_SELECTOR: &str = "project=ethernetes";

/// Label whose value is the correlation id of the instance.
pub const NUMBER_LABEL: &str = "number";

/// Labels that indicate the resource is managed by ethernetes.
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from_iter(vec![(PROJECT_LABEL.to_owned(), PROJECT.to_owned())])
}

/// Extend the given labels with the managed labels and the correlation id.
pub fn instance_labels_extend(
    labels: BTreeMap<String, String>,
    id: u32,
) -> BTreeMap<String, String> {
    let mut labels = labels;
    labels.extend(managed_labels());
    labels.insert(NUMBER_LABEL.to_owned(), id.to_string());
    labels
}

/// Selector matching the resources of a single instance.
pub fn instance_selector(id: u32) -> String {
    format!("{PROJECT_LABEL_SELECTOR},{NUMBER_LABEL}={id}")
}

/// Selector narrowing an arbitrary selector down to a single instance.
pub fn with_number(selector: &str, id: u32) -> String {
    if selector.is_empty() {
        format!("{NUMBER_LABEL}={id}")
    } else {
        format!("{selector},{NUMBER_LABEL}={id}")
    }
}

/// Reports whether every `key=value` of the selector is present in the labels.
pub fn selects(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

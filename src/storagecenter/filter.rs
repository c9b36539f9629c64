//! Payload filters for `.../GetList` queries
//!
//! API versions before 2.2 take the filter object at the top level of the
//! payload; later versions expect it wrapped under a `filter` key.

use serde::Serialize;
use serde_json::{json, Value};

/// Which payload shape the Data Collector accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterFlavor {
    /// `{"filterType": .., "filters": [..]}`
    #[default]
    Legacy,
    /// `{"filter": {"filterType": .., "filters": [..]}}`
    Wrapped,
}

impl FilterFlavor {
    /// Pick the flavour from the `apiVersion` reported at login
    pub fn for_api_version(version: &str) -> Self {
        let mut parts = version.trim().split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        let major = parts.next().unwrap_or(0);
        let minor = parts.next().unwrap_or(0);
        if (major, minor) >= (2, 2) {
            FilterFlavor::Wrapped
        } else {
            FilterFlavor::Legacy
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct FilterEntry {
    attribute_name: String,
    attribute_value: Value,
    filter_type: String,
}

/// A conjunction (or disjunction) of attribute filters
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadFilter {
    flavor: FilterFlavor,
    filter_type: &'static str,
    filters: Vec<FilterEntry>,
}

impl PayloadFilter {
    /// All conditions must match
    pub fn and(flavor: FilterFlavor) -> Self {
        Self {
            flavor,
            filter_type: "AND",
            filters: Vec::new(),
        }
    }

    /// Add an `Equals` condition
    pub fn equals(self, name: &str, value: impl Into<Value>) -> Self {
        self.condition(name, value, "Equals")
    }

    /// Add a condition with an explicit filter type
    pub fn condition(mut self, name: &str, value: impl Into<Value>, filter_type: &str) -> Self {
        self.filters.push(FilterEntry {
            attribute_name: name.to_string(),
            attribute_value: value.into(),
            filter_type: filter_type.to_string(),
        });
        self
    }

    /// Request body for the query
    pub fn to_payload(&self) -> Value {
        let body = json!({
            "filterType": self.filter_type,
            "filters": self.filters,
        });
        match self.flavor {
            FilterFlavor::Legacy => body,
            FilterFlavor::Wrapped => json!({ "filter": body }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flavor_selection() {
        assert_eq!(FilterFlavor::for_api_version("2.0"), FilterFlavor::Legacy);
        assert_eq!(FilterFlavor::for_api_version("2.1.3"), FilterFlavor::Legacy);
        assert_eq!(FilterFlavor::for_api_version("2.2"), FilterFlavor::Wrapped);
        assert_eq!(FilterFlavor::for_api_version("3.1.0"), FilterFlavor::Wrapped);
        assert_eq!(FilterFlavor::for_api_version("garbage"), FilterFlavor::Legacy);
    }

    #[test]
    fn test_legacy_payload() {
        let payload = PayloadFilter::and(FilterFlavor::Legacy)
            .equals("scSerialNumber", 448)
            .equals("Name", "vol-1")
            .to_payload();

        assert_eq!(payload["filterType"], "AND");
        assert_eq!(payload["filters"][0]["attributeName"], "scSerialNumber");
        assert_eq!(payload["filters"][0]["attributeValue"], 448);
        assert_eq!(payload["filters"][1]["filterType"], "Equals");
    }

    #[test]
    fn test_wrapped_payload() {
        let payload = PayloadFilter::and(FilterFlavor::Wrapped)
            .equals("instanceName", "iqn.1993-08.org.debian:01:abc")
            .to_payload();

        assert!(payload.get("filters").is_none());
        assert_eq!(
            payload["filter"]["filters"][0]["attributeValue"],
            "iqn.1993-08.org.debian:01:abc"
        );
    }
}

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::rules::types::ListLookup;

/// Named address lists a rule can test the counterparty against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListName {
    Sdn,
    Mixer,
    Cex,
    Bridge,
}

/// Lowercased address sets supplied by upstream collectors.
/// Passed explicitly into every component that needs them.
#[derive(Debug, Clone, Default)]
pub struct AddressLists {
    pub sdn: HashSet<String>,
    pub mixer: HashSet<String>,
    pub cex: HashSet<String>,
    pub bridge: HashSet<String>,
}

impl AddressLists {
    /// Load the SDN seed list (required) and the optional auxiliary lists.
    pub fn load(
        sdn_path: &Path,
        mixer_path: Option<&Path>,
        cex_path: Option<&Path>,
        bridge_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let optional = |path: Option<&Path>| match path {
            Some(p) => load_address_list(p),
            None => Ok(HashSet::new()),
        };

        let lists = Self {
            sdn: load_address_list(sdn_path)?,
            mixer: optional(mixer_path)?,
            cex: optional(cex_path)?,
            bridge: optional(bridge_path)?,
        };

        tracing::info!(
            sdn = lists.sdn.len(),
            mixer = lists.mixer.len(),
            cex = lists.cex.len(),
            bridge = lists.bridge.len(),
            "Loaded address lists"
        );
        Ok(lists)
    }

    pub fn get(&self, list: ListName) -> &HashSet<String> {
        match list {
            ListName::Sdn => &self.sdn,
            ListName::Mixer => &self.mixer,
            ListName::Cex => &self.cex,
            ListName::Bridge => &self.bridge,
        }
    }
}

impl ListLookup for AddressLists {
    fn contains(&self, list: ListName, address: &str) -> bool {
        self.get(list).contains(address)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListDocument {
    Flat(Vec<String>),
    Wrapped { addresses: Vec<String> },
}

/// Read a JSON address list: either `["0x..", ...]` or `{"addresses": [...]}`.
pub fn load_address_list(path: &Path) -> Result<HashSet<String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_address_list(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub fn parse_address_list(content: &str) -> Result<HashSet<String>, serde_json::Error> {
    let addresses = match serde_json::from_str::<ListDocument>(content)? {
        ListDocument::Flat(addresses) => addresses,
        ListDocument::Wrapped { addresses } => addresses,
    };
    Ok(addresses
        .into_iter()
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_and_wrapped_lists() {
        let flat = parse_address_list(r#"["0xABC", " 0xdef ", ""]"#).unwrap();
        assert_eq!(flat.len(), 2);
        assert!(flat.contains("0xabc"));
        assert!(flat.contains("0xdef"));

        let wrapped = parse_address_list(r#"{"addresses": ["0xAAA"]}"#).unwrap();
        assert!(wrapped.contains("0xaaa"));

        assert!(parse_address_list(r#"{"other": 1}"#).is_err());
    }

    #[test]
    fn test_missing_optional_lists_are_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let sdn = dir.path().join("sdn.json");
        std::fs::write(&sdn, r#"["0x01"]"#).unwrap();

        let lists = AddressLists::load(&sdn, None, None, None).unwrap();
        assert!(lists.contains(ListName::Sdn, "0x01"));
        assert!(!lists.contains(ListName::Mixer, "0x01"));
    }

    #[test]
    fn test_missing_sdn_list_is_config_error() {
        let err = AddressLists::load(Path::new("/nonexistent/sdn.json"), None, None, None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

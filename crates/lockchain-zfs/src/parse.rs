//! Parsing for `-H` (scripted mode) `zfs`/`zpool` output.

use lockchain_provider::KeyState;

/// Split tab separated scripted output into rows of exactly `columns` fields.
///
/// Blank lines and rows with the wrong arity are skipped.
pub(crate) fn parse_rows(output: &str, columns: usize) -> Vec<Vec<String>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<String> = line.split('\t').map(|f| f.trim().to_string()).collect();
            (fields.len() == columns && !fields[0].is_empty()).then_some(fields)
        })
        .collect()
}

/// `property<TAB>value` rows as pairs.
pub(crate) fn parse_pairs(output: &str) -> Vec<(String, String)> {
    parse_rows(output, 2)
        .into_iter()
        .filter_map(|mut row| {
            let value = row.pop()?;
            let name = row.pop()?;
            Some((name, value))
        })
        .collect()
}

/// Pool name prefix of a dataset identifier.
pub(crate) fn pool_from_dataset(dataset: &str) -> Option<&str> {
    dataset.split('/').next().filter(|pool| !pool.is_empty())
}

/// Map the `keystatus` property onto the provider tri-state.
pub(crate) fn parse_keystatus(value: &str) -> KeyState {
    match value.trim() {
        "available" => KeyState::Unlocked,
        "unavailable" => KeyState::Locked,
        "" | "-" | "none" => KeyState::Unavailable("dataset is not encrypted".into()),
        other => KeyState::Unavailable(format!("unrecognised keystatus `{other}`")),
    }
}

/// `encryptionroot` reports `-` for unencrypted datasets.
pub(crate) fn parse_encryption_root(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty() && value != "-").then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_require_matching_arity() {
        let out = "tank/secure\ttank/secure\tunavailable\n\ntank/plain\t-\n";
        assert_eq!(
            parse_rows(out, 3),
            vec![vec![
                "tank/secure".to_string(),
                "tank/secure".to_string(),
                "unavailable".to_string()
            ]]
        );
    }

    #[test]
    fn pairs_from_property_output() {
        let out = "encryptionroot\ttank/secure\nkeystatus\tavailable\n";
        assert_eq!(
            parse_pairs(out),
            vec![
                ("encryptionroot".to_string(), "tank/secure".to_string()),
                ("keystatus".to_string(), "available".to_string()),
            ]
        );
    }

    #[test]
    fn pool_prefix() {
        assert_eq!(pool_from_dataset("tank/secure"), Some("tank"));
        assert_eq!(pool_from_dataset("tank"), Some("tank"));
        assert_eq!(pool_from_dataset("/invalid"), None);
    }

    #[test]
    fn keystatus_values() {
        assert_eq!(parse_keystatus("available"), KeyState::Unlocked);
        assert_eq!(parse_keystatus("unavailable\n"), KeyState::Locked);
        assert!(matches!(parse_keystatus("-"), KeyState::Unavailable(_)));
        assert_eq!(parse_encryption_root("-"), None);
        assert_eq!(parse_encryption_root("tank\n").as_deref(), Some("tank"));
    }
}

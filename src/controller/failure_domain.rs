//! Placement of machines into failure domains

use std::collections::BTreeMap;

use flate2::Crc;

use crate::crd::FailureDomainSpec;
use crate::error::{Error, Result};

/// CRC-32 (IEEE) of the machine name
pub fn machine_name_checksum(machine_name: &str) -> u32 {
    let mut crc = Crc::new();
    crc.update(machine_name.as_bytes());
    crc.sum()
}

/// Pick a failure domain for a machine without an explicit one.
///
/// Eligible domains are sorted by name and indexed with `crc32(name) mod len`, so the result
/// only depends on the machine name and the domain set.
pub fn select_failure_domain(
    failure_domains: &BTreeMap<String, FailureDomainSpec>,
    machine_name: &str,
    control_plane: bool,
) -> Result<String> {
    // BTreeMap keys are already in lexical order
    let eligible: Vec<&String> = failure_domains
        .iter()
        .filter(|(_, spec)| !control_plane || spec.control_plane)
        .map(|(name, _)| name)
        .collect();

    if eligible.is_empty() {
        return Err(Error::ValidationError(
            "no failure domains available for machine".to_string(),
        ));
    }

    let index = machine_name_checksum(machine_name) as usize % eligible.len();
    Ok(eligible[index].clone())
}

/// Explicit failure domain of the machine, or a derived one.
pub fn resolve_failure_domain(
    explicit: Option<&str>,
    failure_domains: &BTreeMap<String, FailureDomainSpec>,
    machine_name: &str,
    control_plane: bool,
) -> Result<String> {
    match explicit {
        Some(domain) if !domain.is_empty() => Ok(domain.to_string()),
        _ => select_failure_domain(failure_domains, machine_name, control_plane),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains(entries: &[(&str, bool)]) -> BTreeMap<String, FailureDomainSpec> {
        entries
            .iter()
            .map(|(name, cp)| (name.to_string(), FailureDomainSpec { control_plane: *cp }))
            .collect()
    }

    #[test]
    fn test_checksum_matches_ieee_crc32() {
        assert_eq!(machine_name_checksum("m1"), 3_226_732_335);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let set = domains(&[("nbg1", true), ("fsn1", true)]);
        let first = select_failure_domain(&set, "m1", false).unwrap();
        for _ in 0..10 {
            assert_eq!(select_failure_domain(&set, "m1", false).unwrap(), first);
        }
        assert_eq!(first, "nbg1");
    }

    #[test]
    fn test_domain_set_change_may_reassign() {
        let set = domains(&[("fsn1", true), ("hel1", true), ("nbg1", true)]);
        assert_eq!(select_failure_domain(&set, "m1", false).unwrap(), "fsn1");
    }

    #[test]
    fn test_control_plane_skips_worker_only_domains() {
        let set = domains(&[("fsn1", false), ("nbg1", true)]);
        assert_eq!(select_failure_domain(&set, "m1", true).unwrap(), "nbg1");
        assert!(select_failure_domain(&domains(&[("fsn1", false)]), "m1", true).is_err());
    }

    #[test]
    fn test_explicit_domain_wins() {
        let set = domains(&[("fsn1", true)]);
        assert_eq!(
            resolve_failure_domain(Some("hel1"), &set, "m1", true).unwrap(),
            "hel1"
        );
        assert_eq!(resolve_failure_domain(Some(""), &set, "m1", true).unwrap(), "fsn1");
    }
}

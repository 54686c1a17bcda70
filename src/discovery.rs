// Resource Discovery
//
// Translates between (cluster, node number) and provider resources.
// Cloud resources carry tags; container resources encode both values in
// their name as `<prefix><cluster>_<node>`.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Reported for nodes whose address has not been assigned yet
pub const ADDRESS_NOT_ASSIGNED: &str = "N/A";

/// Cloud instance state code for terminated instances
pub const STATE_TERMINATED: i64 = 48;

/// Container or instance name for a node
pub fn node_name(prefix: &str, cluster: &str, node: u32) -> String {
    format!("{}{}_{}", prefix, cluster, node)
}

/// Split a resource name into cluster name and node suffix. The split is on
/// the last `_`, so cluster names may themselves contain underscores.
pub fn split_node_name<'a>(prefix: &str, name: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = name.strip_prefix(prefix)?;
    let (cluster, suffix) = rest.rsplit_once('_')?;
    if cluster.is_empty() {
        return None;
    }
    Some((cluster, suffix))
}

/// Node number of `name` when it belongs to `cluster`. A matching name with
/// an undecodable suffix is corrupt, not foreign.
pub fn node_in_cluster(prefix: &str, cluster: &str, name: &str) -> Result<Option<u32>> {
    match split_node_name(prefix, name) {
        Some((c, suffix)) if c == cluster => decode_node_number(name, suffix).map(Some),
        _ => Ok(None),
    }
}

/// Parse a node number marker
pub fn decode_node_number(resource: &str, raw: &str) -> Result<u32> {
    match raw.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::corrupt(
            resource,
            format!("node number '{}' is not a positive integer", raw),
        )),
    }
}

/// Sorted, de-duplicated cluster names
pub fn distinct_clusters<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(Into::into)
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

/// Node numbers for `count` new nodes. Numbering continues after the
/// highest existing node; gaps left by destroyed nodes are never refilled.
pub fn allocate_node_numbers(existing: &[u32], count: u32) -> Result<Vec<u32>> {
    let highest = existing.iter().copied().max().unwrap_or(0);
    let range = highest
        .checked_add(1)
        .and_then(|start| start.checked_add(count).map(|end| start..end));
    match range {
        Some(range) => Ok(range.collect()),
        None => Err(Error::invalid(format!(
            "cannot add {} nodes after node {}: node numbers exhausted",
            count, highest
        ))),
    }
}

/// Names become part of resource names and tag filters
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("cluster name must not be empty"));
    }
    if name.len() > 64 {
        return Err(Error::invalid(format!("cluster name '{}' is longer than 64 characters", name)));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(Error::invalid(format!(
            "cluster name '{}' may only contain letters, digits, '_', '-' and '.'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_is_right_anchored() {
        assert_eq!(split_node_name("aerolab-", "aerolab-mydc_3"), Some(("mydc", "3")));
        assert_eq!(
            split_node_name("aerolab-", "aerolab-my_big_dc_12"),
            Some(("my_big_dc", "12"))
        );
        assert_eq!(split_node_name("aerolab-", "aerolab_c-mydc_1"), None);
        assert_eq!(split_node_name("aerolab-", "aerolab-nounderscore"), None);
        assert_eq!(split_node_name("aerolab-", "aerolab-_1"), None);
    }

    #[test]
    fn test_node_in_cluster() {
        assert_eq!(node_in_cluster("aero-", "dc", "aero-dc_2").unwrap(), Some(2));
        assert_eq!(node_in_cluster("aero-", "dc", "aero-other_2").unwrap(), None);
        // "dc_x" is a node of cluster "dc" with a broken number
        let err = node_in_cluster("aero-", "dc", "aero-dc_x").unwrap_err();
        assert!(matches!(err, Error::CorruptResource { .. }));
        // but from the point of view of cluster "dc_1" the node "aero-dc_1_2" is fine
        assert_eq!(node_in_cluster("aero-", "dc_1", "aero-dc_1_2").unwrap(), Some(2));
    }

    #[test]
    fn test_decode_rejects_garbage_and_zero() {
        assert_eq!(decode_node_number("i-1", "7").unwrap(), 7);
        assert!(decode_node_number("i-1", "seven").is_err());
        assert!(decode_node_number("i-1", "0").is_err());
        assert!(decode_node_number("i-1", "-1").is_err());
    }

    #[test]
    fn test_allocation_never_reuses_numbers() {
        assert_eq!(allocate_node_numbers(&[], 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(allocate_node_numbers(&[1, 2, 3, 4, 5], 2).unwrap(), vec![6, 7]);
        // node 3 of 5 destroyed, grow by one
        assert_eq!(allocate_node_numbers(&[1, 2, 4, 5], 1).unwrap(), vec![6]);
        assert!(allocate_node_numbers(&[1], 0).unwrap().is_empty());
    }

    #[test]
    fn test_allocation_at_the_top_of_the_range() {
        let err = allocate_node_numbers(&[1, u32::MAX], 1).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{}", err);
        assert!(allocate_node_numbers(&[u32::MAX - 2], 2).is_err());
        assert_eq!(
            allocate_node_numbers(&[u32::MAX - 3], 2).unwrap(),
            vec![u32::MAX - 2, u32::MAX - 1]
        );
    }

    #[test]
    fn test_distinct_clusters_sorted() {
        let names = distinct_clusters(vec!["b", "a", "b", "c"]);
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cluster_name_validation() {
        assert!(validate_cluster_name("mydc").is_ok());
        assert!(validate_cluster_name("my_dc-1.test").is_ok());
        assert!(validate_cluster_name("").is_err());
        assert!(validate_cluster_name("my dc").is_err());
        assert!(validate_cluster_name("dc;rm").is_err());
    }
}

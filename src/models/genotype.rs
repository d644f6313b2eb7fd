//! NAS-Bench-201 genotype strings
//!
//! A genotype lists, node by node, the operation on every incoming edge:
//! `|op~0|+|op~0|op~1|+|op~0|op~1|op~2|`.

use std::collections::BTreeMap;

use crate::error::{NasError, Result};
use crate::nas::Subnet;

/// Edge aliases in genotype order, as `(source, target)` node pairs
pub const NB201_EDGES: [(usize, usize); 6] = [(0, 1), (0, 2), (1, 2), (0, 3), (1, 3), (2, 3)];

pub(crate) fn edge_alias(from: usize, to: usize) -> String {
    format!("edge_{from}_{to}")
}

/// Encode a subnet as a genotype string
pub fn genotype(subnet: &Subnet, alias2group_id: &BTreeMap<String, usize>) -> Result<String> {
    let mut nodes: Vec<Vec<String>> = vec![Vec::new(); 3];
    for (from, to) in NB201_EDGES {
        let alias = edge_alias(from, to);
        let gid = alias2group_id
            .get(&alias)
            .ok_or_else(|| NasError::MutatorError(format!("no search group for `{alias}`")))?;
        let op = subnet
            .get(gid)
            .ok_or_else(|| NasError::MutatorError(format!("subnet has no choice for group {gid}")))?;
        nodes[to - 1].push(format!("{op}~{from}"));
    }
    Ok(nodes
        .iter()
        .map(|edges| format!("|{}|", edges.join("|")))
        .collect::<Vec<_>>()
        .join("+"))
}

/// Decode a genotype string into a subnet
pub fn parse_genotype(arch: &str, alias2group_id: &BTreeMap<String, usize>) -> Result<Subnet> {
    let malformed = || NasError::ConfigError(format!("malformed genotype `{arch}`"));
    let mut subnet = Subnet::new();
    let nodes: Vec<&str> = arch.split('+').collect();
    if nodes.len() != 3 {
        return Err(malformed());
    }
    for (node, spec) in nodes.iter().enumerate() {
        let to = node + 1;
        let edges: Vec<&str> = spec
            .trim_matches('|')
            .split('|')
            .filter(|s| !s.is_empty())
            .collect();
        if edges.len() != to {
            return Err(malformed());
        }
        for edge in edges {
            let (op, from) = edge.split_once('~').ok_or_else(malformed)?;
            let from: usize = from.parse().map_err(|_| malformed())?;
            if from >= to {
                return Err(malformed());
            }
            let alias = edge_alias(from, to);
            let gid = alias2group_id
                .get(&alias)
                .ok_or_else(|| NasError::MutatorError(format!("no search group for `{alias}`")))?;
            subnet.insert(*gid, op.to_string());
        }
    }
    Ok(subnet)
}

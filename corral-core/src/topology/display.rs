//! Textual rendering of a cluster's replication tree.

use std::collections::HashMap;

use crate::error::Result;
use crate::instance::{Instance, InstanceKey};
use crate::topology::Topology;

const FILLER: &str = " ";

/// Recursively render the tree rooted at `instance`, one line per node.
/// Running, healthy replicas get a `+` connector; broken ones a `-`.
fn ascii_topology_entry(
    depth: usize,
    instance: &Instance,
    replication_map: &HashMap<InstanceKey, Vec<&Instance>>,
    extended_output: bool,
) -> Vec<String> {
    if instance.is_co_main && depth > 1 {
        // Co-main pairs are the only legal cycles; stop the recursion here.
        return Vec::new();
    }
    let mut prefix = String::new();
    if depth > 0 {
        prefix.push_str(&FILLER.repeat((depth - 1) * 2));
        if instance.replica_running() && instance.is_last_check_valid && instance.is_recently_checked
        {
            prefix.push_str("+ ");
        } else {
            prefix.push_str("- ");
        }
    }
    let mut entry = format!("{prefix}{}", instance.key);
    if extended_output {
        entry = format!("{entry} {}", instance.human_readable_description());
    }
    let mut result = vec![entry];
    if let Some(replicas) = replication_map.get(&instance.key) {
        for replica in replicas {
            result.extend(ascii_topology_entry(
                depth + 1,
                replica,
                replication_map,
                extended_output,
            ));
        }
    }
    result
}

/// Right-align the description columns on the `[` bracket.
fn align_brackets(entries: Vec<String>) -> Vec<String> {
    let max_indent = entries
        .iter()
        .filter_map(|entry| entry.find('['))
        .max()
        .unwrap_or(0);
    entries
        .into_iter()
        .map(|entry| match entry.find('[') {
            Some(indent) if indent < max_indent => {
                let (head, tail) = entry.split_at(indent);
                format!("{head}{}{tail}", FILLER.repeat(max_indent - indent))
            }
            _ => entry,
        })
        .collect()
}

impl Topology {
    /// A string representation of a cluster's replication topology, rooted
    /// at its main (or at each co-main when no single root exists).
    pub async fn ascii_topology(&self, cluster: &str, extended_output: bool) -> Result<String> {
        let instances = self.repository.read_cluster_instances(cluster).await?;

        let mut instances_map: HashMap<InstanceKey, &Instance> = HashMap::new();
        for instance in &instances {
            instances_map.insert(instance.key.clone(), instance);
        }

        let mut replication_map: HashMap<InstanceKey, Vec<&Instance>> = HashMap::new();
        let mut main_instance: Option<&Instance> = None;
        for instance in &instances {
            if instances_map.contains_key(&instance.main_key) {
                replication_map
                    .entry(instance.main_key.clone())
                    .or_default()
                    .push(instance);
            } else {
                main_instance = Some(instance);
            }
        }
        for replicas in replication_map.values_mut() {
            replicas.sort_by(|a, b| a.key.cmp(&b.key));
        }

        let mut entries = Vec::new();
        match main_instance {
            Some(main) => {
                entries.extend(ascii_topology_entry(
                    0,
                    main,
                    &replication_map,
                    extended_output,
                ));
            }
            None => {
                // Co-mains only: render each in its own branch, ignoring
                // its partner.
                for instance in &instances {
                    if instance.is_co_main {
                        entries.extend(ascii_topology_entry(
                            1,
                            instance,
                            &replication_map,
                            extended_output,
                        ));
                    }
                }
            }
        }
        if extended_output {
            entries = align_brackets(entries);
        }
        Ok(entries.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::BinlogCoordinates;

    fn node(host: &str, main: Option<&str>) -> Instance {
        Instance {
            key: InstanceKey::new(host, 3306),
            main_key: main
                .map(|main| InstanceKey::new(main, 3306))
                .unwrap_or_default(),
            cluster_name: "alpha".to_string(),
            version: "8.0.32".to_string(),
            exec_binlog_coordinates: BinlogCoordinates::new("bin.000001", 100),
            replication_sql_running: main.is_some(),
            replication_io_running: main.is_some(),
            is_last_check_valid: true,
            is_recently_checked: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_entry_rendering() {
        let main = node("m", None);
        let replica_a = node("a", Some("m"));
        let replica_b = node("b", Some("m"));
        let mut replication_map: HashMap<InstanceKey, Vec<&Instance>> = HashMap::new();
        replication_map.insert(main.key.clone(), vec![&replica_a, &replica_b]);

        let entries = ascii_topology_entry(0, &main, &replication_map, false);
        assert_eq!(entries, vec!["m:3306", "+ a:3306", "+ b:3306"]);
    }

    #[test]
    fn test_broken_replica_marker() {
        let main = node("m", None);
        let mut broken = node("a", Some("m"));
        broken.replication_sql_running = false;
        let mut replication_map: HashMap<InstanceKey, Vec<&Instance>> = HashMap::new();
        replication_map.insert(main.key.clone(), vec![&broken]);

        let entries = ascii_topology_entry(0, &main, &replication_map, false);
        assert_eq!(entries[1], "- a:3306");
    }

    #[test]
    fn test_align_brackets() {
        let aligned = align_brackets(vec![
            "m:3306 [x]".to_string(),
            "+ a:3306 [y]".to_string(),
        ]);
        assert_eq!(aligned[0], "m:3306   [x]");
        assert_eq!(aligned[1], "+ a:3306 [y]");
    }
}
